//! Worker message protocol.
//!
//! Request `{action, data, id}`, response `{result, error?, id}`. Any
//! replacement worker must honor this shape exactly; responses are matched
//! to requests by `id` alone, never by arrival order.

use std::sync::mpsc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::codec::{compress_text, decompress_text};

/// Operation requested from the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerAction {
    Compress,
    Decompress,
}

impl WorkerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerAction::Compress => "compress",
            WorkerAction::Decompress => "decompress",
        }
    }
}

/// A request sent to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub action: WorkerAction,
    pub data: String,
    pub id: String,
}

/// A response sent back by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub id: String,
}

impl WorkerResponse {
    pub fn ok(id: impl Into<String>, result: Option<String>) -> Self {
        Self {
            result,
            error: None,
            id: id.into(),
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
            id: id.into(),
        }
    }
}

/// Execute one request in the calling thread.
///
/// A payload that cannot be decompressed answers `result: null` rather than
/// an error, so the caller sees a miss instead of a failure.
pub fn handle_request(request: &WorkerRequest) -> WorkerResponse {
    match request.action {
        WorkerAction::Compress => {
            WorkerResponse::ok(request.id.clone(), Some(compress_text(&request.data)))
        }
        WorkerAction::Decompress => {
            WorkerResponse::ok(request.id.clone(), decompress_text(&request.data))
        }
    }
}

/// Worker loop: serve requests until the inbox closes or the outbox is gone.
pub fn serve(inbox: mpsc::Receiver<WorkerRequest>, outbox: UnboundedSender<WorkerResponse>) {
    while let Ok(request) = inbox.recv() {
        let response = handle_request(&request);
        if outbox.send(response).is_err() {
            debug!(id = %request.id, "Response channel closed, worker exiting");
            return;
        }
    }
    debug!("Request channel closed, worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = WorkerRequest {
            action: WorkerAction::Compress,
            data: "hola".to_string(),
            id: "42".to_string(),
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value, json!({"action": "compress", "data": "hola", "id": "42"}));
    }

    #[test]
    fn test_response_wire_shape() {
        let ok = WorkerResponse::ok("1", Some("abc".to_string()));
        assert_eq!(
            serde_json::to_value(&ok).expect("serialize"),
            json!({"result": "abc", "id": "1"})
        );

        let miss = WorkerResponse::ok("2", None);
        assert_eq!(
            serde_json::to_value(&miss).expect("serialize"),
            json!({"result": null, "id": "2"})
        );

        let failed: WorkerResponse =
            serde_json::from_value(json!({"result": null, "error": "boom", "id": "3"}))
                .expect("deserialize");
        assert_eq!(failed, WorkerResponse::failed("3", "boom"));
    }

    #[test]
    fn test_handle_request_round_trip() {
        let compressed = handle_request(&WorkerRequest {
            action: WorkerAction::Compress,
            data: "vidala".to_string(),
            id: "a".to_string(),
        });
        assert_eq!(compressed.id, "a");
        let payload = compressed.result.expect("compress result");

        let decompressed = handle_request(&WorkerRequest {
            action: WorkerAction::Decompress,
            data: payload,
            id: "b".to_string(),
        });
        assert_eq!(decompressed.result.as_deref(), Some("vidala"));
        assert_eq!(decompressed.error, None);
    }

    #[test]
    fn test_handle_request_corrupt_is_null_result() {
        let response = handle_request(&WorkerRequest {
            action: WorkerAction::Decompress,
            data: "%%%".to_string(),
            id: "c".to_string(),
        });
        assert_eq!(response.result, None);
        assert_eq!(response.error, None);
    }

    #[test]
    fn test_serve_answers_in_order_received() {
        let (tx, rx) = mpsc::channel();
        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel();
        for id in ["x", "y"] {
            tx.send(WorkerRequest {
                action: WorkerAction::Compress,
                data: id.to_string(),
                id: id.to_string(),
            })
            .expect("send");
        }
        drop(tx);
        serve(rx, out_tx);

        let first = out_rx.try_recv().expect("first response");
        let second = out_rx.try_recv().expect("second response");
        assert_eq!(first.id, "x");
        assert_eq!(second.id, "y");
    }
}
