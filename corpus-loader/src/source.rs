//! Upstream corpus sources.

use async_trait::async_trait;
use corpus_core::{FetchError, FetchSettings, FilterSet};
use reqwest::header::ACCEPT;
use reqwest::Url;
use tracing::debug;

/// Longest error body kept in a [`FetchError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Read interface to the remote corpus store.
///
/// Must be idempotent for identical parameters; the loader retries and
/// collapses calls freely.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    /// Fetch the raw body for a corpus type under the given filters.
    async fn fetch(&self, corpus_type: &str, filters: &FilterSet) -> Result<String, FetchError>;
}

/// `GET {base_url}/corpora/{corpus_type}?name=value&...` over reqwest.
///
/// The corpus type is always a single percent-encoded path segment.
/// Multi-valued filters repeat the query parameter once per value, in sorted
/// order. Timeouts are left to the caller's [`RetryPolicy`](crate::RetryPolicy).
#[derive(Debug, Clone)]
pub struct HttpCorpusSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpCorpusSource {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().build().map_err(transport)?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, FetchError> {
        let invalid = |reason: String| FetchError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let mut parsed = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("cannot carry a path".to_string()));
        }
        parsed.set_query(None);
        parsed.set_fragment(None);
        Ok(Self {
            client,
            base_url: parsed,
        })
    }

    pub fn from_settings(settings: &FetchSettings) -> Result<Self, FetchError> {
        Self::new(&settings.base_url)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of one corpus type, with the type escaped as a path segment.
    pub fn corpus_url(&self, corpus_type: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .push("corpora")
            .push(corpus_type);
        Ok(url)
    }

    fn query(filters: &FilterSet) -> Vec<(&str, &str)> {
        filters
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |value| (name, value.as_str())))
            .collect()
    }
}

#[async_trait]
impl CorpusSource for HttpCorpusSource {
    async fn fetch(&self, corpus_type: &str, filters: &FilterSet) -> Result<String, FetchError> {
        let url = self.corpus_url(corpus_type)?;
        debug!(url = %url, filters = filters.iter().count(), "Fetching corpus");

        let response = self
            .client
            .get(url)
            .query(&Self::query(filters))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: truncate(body, MAX_ERROR_BODY),
            });
        }
        Ok(body)
    }
}

fn transport(e: reqwest::Error) -> FetchError {
    FetchError::Transport {
        reason: e.to_string(),
    }
}

fn truncate(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}
