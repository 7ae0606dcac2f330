//! Corpus Loader - Caller-Facing Corpus Access
//!
//! [`CorpusLoader::load`] returns a corpus and the tier that served it
//! (memory, persistent or network). On a full cache miss it fetches from a
//! [`CorpusSource`] under a [`RetryPolicy`], parses the upstream records and
//! writes the result back through the tiered store.

pub mod loader;
pub mod parse;
pub mod retry;
pub mod source;

pub use loader::{CorpusLoader, LoadedCorpus, LoaderConfig};
pub use parse::parse_corpus;
pub use retry::RetryPolicy;
pub use source::{CorpusSource, HttpCorpusSource};
