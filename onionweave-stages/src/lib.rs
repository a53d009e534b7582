pub mod analyzer;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod pipeline;
pub mod result;

pub use analyzer::Analyzer;
pub use error::StageError;
pub use extractor::Extractor;
pub use fetcher::{Fetcher, FetcherSettings};
pub use pipeline::{build_worker, PoolWorker};
pub use result::FetchResult;
