pub mod batch;
pub mod config;
pub mod error;
pub mod literal;
pub mod normalize;
pub mod opportunity;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod tagger;

pub use batch::{batches, Batch, Batches};
pub use config::Config;
pub use error::{Error, Result};
pub use normalize::{NormalizeError, NormalizeResult, Normalizer};
pub use opportunity::{GrantRecord, RawDocument, TagRecord, TagSchema};
pub use pipeline::{
    BatchError, BatchFailure, PipelineConfig, PipelineError, PipelineResult, RunReport,
    TaggingPipeline,
};
pub use retry::{CircuitBreaker, RetryPolicy};
pub use store::{OpportunityStore, PersistMode, SqlStore, StoredDocument, WriteReport};
pub use tagger::{
    CompletionClient, CompletionConfig, CompletionError, GrantTagger, HttpCompletionClient,
    TaggingError,
};
