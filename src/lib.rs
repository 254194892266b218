pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod history;
pub mod inflection;
pub mod llm;
pub mod matcher;
pub mod metadata;
pub mod pipeline;
pub mod planner;
pub mod schema_rag;
pub mod sql;

pub use config::EngineConfig;
pub use error::{NlqError, Result};
pub use metadata::SemanticModel;
pub use pipeline::{NlqPipeline, PipelineOutcome};
