pub mod aggregator;
pub mod browser;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod delay_manager;
pub mod engine;
pub mod error;
pub mod exporter;
pub mod extractor;
pub mod input_loader;
pub mod logger;
pub mod model;
pub mod pipeline;
pub mod resolver;
pub mod search_engine;
pub mod stages;
pub mod verifier_api;

// Exporting types for convenience
pub use config::EnricherConfig;
pub use engine::{LookupContext, LookupEngine};
pub use error::{ConfigError, LoadError, ResolveError, StageError};
pub use exporter::CsvReporter;
pub use model::{Candidate, Record, ResultRow, RowStatus, Verdict, VerdictStatus};
pub use pipeline::{LogReporter, Pipeline, Progress, ProgressReporter, RunControl, RunReport};
pub use resolver::CandidateResolver;
