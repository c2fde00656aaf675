//! shelfsync reconcile: publication parsing, filename matching, catalog
//! deduplication, file attachment, and the download queue worker.

pub mod attach;
pub mod blob;
pub mod channel;
pub mod dedup;
pub mod error;
pub mod filename;
pub mod orchestrator;
pub mod parser;
pub mod scorer;
pub mod services;
pub mod worker;

pub use attach::{AttachOutcome, FileAttacher, SkipReason};
pub use dedup::{DedupOutcome, deduplicate};
pub use error::{ReconcileError, Result};
pub use filename::{ExtractedMetadata, extract_from_filename, search_terms};
pub use orchestrator::{Orchestrator, ProcessOutcome};
pub use parser::{ParsedPublication, SubBook, parse_publication};
pub use scorer::{MatchScorer, ScoredCandidate};
pub use services::Services;
pub use worker::{TaskResult, Worker, WorkerStats};
