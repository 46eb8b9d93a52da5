//! Post Image Enrichment
//!
//! Runs an object-detection model over images attached to channel posts,
//! derives a coarse content category for each image, and persists one
//! enrichment record per image for downstream analytics.
//!
//! # Architecture
//!
//! The run is a batch with two durable phases:
//!
//! 1. **Stage**: discover assets, infer, classify, and write an immutable
//!    JSON Lines artifact. Per-image failures are skipped and counted.
//! 2. **Load**: create the warehouse table if absent and insert every staged
//!    row in one transaction. Any bad row rolls the whole load back.
//!
//! # Module Structure
//!
//! - `assets`: image discovery and message id extraction
//! - `detect`: detection types, the `Detector` capability, backends
//! - `classify`: detection set → content category
//! - `enrich`: the per-asset loop and batch report
//! - `staging`: artifact writer and reader
//! - `warehouse`: SQLite schema, transactional load, consumer queries
//! - `pipeline`: phase orchestration and replay
//! - `config`: one explicit configuration record

pub mod assets;
pub mod classify;
pub mod config;
pub mod detect;
pub mod enrich;
pub mod error;
pub mod pipeline;
pub mod staging;
pub mod warehouse;

pub use assets::{extract_message_id, AssetLocator, ImageAsset};
pub use classify::{classify, ContentCategory};
pub use config::{DetectorSettings, PipelineConfig, WarehouseSettings};
#[cfg(feature = "backend-tract")]
pub use detect::TractDetector;
pub use detect::{Detection, DetectionSet, Detector, InferenceError, StubDetector};
pub use enrich::{AssetOutcome, Aggregator, BatchReport, EnrichmentRecord, SkipReason};
pub use error::PipelineError;
pub use pipeline::RunSummary;
pub use staging::{read_staged, StagingWriter};
pub use warehouse::{LoadMode, WarehouseLoader, WarehouseRow};
