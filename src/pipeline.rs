//! Two-phase enrichment run.
//!
//! Phase 1 scans, infers and writes an immutable staging artifact. Phase 2
//! loads that artifact in one transaction. A failed phase 2 leaves the
//! artifact in place so it can be replayed with [`replay`].

use std::path::PathBuf;

use crate::config::PipelineConfig;
use crate::detect::Detector;
use crate::enrich::{Aggregator, BatchReport};
use crate::error::PipelineError;
use crate::staging::StagingWriter;
use crate::warehouse::WarehouseLoader;

#[derive(Debug)]
pub struct RunSummary {
    pub batch: BatchReport,
    pub artifact: PathBuf,
    pub loaded_rows: usize,
}

impl RunSummary {
    pub fn processed_count(&self) -> usize {
        self.batch.processed_count
    }

    pub fn error_count(&self) -> usize {
        self.batch.error_count
    }
}

/// Phase 1 only: enrich every asset and write the staging artifact.
pub fn stage<D: Detector>(
    config: &PipelineConfig,
    detector: D,
) -> Result<(BatchReport, PathBuf), PipelineError> {
    let aggregator = Aggregator::new(detector, config);
    let batch = aggregator.run()?;
    let artifact = StagingWriter::new(&config.staging_path).write(&batch.records)?;
    Ok((batch, artifact))
}

/// Full run: stage, then load.
pub fn run<D: Detector>(config: &PipelineConfig, detector: D) -> Result<RunSummary, PipelineError> {
    let (batch, artifact) = stage(config, detector)?;
    let mut loader = WarehouseLoader::open(&config.warehouse)?;
    let loaded_rows = loader.load(&artifact)?;
    Ok(RunSummary {
        batch,
        artifact,
        loaded_rows,
    })
}

/// Phase 2 only: load an existing staging artifact.
pub fn replay(config: &PipelineConfig) -> Result<usize, PipelineError> {
    let mut loader = WarehouseLoader::open(&config.warehouse)?;
    loader.load(&config.staging_path)
}
