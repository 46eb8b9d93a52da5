//! enrich_images - detect objects in post images, stage, and load to the warehouse

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use post_image_enrichment::{pipeline, LoadMode, PipelineConfig, WarehouseLoader};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file (overrides ENRICH_CONFIG).
    #[arg(long, env = "ENRICH_CONFIG")]
    config: Option<PathBuf>,
    /// ONNX detection model.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Base directory laid out as <channel>/<message_id>.<ext>.
    #[arg(long)]
    image_dir: Option<PathBuf>,
    /// Output path for the staging artifact.
    #[arg(long)]
    staging_path: Option<PathBuf>,
    /// SQLite warehouse path.
    #[arg(long)]
    db_path: Option<String>,
    /// Warehouse load mode (append|upsert).
    #[arg(long)]
    mode: Option<LoadMode>,
    /// Inference worker threads.
    #[arg(long)]
    workers: Option<usize>,
    /// Write the staging artifact but do not load it.
    #[arg(long)]
    stage_only: bool,
    /// Fail the run when skipped/total exceeds this ratio (checked after load).
    #[arg(long, value_name = "RATIO")]
    max_error_rate: Option<f64>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = ui::Ui::from_flag(&args.ui);
    let cfg = resolve_config(&args)?;

    let detector = {
        let _stage = ui.stage("Load detection model");
        load_detector(&cfg)?
    };

    let (batch, artifact) = {
        let mut stage = ui.stage("Detect and stage");
        let (batch, artifact) = pipeline::stage(&cfg, detector)?;
        stage.detail(format!(
            "{} processed, {} errors",
            batch.processed_count, batch.error_count
        ));
        (batch, artifact)
    };
    println!(
        "Detection complete: {} processed, {} errors",
        batch.processed_count, batch.error_count
    );
    println!("staging artifact written to {}", artifact.display());

    if !args.stage_only {
        let loaded = {
            let mut stage = ui.stage("Load warehouse");
            let mut loader = WarehouseLoader::open(&cfg.warehouse)?;
            let loaded = loader.load(&artifact)?;
            stage.detail(format!("{} rows into {}", loaded, loader.table()));
            loaded
        };
        println!("loaded {} rows into {}", loaded, cfg.warehouse.table);
    }

    if let Some(limit) = args.max_error_rate {
        let rate = batch.error_rate();
        if rate > limit {
            return Err(anyhow!(
                "error rate {:.3} exceeds --max-error-rate {:.3} ({} of {} assets skipped)",
                rate,
                limit,
                batch.error_count,
                batch.total()
            ));
        }
    }
    Ok(())
}

fn resolve_config(args: &Args) -> Result<PipelineConfig> {
    let mut cfg = PipelineConfig::load_from(args.config.as_deref())?;
    if let Some(model) = &args.model {
        cfg.model_path = model.clone();
    }
    if let Some(dir) = &args.image_dir {
        cfg.image_dir = dir.clone();
    }
    if let Some(path) = &args.staging_path {
        cfg.staging_path = path.clone();
    }
    if let Some(db_path) = &args.db_path {
        cfg.warehouse.db_path = db_path.clone();
    }
    if let Some(mode) = args.mode {
        cfg.warehouse.mode = mode;
    }
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(feature = "backend-tract")]
fn load_detector(cfg: &PipelineConfig) -> Result<post_image_enrichment::TractDetector> {
    use post_image_enrichment::{PipelineError, TractDetector};

    TractDetector::new(&cfg.model_path, cfg.detector.clone()).map_err(|e| {
        PipelineError::ModelLoad {
            path: cfg.model_path.clone(),
            message: format!("{:#}", e),
        }
        .into()
    })
}

#[cfg(not(feature = "backend-tract"))]
fn load_detector(cfg: &PipelineConfig) -> Result<post_image_enrichment::StubDetector> {
    Err(anyhow!(
        "cannot load {}: enrich_images requires the backend-tract feature",
        cfg.model_path.display()
    ))
}
