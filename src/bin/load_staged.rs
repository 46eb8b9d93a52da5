//! load_staged - replay a staging artifact into the warehouse

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use post_image_enrichment::{pipeline, read_staged, LoadMode, PipelineConfig};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file (overrides ENRICH_CONFIG).
    #[arg(long, env = "ENRICH_CONFIG")]
    config: Option<PathBuf>,
    /// Staging artifact to load (defaults to the configured staging path).
    #[arg(long)]
    artifact: Option<PathBuf>,
    /// SQLite warehouse path.
    #[arg(long)]
    db_path: Option<String>,
    /// Warehouse load mode (append|upsert).
    #[arg(long)]
    mode: Option<LoadMode>,
    /// Validate the artifact without touching the warehouse.
    #[arg(long)]
    check: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = ui::Ui::from_flag(&args.ui);

    let mut cfg = PipelineConfig::load_from(args.config.as_deref())?;
    if let Some(artifact) = &args.artifact {
        cfg.staging_path = artifact.clone();
    }
    if let Some(db_path) = &args.db_path {
        cfg.warehouse.db_path = db_path.clone();
    }
    if let Some(mode) = args.mode {
        cfg.warehouse.mode = mode;
    }
    cfg.validate()?;

    if args.check {
        let records = {
            let _stage = ui.stage("Validate staging artifact");
            read_staged(&cfg.staging_path)?
        };
        println!(
            "{} valid records in {}",
            records.len(),
            cfg.staging_path.display()
        );
        return Ok(());
    }

    let loaded = {
        let mut stage = ui.stage("Load warehouse");
        let loaded = pipeline::replay(&cfg)?;
        stage.detail(format!("{} rows", loaded));
        loaded
    };
    println!(
        "loaded {} rows from {} into {}",
        loaded,
        cfg.staging_path.display(),
        cfg.warehouse.table
    );
    Ok(())
}
