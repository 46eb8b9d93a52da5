use std::path::Path;

use anyhow::Result;
use tempfile::TempDir;

use post_image_enrichment::{
    pipeline, read_staged, ContentCategory, Detection, LoadMode, PipelineConfig, PipelineError,
    StubDetector, WarehouseLoader,
};

fn write_image(base: &Path, relative: &str) {
    let path = base.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"\xff\xd8\xff\xe0 not really a jpeg").unwrap();
}

fn setup() -> (TempDir, PipelineConfig, StubDetector) {
    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    write_image(&images, "pharma_channel/1001.jpg");
    write_image(&images, "pharma_channel/1002.jpg");
    write_image(&images, "pharma_channel/cover.jpg");

    let stub = StubDetector::new().with_detections(
        "1001.jpg",
        vec![
            Detection::new(0, "person", 0.9, [12.0, 8.0, 200.0, 400.0]),
            Detection::new(39, "bottle", 0.8, [150.0, 220.0, 190.0, 330.0]),
        ],
    );

    let mut cfg = PipelineConfig {
        image_dir: images,
        staging_path: dir.path().join("processed/yolo_detections.jsonl"),
        ..PipelineConfig::default()
    };
    cfg.warehouse.db_path = dir
        .path()
        .join("warehouse/medical.db")
        .to_string_lossy()
        .into_owned();
    cfg.validate().unwrap();
    (dir, cfg, stub)
}

#[test]
fn run_stages_and_loads_valid_images_only() -> Result<()> {
    let (_dir, cfg, stub) = setup();

    let summary = pipeline::run(&cfg, stub)?;
    assert_eq!(summary.processed_count(), 2);
    assert_eq!(summary.error_count(), 1);
    assert_eq!(summary.loaded_rows, 2);
    assert!(summary.batch.skipped[0].path.ends_with("cover.jpg"));

    let staged = read_staged(&summary.artifact)?;
    assert_eq!(staged.len(), 2);

    let loader = WarehouseLoader::open(&cfg.warehouse)?;
    assert_eq!(loader.row_count()?, 2);

    let promotional = loader.by_category(ContentCategory::Promotional)?;
    assert_eq!(promotional.len(), 1);
    let row = &promotional[0].record;
    assert_eq!(row.message_id, 1001);
    assert_eq!(row.detected_class.as_deref(), Some("person"));
    assert_eq!(row.confidence_score, Some(0.9));
    assert_eq!(row.all_detections.len(), 2);

    let other = loader.by_category(ContentCategory::Other)?;
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].record.message_id, 1002);
    assert_eq!(other[0].record.detected_class, None);
    assert_eq!(other[0].record.confidence_score, None);
    assert!(other[0].record.all_detections.is_empty());
    Ok(())
}

#[test]
fn rerun_appends_duplicates_unless_upserting() -> Result<()> {
    let (_dir, mut cfg, stub) = setup();

    pipeline::run(&cfg, &stub)?;
    pipeline::run(&cfg, &stub)?;
    assert_eq!(WarehouseLoader::open(&cfg.warehouse)?.row_count()?, 4);

    cfg.warehouse.mode = LoadMode::Upsert;
    pipeline::run(&cfg, &stub)?;
    assert_eq!(WarehouseLoader::open(&cfg.warehouse)?.row_count()?, 2);
    Ok(())
}

#[test]
fn invalid_table_name_leaves_artifact_for_replay() -> Result<()> {
    let (_dir, mut cfg, stub) = setup();
    cfg.warehouse.table = "not a table".to_string();

    let err = pipeline::run(&cfg, &stub).unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
    assert_eq!(read_staged(&cfg.staging_path)?.len(), 2);

    cfg.warehouse.table = "raw_cv_detections".to_string();
    assert_eq!(pipeline::replay(&cfg)?, 2);
    assert_eq!(WarehouseLoader::open(&cfg.warehouse)?.row_count()?, 2);
    Ok(())
}

#[test]
fn rejected_row_rolls_back_load_and_replay_recovers() -> Result<()> {
    let (_dir, cfg, stub) = setup();
    std::fs::create_dir_all(Path::new(&cfg.warehouse.db_path).parent().unwrap())?;
    let conn = rusqlite::Connection::open(&cfg.warehouse.db_path)?;
    conn.execute_batch(
        r#"
        CREATE TABLE raw_cv_detections (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          message_id INTEGER NOT NULL CHECK (message_id <> 1002),
          image_path TEXT,
          detected_class TEXT,
          confidence_score REAL,
          image_category TEXT NOT NULL,
          all_detections TEXT NOT NULL,
          processed_at TEXT NOT NULL,
          load_ts TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    )?;

    let err = pipeline::run(&cfg, &stub).unwrap_err();
    assert!(matches!(err, PipelineError::LoadTransaction { .. }));
    let committed: i64 =
        conn.query_row("SELECT COUNT(*) FROM raw_cv_detections", [], |row| row.get(0))?;
    assert_eq!(committed, 0);
    assert_eq!(read_staged(&cfg.staging_path)?.len(), 2);

    conn.execute_batch("DROP TABLE raw_cv_detections")?;
    drop(conn);
    assert_eq!(pipeline::replay(&cfg)?, 2);
    assert_eq!(WarehouseLoader::open(&cfg.warehouse)?.row_count()?, 2);
    Ok(())
}

#[test]
fn incompatible_existing_table_fails_with_schema_error() -> Result<()> {
    let (_dir, cfg, stub) = setup();
    std::fs::create_dir_all(Path::new(&cfg.warehouse.db_path).parent().unwrap())?;
    rusqlite::Connection::open(&cfg.warehouse.db_path)?
        .execute_batch("CREATE TABLE raw_cv_detections (id INTEGER PRIMARY KEY, note TEXT)")?;

    let err = pipeline::run(&cfg, &stub).unwrap_err();
    assert!(matches!(err, PipelineError::Schema { .. }));
    assert_eq!(read_staged(&cfg.staging_path)?.len(), 2);
    Ok(())
}

#[test]
fn missing_image_directory_fails_before_staging() {
    let (dir, mut cfg, stub) = setup();
    cfg.image_dir = dir.path().join("nowhere");

    let err = pipeline::run(&cfg, stub).unwrap_err();
    assert!(matches!(err, PipelineError::Scan { .. }));
    assert!(!cfg.staging_path.exists());
}

#[test]
fn empty_directory_stages_empty_artifact_and_loads_nothing() -> Result<()> {
    let (dir, mut cfg, stub) = setup();
    let empty = dir.path().join("empty");
    std::fs::create_dir_all(&empty)?;
    cfg.image_dir = empty;

    let summary = pipeline::run(&cfg, stub)?;
    assert_eq!(summary.processed_count(), 0);
    assert_eq!(summary.error_count(), 0);
    assert_eq!(summary.loaded_rows, 0);
    assert_eq!(std::fs::read_to_string(&summary.artifact)?, "");
    Ok(())
}

#[test]
fn parallel_run_reports_same_counts() -> Result<()> {
    let (_dir, mut cfg, stub) = setup();
    cfg.workers = 3;

    let summary = pipeline::run(&cfg, stub)?;
    assert_eq!(summary.processed_count(), 2);
    assert_eq!(summary.error_count(), 1);
    assert_eq!(summary.loaded_rows, 2);
    Ok(())
}
