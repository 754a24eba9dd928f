//! Integration tests for lakeslice-cli
//!
//! These tests drive the same [`App`] the binary uses, against a temporary
//! output and checkpoint directory:
//! - Planning a fixture catalog
//! - Running and re-running a sync to JSON-lines files
//! - Status, run listing, resume and rollback

use lakeslice_checkpoint::RunStatus;
use lakeslice_cli::{App, Catalog, ConfigLoader, LakesliceConfig};
use lakeslice_core::{
    BreakPolicy, CancellationToken, MemoryWriter, ResumeOptions, SampleSpecPatch, Strategy,
};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

const CATALOG: &str = r#"
tables:
  - name: customers
    schema:
      - { name: id, type: INTEGER }
      - { name: signed_up, type: DATE }
    generate: 40
  - name: products
    schema:
      - { name: id, type: INTEGER }
    generate: 12
  - name: orders
    schema:
      - { name: id, type: INTEGER }
      - { name: customer_id, type: INTEGER }
      - { name: created_at, type: TIMESTAMP }
    generate: 60
  - name: order_items
    schema:
      - { name: id, type: INTEGER }
      - { name: order_id, type: INTEGER }
      - { name: product_id, type: INTEGER }
    foreign_keys:
      - { column: order_id, referenced_table: orders }
    generate: 50
"#;

fn catalog() -> Catalog {
    Catalog::from_yaml(CATALOG).unwrap()
}

fn config_in(dir: &TempDir) -> LakesliceConfig {
    let mut config = LakesliceConfig::default();
    config.output.dir = dir.path().join("data");
    config.state.dir = dir.path().join("runs");
    config.sampling = SampleSpecPatch::strategy(Strategy::Head).with_row_budget(10);
    config.table_overrides.insert(
        "order_items".to_string(),
        SampleSpecPatch::strategy(Strategy::Full),
    );
    config
}

fn line_count(path: &std::path::Path) -> usize {
    fs::read_to_string(path).unwrap().lines().count()
}

#[tokio::test]
async fn test_plan_uses_declared_and_inferred_keys() {
    let dir = TempDir::new().unwrap();
    let app = App::new(config_in(&dir));

    let (graph, plan) = app.plan(catalog()).await.unwrap();

    // orders.customer_id and order_items.product_id are inferred
    assert_eq!(graph.edge_count(), 3);
    assert_eq!(
        plan.waves,
        vec![
            vec!["customers", "products"],
            vec!["orders"],
            vec!["order_items"],
        ]
    );
}

#[tokio::test]
async fn test_plan_without_inference() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.graph.infer_foreign_keys = false;

    let (graph, plan) = App::new(config).plan(catalog()).await.unwrap();
    assert_eq!(graph.edge_count(), 1);
    assert_eq!(
        plan.waves,
        vec![vec!["customers", "orders", "products"], vec!["order_items"]]
    );
}

#[tokio::test]
async fn test_table_selection() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.graph.exclude = vec!["Customers".to_string(), "products".to_string()];

    let (graph, plan) = App::new(config).plan(catalog()).await.unwrap();
    assert_eq!(graph.len(), 2);
    assert_eq!(plan.waves, vec![vec!["orders"], vec!["order_items"]]);
}

#[tokio::test]
async fn test_run_writes_jsonl_files_and_checkpoint() {
    let dir = TempDir::new().unwrap();
    let app = App::new(config_in(&dir));

    let summary = app
        .run(catalog(), "run-1", None, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    let data = dir.path().join("data");
    assert_eq!(line_count(&data.join("customers.jsonl")), 10);
    assert_eq!(line_count(&data.join("order_items.jsonl")), 50);

    let checkpoint = app.status(Some("run-1")).await.unwrap();
    assert_eq!(checkpoint.status, RunStatus::Completed);
    assert_eq!(checkpoint.progress().percent(), 100);
    assert!(dir.path().join("runs").join("run-1.json").exists());
}

#[tokio::test]
async fn test_rerun_replaces_output() {
    let dir = TempDir::new().unwrap();
    let app = App::new(config_in(&dir));
    let cancel = CancellationToken::new();

    app.run(catalog(), "first", None, &cancel, None).await.unwrap();
    let caller = SampleSpecPatch::new().with_row_budget(3);
    let second = app
        .run(catalog(), "second", Some(&caller), &cancel, None)
        .await
        .unwrap();

    // The caller's budget wins over configuration everywhere it applies
    let customers = dir.path().join("data").join("customers.jsonl");
    assert_eq!(line_count(&customers), 3);
    assert_eq!(second.result("order_items").unwrap().sampled_row_count, 50);

    let runs = app.runs().await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
}

#[tokio::test]
async fn test_invalid_override_fails_table_and_resume_recovers() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config
        .table_overrides
        .insert("orders".to_string(), SampleSpecPatch::strategy(Strategy::Recent));

    let failing = App::new(config.clone());
    let summary = failing
        .run(catalog(), "run", None, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.failed(), vec!["orders"]);
    assert_eq!(summary.skipped(), vec!["order_items"]);

    // Fix the override and resume the same run
    config.table_overrides.insert(
        "orders".to_string(),
        SampleSpecPatch::strategy(Strategy::Recent).with_date_column("created_at"),
    );
    let fixed = App::new(config);
    let resumed = fixed
        .resume(
            catalog(),
            "run",
            None,
            ResumeOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.carried_over, vec!["customers", "products"]);
    assert_eq!(fixed.status(None).await.unwrap().resumes, 1);
}

#[tokio::test]
async fn test_resume_keeps_the_runs_sampling_override() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config
        .table_overrides
        .insert("orders".to_string(), SampleSpecPatch::strategy(Strategy::Recent));
    let caller = SampleSpecPatch::new().with_row_budget(3);

    let summary = App::new(config.clone())
        .run(catalog(), "run", Some(&caller), &CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(summary.failed(), vec!["orders"]);
    let data = dir.path().join("data");
    assert_eq!(line_count(&data.join("customers.jsonl")), 3);

    config.table_overrides.insert(
        "orders".to_string(),
        SampleSpecPatch::strategy(Strategy::Recent).with_date_column("created_at"),
    );
    let fixed = App::new(config);
    let resumed = fixed
        .resume(
            catalog(),
            "run",
            None,
            ResumeOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    // The budget given to the original run still applies
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.result("orders").unwrap().sampled_row_count, 3);
    assert_eq!(line_count(&data.join("orders.jsonl")), 3);
    assert_eq!(resumed.result("order_items").unwrap().sampled_row_count, 50);
}

#[tokio::test]
async fn test_resume_override_layers_over_stored_one() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config
        .table_overrides
        .insert("orders".to_string(), SampleSpecPatch::strategy(Strategy::Recent));
    let caller = SampleSpecPatch::new().with_row_budget(3);

    App::new(config.clone())
        .run(catalog(), "run", Some(&caller), &CancellationToken::new(), None)
        .await
        .unwrap();

    // A date column given on resume fixes orders; the stored budget remains
    let fix = SampleSpecPatch::new().with_date_column("created_at");
    let app = App::new(config);
    let resumed = app
        .resume(
            catalog(),
            "run",
            Some(&fix),
            ResumeOptions::default(),
            &CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.result("orders").unwrap().sampled_row_count, 3);

    let stored = app.status(Some("run")).await.unwrap().caller_override.unwrap();
    assert_eq!(stored["row_budget"], 3);
    assert_eq!(stored["date_column"], "created_at");
}

#[tokio::test]
async fn test_rollback_deletes_outputs_and_checkpoint() {
    let dir = TempDir::new().unwrap();
    let app = App::new(config_in(&dir));
    app.run(catalog(), "run", None, &CancellationToken::new(), None)
        .await
        .unwrap();

    let listed = app.rollback("run", false).await.unwrap();
    assert_eq!(listed.len(), 4);
    assert!(listed.iter().all(|l| std::path::Path::new(l).exists()));

    let removed = app.rollback("run", true).await.unwrap();
    assert_eq!(removed, listed);
    assert!(listed.iter().all(|l| !std::path::Path::new(l).exists()));
    assert!(app.runs().await.unwrap().is_empty());
    assert!(app.rollback("run", false).await.is_err());
}

#[tokio::test]
async fn test_cyclic_catalog_follows_cycle_policy() {
    let yaml = r#"
tables:
  - name: a
    foreign_keys: [{ column: b_id, referenced_table: b }]
    rows: [{ id: 1, b_id: 1 }]
  - name: b
    foreign_keys: [{ column: a_id, referenced_table: a }]
    rows: [{ id: 1, a_id: 1 }]
"#;
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);

    let err = App::new(config.clone())
        .plan(Catalog::from_yaml(yaml).unwrap())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Cyclic"));

    config.execution.on_cycle = BreakPolicy::BreakArbitrary;
    let summary = App::new(config)
        .with_writer(Arc::new(MemoryWriter::new()))
        .run(Catalog::from_yaml(yaml).unwrap(), "run", None, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.broken_edges.len(), 1);
}

#[tokio::test]
async fn test_config_file_drives_the_app() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lakeslice.toml");
    fs::write(
        &path,
        format!(
            r#"
[sampling]
strategy = "tail"
row_budget = 4

[output]
dir = "{data}"
format = "json"

[state]
dir = "{runs}"
"#,
            data = dir.path().join("out").display(),
            runs = dir.path().join("state").display(),
        ),
    )
    .unwrap();

    let config = ConfigLoader::new()
        .with_user_config_path(None)
        .with_config_file(&path)
        .load()
        .await
        .unwrap();
    let summary = App::new(config)
        .run(catalog(), "from-file", None, &CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    let written: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("out").join("products.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(written.as_array().unwrap().len(), 4);
    assert!(dir.path().join("state").join("from-file.json").exists());
}
