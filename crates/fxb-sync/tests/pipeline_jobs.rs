use std::path::{Path, PathBuf};
use std::sync::Arc;

use fxb_core::RegulationTier;
use fxb_storage::{BrokerStore, LocalObjectStore, MemoryStore, SelectQuery};
use fxb_sync::{LookupTables, Pipeline, PipelineConfig, ReviewKind};
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap()
}

fn seed_path() -> PathBuf {
    workspace_root().join("fixtures/seeds/brokers.json")
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    store: Arc<MemoryStore>,
    pipeline: Pipeline,
}

fn harness(rows: Vec<JsonValue>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let root_str = root.display().to_string();
    let config = PipelineConfig::from_lookup(|key| match key {
        "FXB_WORKSPACE_ROOT" => Some(root_str.clone()),
        "FXB_MAX_RETRIES" => Some("0".to_string()),
        _ => None,
    });
    let store = Arc::new(MemoryStore::with_rows(rows).unwrap());
    let objects = Arc::new(LocalObjectStore::new(
        root.join("objects"),
        "https://cdn.example.com/logos",
    ));
    let pipeline = Pipeline::new(
        config,
        store.clone(),
        objects,
        Arc::new(LookupTables::builtin().unwrap()),
    );
    Harness {
        _dir: dir,
        root,
        store,
        pipeline,
    }
}

async fn row(store: &MemoryStore, slug: &str) -> JsonValue {
    store
        .select(&SelectQuery::all().eq("slug", slug))
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap_or(JsonValue::Null)
}

async fn seeded() -> Harness {
    let h = harness(Vec::new());
    let run = h.pipeline.run_seed_job(&seed_path(), false, false).await.unwrap();
    assert_eq!(run.report.summary.updated, 9);
    h
}

#[tokio::test]
async fn seed_import_is_idempotent_on_slug() {
    let h = seeded().await;
    let second = h.pipeline.run_seed_job(&seed_path(), false, false).await.unwrap();
    assert_eq!(second.report.summary.updated, 9);
    assert_eq!(second.report.summary.failed, 0);

    let rows = h.store.snapshot().await;
    assert_eq!(rows.len(), 9);
    let admiral = row(&h.store, "admiral-markets").await;
    assert_eq!(admiral["name"], json!("Admiral Markets"));
    assert!(second.reports_dir.join("summary.md").exists());
    assert!(second.reports_dir.starts_with(h.root.join("reports")));
}

#[tokio::test]
async fn seed_with_validation_errors_is_blocked_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("bad.json");
    std::fs::write(
        &bundle,
        serde_json::to_vec(&json!({
            "bundle_id": "bad-seed",
            "fetched_at": "2026-01-05T00:00:00Z",
            "brokers": [
                {"name": "Tickmill", "slug": "tickmill", "regulations": ["FCA"], "min_deposit": 100},
                {"name": "", "slug": "nameless", "min_deposit": -5}
            ]
        }))
        .unwrap(),
    )
    .unwrap();

    let h = harness(Vec::new());
    let blocked = h.pipeline.run_seed_job(&bundle, false, false).await.unwrap();
    assert_eq!(blocked.report.summary.updated, 0);
    assert!(blocked.report.review.iter().any(|r| r.kind == ReviewKind::Blocked));
    assert!(h.store.snapshot().await.is_empty());

    let forced = h.pipeline.run_seed_job(&bundle, true, false).await.unwrap();
    assert_eq!(forced.report.summary.updated, 2);
}

#[tokio::test]
async fn tier_job_writes_inferred_tiers_and_flags_unknowns() {
    let h = seeded().await;
    h.store
        .upsert_by_slug(&json!({"name": "Acme Trading", "slug": "acme-trading", "regulations": []}))
        .await
        .unwrap();

    let run = h.pipeline.run_tier_job(false).await.unwrap();
    assert_eq!(run.report.summary.failed, 0);

    let expected = [
        ("ig-markets", RegulationTier::Tier1),
        ("pepperstone", RegulationTier::Tier1),
        ("fxtm", RegulationTier::Tier2),
        ("ftmo", RegulationTier::Unregulated),
        ("binance", RegulationTier::Tier2),
        ("nordfx-global", RegulationTier::Tier3),
    ];
    for (slug, tier) in expected {
        assert_eq!(row(&h.store, slug).await["regulation_tier"], json!(tier.as_str()), "{slug}");
    }

    let acme = row(&h.store, "acme-trading").await;
    assert!(acme["regulation_tier"].is_null());
    let unknown = run
        .report
        .review
        .iter()
        .filter(|r| r.kind == ReviewKind::UnknownTier)
        .collect::<Vec<_>>();
    assert_eq!(unknown.len(), 1);
    assert_eq!(unknown[0].broker.as_ref().unwrap().slug, "acme-trading");

    let rerun = h.pipeline.run_tier_job(false).await.unwrap();
    assert!(rerun.report.changes.is_empty());
    assert_eq!(rerun.report.summary.updated, 0);
}

#[tokio::test]
async fn dry_run_plans_without_writing() {
    let h = seeded().await;
    let before = h.store.snapshot().await;
    let run = h.pipeline.run_tier_job(true).await.unwrap();
    assert_eq!(run.report.changes.len(), 9);
    assert_eq!(run.report.summary.updated, 0);
    assert_eq!(h.store.snapshot().await, before);
}

#[tokio::test]
async fn logo_job_uploads_matches_and_reports_the_rest() {
    let h = seeded().await;
    let logos = tempfile::tempdir().unwrap();
    for (file, bytes) in [
        ("imgi_38_fxtm-review.png", b"fxtm-bytes".as_slice()),
        ("Pepperstone (1).png", b"pepper-a".as_slice()),
        ("imgi_112_pepperstone-150x150.png", b"pepper-b".as_slice()),
        ("imgi_3_.png", b"empty".as_slice()),
        ("zzz-unknown-co.png", b"nobody".as_slice()),
        ("notes.txt", b"ignored".as_slice()),
    ] {
        std::fs::write(logos.path().join(file), bytes).unwrap();
    }

    let run = h.pipeline.run_logo_job(logos.path(), false).await.unwrap();
    assert_eq!(run.report.summary.updated, 2);

    let fxtm = row(&h.store, "fxtm").await;
    let url = fxtm["logo_url"].as_str().unwrap();
    assert!(url.starts_with("https://cdn.example.com/logos/fxtm/"));
    assert!(url.ends_with(".png"));
    let key = url.trim_start_matches("https://cdn.example.com/logos/");
    assert!(h.root.join("objects").join(key).exists());

    let kinds = run.report.review.iter().map(|r| r.kind).collect::<Vec<_>>();
    assert_eq!(kinds.iter().filter(|k| **k == ReviewKind::DuplicateMatch).count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == ReviewKind::Unmatched).count(), 2);

    let rerun = h.pipeline.run_logo_job(logos.path(), false).await.unwrap();
    assert!(rerun.report.changes.is_empty());
    assert_eq!(rerun.report.summary.skipped, 2);
}

#[tokio::test]
async fn name_validate_and_purge_jobs() {
    let h = harness(vec![
        json!({"name": "XM Group  Review", "slug": "xm-group", "regulations": ["CySEC"], "min_deposit": 5}),
        json!({"name": "Test Broker", "slug": "test-broker"}),
        json!({"name": "N/A", "slug": "n-a"}),
        json!({"name": "Tickmill", "slug": "tickmill", "min_deposit": -1}),
    ]);

    let names = h.pipeline.run_name_job(false).await.unwrap();
    assert_eq!(names.report.summary.updated, 1);
    assert_eq!(row(&h.store, "xm-group").await["name"], json!("XM Group"));

    let validation = h.pipeline.run_validate_job().await.unwrap();
    assert!(validation
        .report
        .review
        .iter()
        .any(|r| r.kind == ReviewKind::ValidationError && r.subject == "tickmill.min_deposit"));
    assert_eq!(h.store.snapshot().await.len(), 4);

    let preview = h.pipeline.run_purge_job(false).await.unwrap();
    assert_eq!(preview.report.changes.len(), 2);
    assert_eq!(h.store.snapshot().await.len(), 4);

    let purge = h.pipeline.run_purge_job(true).await.unwrap();
    assert_eq!(purge.report.summary.updated, 2);
    let remaining = h
        .store
        .snapshot()
        .await
        .into_iter()
        .map(|r| r["slug"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(remaining, vec!["xm-group", "tickmill"]);
}

#[tokio::test]
async fn duplicate_slug_rows_each_receive_their_own_changes() {
    let h = harness(vec![
        json!({"name": "IG Markets Review", "slug": "ig-markets", "regulations": ["FSA Seychelles"]}),
        json!({"name": "IG   Group", "slug": "ig-markets", "regulations": ["CySEC"]}),
    ]);

    let names = h.pipeline.run_name_job(false).await.unwrap();
    assert_eq!(names.report.summary.planned, 2);
    assert_eq!(names.report.summary.updated, 2);
    let rows = h.store.snapshot().await;
    assert_eq!(rows[0]["name"], json!("IG Markets"));
    assert_eq!(rows[1]["name"], json!("IG Group"));

    let validation = h.pipeline.run_validate_job().await.unwrap();
    let slug_errors = validation
        .report
        .review
        .iter()
        .filter(|r| r.kind == ReviewKind::ValidationError && r.subject == "ig-markets.slug")
        .count();
    assert_eq!(slug_errors, 2);
}

#[tokio::test]
async fn label_and_dedup_jobs_only_report() {
    let h = seeded().await;
    h.store
        .upsert_by_slug(&json!({"name": "Peperstone", "slug": "peperstone"}))
        .await
        .unwrap();
    let before = h.store.snapshot().await;

    let bundle = workspace_root().join("fixtures/scrape/broker-directory/bundle.json");
    let labels = h.pipeline.run_label_job(&bundle).await.unwrap();
    assert!(labels.report.changes.is_empty());
    assert!(!labels.report.summary.notes.is_empty());

    let dedup = h.pipeline.run_dedup_job().await.unwrap();
    assert!(dedup
        .report
        .review
        .iter()
        .any(|r| r.kind == ReviewKind::NearDuplicate && r.subject.contains("pepperstone")));
    assert_eq!(h.store.snapshot().await, before);
}
