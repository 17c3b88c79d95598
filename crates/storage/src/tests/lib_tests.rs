use super::*;
use shared::domain::{Significance, DEFAULT_CONFIDENCE_Z};

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("docextract_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("layout_memory.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn unknown_field_has_no_stats_or_regex() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage
        .field_stats("invoice", "total")
        .await
        .expect("stats")
        .is_none());
    assert!(storage
        .field_regex("invoice", "total")
        .await
        .expect("regex")
        .is_none());
    assert!(storage
        .field_confidence("invoice", "total", DEFAULT_CONFIDENCE_Z)
        .await
        .expect("ci")
        .is_none());
}

#[tokio::test]
async fn update_field_accumulates_running_mean() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .update_field("invoice", "total", 0.2, 0.8, None)
        .await
        .expect("first");
    let stats = storage
        .update_field("invoice", "total", 0.4, 0.6, None)
        .await
        .expect("second");

    assert_eq!(stats.n, 2);
    assert!((stats.mean_px - 0.3).abs() < 1e-12);
    assert!((stats.mean_py - 0.7).abs() < 1e-12);

    let loaded = storage
        .field_stats("invoice", "total")
        .await
        .expect("stats")
        .expect("some stats");
    assert_eq!(loaded, stats);
}

#[tokio::test]
async fn concurrent_updates_to_a_file_database_all_land() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("docextract_concurrent_test_{suffix}"));
    let db_path = temp_root.join("layout_memory.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    let storage = Storage::new(&database_url).await.expect("db");

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let storage = storage.clone();
            tokio::spawn(async move {
                let offset = f64::from(i) * 0.001;
                storage
                    .update_field("invoice", "number", 0.1 + offset, 0.2, Some(r"\d+"))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("join").expect("update");
    }

    let stats = storage
        .field_stats("invoice", "number")
        .await
        .expect("stats")
        .expect("some stats");
    assert_eq!(stats.n, 20);

    storage.pool().close().await;
    drop(storage);
    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn cache_fill_from_before_an_update_is_discarded() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let key = ("invoice".to_string(), "total".to_string());
    let generation = storage.generation.load(Ordering::SeqCst);

    let fresh = storage
        .update_field("invoice", "total", 0.5, 0.5, None)
        .await
        .expect("update");
    storage.fill(&storage.stats_cache, key.clone(), None, generation);

    assert!(storage.stats_cache.get(&key).is_none());
    assert_eq!(
        storage.field_stats("invoice", "total").await.expect("stats"),
        Some(fresh)
    );
}

#[tokio::test]
async fn update_field_invalidates_cached_reads() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage
        .field_regex("invoice", "date")
        .await
        .expect("regex")
        .is_none());

    storage
        .update_field("invoice", "date", 0.5, 0.1, Some(r"\d{2}/\d{2}/\d{4}"))
        .await
        .expect("update");

    assert_eq!(
        storage
            .field_regex("invoice", "date")
            .await
            .expect("regex")
            .as_deref(),
        Some(r"\d{2}/\d{2}/\d{4}")
    );
}

#[tokio::test]
async fn empty_regex_keeps_previous_one() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .update_field("invoice", "date", 0.5, 0.1, Some("first"))
        .await
        .expect("update");
    storage
        .update_field("invoice", "date", 0.5, 0.1, Some(""))
        .await
        .expect("update");
    storage
        .update_field("invoice", "date", 0.5, 0.1, None)
        .await
        .expect("update");

    assert_eq!(
        storage
            .field_regex("invoice", "date")
            .await
            .expect("regex")
            .as_deref(),
        Some("first")
    );
}

#[tokio::test]
async fn repeated_positions_become_high_significance() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    for i in 0..5 {
        let jitter = f64::from(i) * 0.001;
        storage
            .update_field("receipt", "cnpj", 0.3 + jitter, 0.15 - jitter, None)
            .await
            .expect("update");
    }
    let ci = storage
        .field_confidence("receipt", "cnpj", DEFAULT_CONFIDENCE_Z)
        .await
        .expect("ci")
        .expect("some ci");
    assert_eq!(ci.n, 5);
    assert_eq!(ci.significance, Significance::High);
}

#[tokio::test]
async fn labels_keep_separate_statistics() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .update_field("invoice", "total", 0.9, 0.9, Some("a"))
        .await
        .expect("update");
    storage
        .update_field("receipt", "total", 0.1, 0.1, Some("b"))
        .await
        .expect("update");

    let invoice = storage.list_field_stats("invoice").await.expect("list");
    assert_eq!(invoice.len(), 1);
    assert_eq!(invoice[0].field, "total");
    assert_eq!(invoice[0].regex.as_deref(), Some("a"));
    assert!((invoice[0].stats.mean_px - 0.9).abs() < 1e-12);
}

#[tokio::test]
async fn document_cache_round_trips_by_fingerprint() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut result = Map::new();
    result.insert("total".into(), Value::String("R$ 10,00".into()));

    storage
        .store_cached_result("Total  R$ 10,00\n", r#"{"total":"amount"}"#, &result, Some("invoice"))
        .await
        .expect("store");

    let hit = storage
        .cached_result("Total R$ 10,00", r#"{"total":"amount"}"#)
        .await
        .expect("lookup");
    assert_eq!(hit, Some(result));

    let miss = storage
        .cached_result("Total R$ 10,00", r#"{"total":"value"}"#)
        .await
        .expect("lookup");
    assert!(miss.is_none());
}

#[tokio::test]
async fn purge_doc_cache_filters_by_label() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let result = Map::new();
    storage
        .store_cached_result("a", "{}", &result, Some("invoice"))
        .await
        .expect("store");
    storage
        .store_cached_result("b", "{}", &result, Some("receipt"))
        .await
        .expect("store");

    let listed = storage
        .list_cached_documents(Some("invoice"))
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].label.as_deref(), Some("invoice"));

    assert_eq!(
        storage.purge_doc_cache(Some("invoice")).await.expect("purge"),
        1
    );
    assert_eq!(storage.purge_doc_cache(None).await.expect("purge"), 1);
    assert!(storage
        .list_cached_documents(None)
        .await
        .expect("list")
        .is_empty());
}

#[test]
fn fingerprint_ignores_whitespace_layout() {
    assert_eq!(
        fingerprint("Nota  Fiscal\n123", "{}"),
        fingerprint(" Nota Fiscal 123 ", "{}")
    );
    assert_ne!(fingerprint("Nota Fiscal", "{}"), fingerprint("Nota Fiscal", "[]"));
    let fp = fingerprint("x", "{}");
    assert_eq!(fp.len(), 64);
    assert!(fp.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
}
