use super::*;
use shared::domain::BoundingBox;

fn block(text: &str, px: f64, py: f64) -> TextBlock {
    TextBlock {
        text: text.to_string(),
        bbox: BoundingBox::new(px - 0.05, py - 0.01, px + 0.05, py + 0.01),
        px,
        py,
    }
}

fn schema(fields: &[(&str, &str)]) -> ExtractionSchema {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

async fn teach(storage: &Storage, field: &str, px: f64, py: f64, regex: Option<&str>, times: usize) {
    for i in 0..times {
        let jitter = if i % 2 == 0 { 0.001 } else { -0.001 };
        storage
            .update_field("invoice", field, px + jitter, py + jitter, regex)
            .await
            .expect("teach");
    }
}

#[tokio::test]
async fn unknown_fields_fall_back_and_ask_for_a_regex() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let blocks = vec![block("Invoice 42", 0.2, 0.1)];
    let outcome = search(&storage, "invoice", &schema(&[("number", "invoice number")]), blocks)
        .await
        .expect("search");

    assert!(outcome.resolved.is_empty());
    assert_eq!(outcome.fallback.len(), 1);
    assert_eq!(outcome.fallback[0].0, "number");
    assert!(outcome.fallback[0].1.extract_regex);
    assert_eq!(outcome.remaining_blocks.len(), 1);
}

#[tokio::test]
async fn confident_position_and_matching_regex_resolve_the_field() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    teach(&storage, "number", 0.2, 0.1, Some(r"\d+"), 6).await;

    let blocks = vec![
        block("Header", 0.5, 0.02),
        block("Invoice 42 ", 0.2, 0.1),
        block("Total 10", 0.8, 0.9),
    ];
    let outcome = search(
        &storage,
        "invoice",
        &schema(&[("number", "invoice number"), ("total", "amount due")]),
        blocks,
    )
    .await
    .expect("search");

    assert_eq!(outcome.resolved.get("number"), Some(&Value::String("42".into())));
    assert_eq!(outcome.fallback.len(), 1);
    assert_eq!(outcome.fallback[0].0, "total");
    let remaining: Vec<&str> = outcome
        .remaining_blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect();
    assert_eq!(remaining, ["Header", "Total 10"]);
}

#[tokio::test]
async fn regex_without_match_falls_back_without_new_regex() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    teach(&storage, "number", 0.2, 0.1, Some(r"\d{6}"), 6).await;

    let outcome = search(
        &storage,
        "invoice",
        &schema(&[("number", "invoice number")]),
        vec![block("Invoice 42", 0.2, 0.1)],
    )
    .await
    .expect("search");

    assert!(outcome.resolved.is_empty());
    assert!(!outcome.fallback[0].1.extract_regex);
    assert_eq!(outcome.remaining_blocks.len(), 1);
}

#[tokio::test]
async fn invalid_regex_is_treated_as_no_match() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    teach(&storage, "number", 0.2, 0.1, Some(r"(?<=Invoice )\d+"), 6).await;

    let outcome = search(
        &storage,
        "invoice",
        &schema(&[("number", "invoice number")]),
        vec![block("Invoice 42", 0.2, 0.1)],
    )
    .await
    .expect("search");

    assert!(outcome.resolved.is_empty());
    assert_eq!(outcome.fallback.len(), 1);
}

#[tokio::test]
async fn low_significance_positions_are_ignored() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    teach(&storage, "number", 0.2, 0.1, Some(r"\d+"), 2).await;

    let outcome = search(
        &storage,
        "invoice",
        &schema(&[("number", "invoice number")]),
        vec![block("Invoice 42", 0.2, 0.1)],
    )
    .await
    .expect("search");

    assert!(outcome.resolved.is_empty());
}

#[test]
fn fallback_schema_keeps_field_order() {
    let outcome = LayoutSearchOutcome {
        fallback: vec![
            (
                "b".into(),
                FallbackField {
                    description: Value::String("second".into()),
                    extract_regex: true,
                },
            ),
            (
                "a".into(),
                FallbackField {
                    description: Value::String("first".into()),
                    extract_regex: false,
                },
            ),
        ],
        ..Default::default()
    };
    let fallback_schema = outcome.fallback_schema();
    let keys: Vec<&str> = fallback_schema.keys().map(String::as_str).collect();
    assert_eq!(keys, ["b", "a"]);
}
