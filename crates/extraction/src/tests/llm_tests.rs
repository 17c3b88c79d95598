use super::*;
use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use shared::domain::BoundingBox;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn spawn_completions(reply: Value) -> (String, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route(
            "/v1/chat/completions",
            post(
                move |State(state): State<Captured>, headers: HeaderMap, Json(body): Json<Value>| {
                    let reply = reply.clone();
                    async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        state.requests.lock().expect("lock").push((auth, body));
                        Json(reply)
                    }
                },
            ),
        )
        .with_state(captured.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}/v1"), captured)
}

fn block(text: &str) -> TextBlock {
    TextBlock {
        text: text.to_string(),
        bbox: BoundingBox::new(0.0, 0.0, 0.1, 0.1),
        px: 0.05,
        py: 0.05,
    }
}

#[test]
fn prompt_numbers_blocks_from_one_and_embeds_fields() {
    let mut fields = Map::new();
    fields.insert(
        "total".into(),
        serde_json::json!({ "description": "amount due", "extract_regex": true }),
    );
    let prompt = build_prompt(&[block("Invoice 42"), block("Total 10")], "invoice", &fields);

    assert!(prompt.contains("1. \"Invoice 42\"\n2. \"Total 10\""));
    assert!(prompt.contains("Label:\ninvoice"));
    assert!(prompt.contains("  \"total\": {\n    \"description\": \"amount due\""));
    assert!(!prompt.starts_with('\n'));
}

#[test]
fn parse_answer_rejects_non_objects() {
    assert!(parse_answer(r#"{"total": {"value": "10"}}"#).is_ok());
    assert!(matches!(parse_answer("[1, 2]"), Err(ExtractError::Llm(_))));
    assert!(matches!(parse_answer("not json"), Err(ExtractError::Llm(_))));
}

#[tokio::test]
async fn openai_client_requests_json_object_and_parses_content() {
    let reply = serde_json::json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": "{\"total\": {\"value\": \"10\", \"block\": \"2\"}}"
            }
        }]
    });
    let (base_url, captured) = spawn_completions(reply).await;
    let client = OpenAiClient::new(OpenAiConfig::new("sk-test").with_base_url(base_url))
        .expect("client");

    let answer = client.complete_json("extract please").await.expect("answer");
    assert_eq!(answer["total"]["value"], "10");

    let requests = captured.requests.lock().expect("lock");
    assert_eq!(requests.len(), 1);
    let (auth, body) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
    assert_eq!(body["model"], DEFAULT_MODEL);
    assert_eq!(body["response_format"]["type"], "json_object");
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "extract please");
}

#[tokio::test]
async fn openai_client_surfaces_unparseable_content() {
    let reply = serde_json::json!({
        "choices": [{ "message": { "content": "sorry, no JSON today" } }]
    });
    let (base_url, _captured) = spawn_completions(reply).await;
    let client = OpenAiClient::new(OpenAiConfig::new("k").with_base_url(base_url)).expect("client");

    let err = client.complete_json("x").await.expect_err("should fail");
    assert!(matches!(err, ExtractError::Llm(ref message) if message == "LLM response parse error"));
}
