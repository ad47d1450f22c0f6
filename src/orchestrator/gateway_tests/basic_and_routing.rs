use axum::http::{header, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use super::common::{
    body_json, body_text, chat_request, chat_request_raw, get, sse_payloads, streamed_content,
    test_app,
};
use crate::orchestrator::config::IdentityKind;
use crate::orchestrator::testing::{test_config, MockBackend};

fn hello(stream: bool) -> serde_json::Value {
    json!({
        "model": "gpt-4o",
        "stream": stream,
        "messages": [{"role": "user", "content": "hello"}]
    })
}

#[tokio::test]
async fn health_and_status_work_without_backend_calls() {
    let mock = MockBackend::start().await;
    let (app, _) = test_app(test_config(&mock.base_url, IdentityKind::Guest));

    let resp = app.clone().oneshot(get("/health", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.clone().oneshot(get("/status", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v["identity"], "guest");
    assert_eq!(v["api_key"], "unset");
    assert_eq!(v["pool"]["target_size"], 1);
    assert!(v["credential"].is_null());

    let resp = app.oneshot(get("/", None)).await.unwrap();
    let v = body_json(resp).await;
    assert!(v["endpoints"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e == "/v1/chat/completions"));
    assert_eq!(mock.page_calls(), 0);
}

#[tokio::test]
async fn models_are_served_from_config() {
    let mock = MockBackend::start().await;
    let mut cfg = test_config(&mock.base_url, IdentityKind::Guest);
    cfg.backend.models = vec!["auto".to_string(), "gpt-4o".to_string()];
    let (app, _) = test_app(cfg);

    let v = body_json(app.clone().oneshot(get("/v1/models", None)).await.unwrap()).await;
    assert_eq!(v["object"], "list");
    let ids: Vec<_> = v["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["auto", "gpt-4o"]);
    assert_eq!(v["data"][0]["owned_by"], "h2ogpte");

    let v = body_json(app.oneshot(get("/v1/models/some-model", None)).await.unwrap()).await;
    assert_eq!(v["id"], "some-model");
    assert_eq!(v["object"], "model");
}

#[tokio::test]
async fn api_key_is_enforced_when_configured() {
    let mock = MockBackend::start().await;
    let mut cfg = test_config(&mock.base_url, IdentityKind::Guest);
    cfg.api_key = "sk-local-gateway".to_string();
    let (app, _) = test_app(cfg);

    let resp = app.clone().oneshot(get("/v1/models", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"]["type"], "invalid_api_key");

    let resp = app
        .clone()
        .oneshot(get("/v1/models", Some("Bearer wrong")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .clone()
        .oneshot(chat_request(&hello(false), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(mock.chat_calls(), 0);

    for auth in ["Bearer sk-local-gateway", "sk-local-gateway"] {
        let resp = app
            .clone()
            .oneshot(get("/v1/models", Some(auth)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{auth}");
    }

    // Health stays open for probes.
    let resp = app.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_requires_the_api_key_and_never_echoes_it() {
    let mock = MockBackend::start().await;
    let mut cfg = test_config(&mock.base_url, IdentityKind::Guest);
    cfg.api_key = "sk-abcdefgh1".to_string();
    let (app, _) = test_app(cfg);

    let resp = app.clone().oneshot(get("/status", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let text = body_text(resp).await;
    assert!(!text.contains("abcdefgh"));
    assert!(!text.contains("username"));

    let resp = app
        .oneshot(get("/status", Some("Bearer sk-abcdefgh1")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = body_text(resp).await;
    assert!(!text.contains("abcdefgh"));
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["api_key"], "set");
}

#[tokio::test]
async fn malformed_requests_get_openai_shaped_400s() {
    let mock = MockBackend::start().await;
    let (app, _) = test_app(test_config(&mock.base_url, IdentityKind::Guest));

    let bodies = [
        "{not json".to_string(),
        json!({"model": "gpt-4o"}).to_string(),
        json!({"model": "gpt-4o", "messages": []}).to_string(),
        json!({"model": "gpt-4o", "messages": "hello"}).to_string(),
    ];
    for body in bodies {
        let resp = app
            .clone()
            .oneshot(chat_request_raw(body.clone(), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
        let v = body_json(resp).await;
        assert_eq!(v["error"]["type"], "invalid_request_error", "{body}");
    }
    assert_eq!(mock.page_calls(), 0);
    assert_eq!(mock.chat_calls(), 0);
}

#[tokio::test]
async fn buffered_completion_returns_backend_text_verbatim() {
    let mock = MockBackend::start().await;
    let (app, state) = test_app(test_config(&mock.base_url, IdentityKind::Guest));

    let resp = app.oneshot(chat_request(&hello(false), None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let v = body_json(resp).await;
    assert_eq!(v["object"], "chat.completion");
    assert_eq!(v["model"], "gpt-4o");
    assert_eq!(v["choices"][0]["message"]["role"], "assistant");
    assert_eq!(v["choices"][0]["message"]["content"], "Hello, world");
    assert_eq!(v["choices"][0]["finish_reason"], "stop");
    assert!(v["usage"]["total_tokens"].as_u64().is_some());

    assert_eq!(mock.chat_calls(), 1);
    assert_eq!(mock.last_query().unwrap()["body"], "hello");
    assert_eq!(state.pool.stats().checked_out, 0);
}

#[tokio::test]
async fn streamed_completion_matches_buffered_one() {
    let mock = MockBackend::start().await;
    let (app, _) = test_app(test_config(&mock.base_url, IdentityKind::Guest));

    let buffered = body_json(
        app.clone()
            .oneshot(chat_request(&hello(false), None))
            .await
            .unwrap(),
    )
    .await;

    let resp = app.oneshot(chat_request(&hello(true), None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    let text = body_text(resp).await;
    assert!(text.trim_end().ends_with("data: [DONE]"));

    let payloads = sse_payloads(&text);
    assert!(payloads
        .iter()
        .all(|p| p["object"] == "chat.completion.chunk"));
    assert_eq!(
        streamed_content(&payloads),
        buffered["choices"][0]["message"]["content"].as_str().unwrap()
    );
    assert_eq!(
        payloads.last().unwrap()["choices"][0]["finish_reason"],
        "stop"
    );
}

#[tokio::test]
async fn system_prompt_and_history_reach_the_backend() {
    let mock = MockBackend::start().await;
    let (app, _) = test_app(test_config(&mock.base_url, IdentityKind::Guest));

    let body = json!({
        "model": "claude-3-5-sonnet",
        "temperature": 0.4,
        "messages": [
            {"role": "system", "content": "answer in French"},
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "salut"},
            {"role": "user", "content": "how are you?"}
        ]
    });
    let resp = app.oneshot(chat_request(&body, None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let q = mock.last_query().unwrap();
    assert_eq!(q["system_prompt"], "answer in French");
    assert_eq!(q["body"], "User: hi\nAssistant: salut\nUser: how are you?");
    // The requested model is not forwarded.
    assert_eq!(q["llm"], "auto");
}
