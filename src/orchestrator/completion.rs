use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::backend::ChatReply;
use super::error::{GatewayError, UpstreamError};
use super::openai::{
    chat_chunk_json, chat_completion_json, completion_id, sse_data, translate_request,
    ChatCompletionRequest, SSE_DONE,
};
use super::pool::{SessionLease, SessionPool};
use super::time::unix_secs;

/// Server-sent event frames, each already terminated by a blank line.
pub type SseFrames = BoxStream<'static, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Emitting,
    Done,
    Failed,
}

/// Gives up on a session whose answer broke off. An auth error at that point still means the
/// credential is dead, so it is invalidated before the next request picks it up.
fn abandon(pool: &SessionPool, lease: SessionLease, err: &UpstreamError) {
    if err.is_auth_failure() {
        pool.gateway()
            .credentials()
            .invalidate(lease.credential_version());
    }
    pool.evict(lease);
}

/// Runs one request to completion and returns the aggregated OpenAI completion object.
pub async fn complete(pool: &SessionPool, req: &ChatCompletionRequest) -> Result<Value, GatewayError> {
    let query = translate_request(req)?;
    let lease = pool.checkout().await?;
    let ChatReply { lease, mut chunks } = pool.gateway().send(pool, lease, &query).await?;

    let mut content = String::new();
    while let Some(item) = chunks.next().await {
        match item {
            Ok(text) => content.push_str(&text),
            Err(e) => {
                drop(chunks);
                abandon(pool, lease, &e);
                log::warn!("backend answer failed after {} chars: {e}", content.len());
                // Too late to retry: part of the answer already came from this session.
                return Err(if e.is_auth_failure() {
                    GatewayError::StreamInterrupted(e.to_string())
                } else {
                    e.into()
                });
            }
        }
    }
    drop(chunks);
    pool.checkin(lease);

    Ok(chat_completion_json(
        &completion_id(),
        &req.model,
        unix_secs(),
        &query,
        &content,
    ))
}

/// Starts a streamed completion. Failures before the first frame are returned as errors so the
/// caller can answer with a plain JSON error instead of an event stream.
pub async fn stream(pool: SessionPool, req: &ChatCompletionRequest) -> Result<SseFrames, GatewayError> {
    let query = translate_request(req)?;
    let lease = pool.checkout().await?;
    let ChatReply { lease, mut chunks } = pool.gateway().send(&pool, lease, &query).await?;

    let id = completion_id();
    let model = req.model.clone();
    let created = unix_secs();

    let frames = async_stream::stream! {
        let mut state = StreamState::Open;
        let mut failure = None;
        yield sse_data(&chat_chunk_json(&id, &model, created, json!({"role": "assistant", "content": ""}), None));

        loop {
            match chunks.next().await {
                Some(Ok(text)) => {
                    state = StreamState::Emitting;
                    yield sse_data(&chat_chunk_json(&id, &model, created, json!({"content": text}), None));
                }
                Some(Err(e)) => {
                    let stage = if state == StreamState::Open { "before any content" } else { "mid-answer" };
                    log::warn!("stream {id} interrupted {stage}: {e}");
                    state = StreamState::Failed;
                    let err = GatewayError::StreamInterrupted(e.to_string());
                    failure = Some(e);
                    yield sse_data(&err.to_openai_json());
                    break;
                }
                None => {
                    if state == StreamState::Open {
                        log::debug!("stream {id} ended without content");
                    }
                    state = StreamState::Done;
                    yield sse_data(&chat_chunk_json(&id, &model, created, json!({}), Some("stop")));
                    break;
                }
            }
        }

        drop(chunks);
        match (state, failure) {
            (StreamState::Done, _) => pool.checkin(lease),
            (_, Some(e)) => abandon(&pool, lease, &e),
            (_, None) => pool.evict(lease),
        }
        yield SSE_DONE.to_string();
    };
    Ok(frames.boxed())
}
