use std::convert::Infallible;

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{info, warn};

use crate::{
    error::UpstreamError,
    models::{ChatMessage, ChatRequest, ChatResponse},
    ollama::{parse_chunk, system_message, LineBuffer, DEFAULT_TEMPERATURE},
    AppState,
};

const STREAM_DONE: &str = "[DONE]";

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.ollama.list_models().await {
        Ok(models) => (StatusCode::OK, Json(json!({ "ok": true, "models": models }))),
        Err(err) => {
            warn!("Ollama health check failed: {err}");
            (StatusCode::BAD_GATEWAY, Json(json!({ "ok": false })))
        }
    }
}

pub async fn chat(State(state): State<AppState>, Json(payload): Json<ChatRequest>) -> Response {
    let temperature = payload.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    let Some(messages) = with_system_prompt(payload) else {
        return missing_messages();
    };

    match state.ollama.chat(&messages, temperature).await {
        Ok((reply, raw)) => Json(ChatResponse {
            model: state.ollama.model().to_string(),
            reply,
            raw,
        })
        .into_response(),
        Err(err) => upstream_failed(err),
    }
}

pub async fn chat_stream(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Response {
    let temperature = payload.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    let Some(messages) = with_system_prompt(payload) else {
        return missing_messages();
    };

    let upstream = match state.ollama.chat_stream(&messages, temperature).await {
        Ok(response) => response,
        Err(err) => return upstream_failed(err),
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    tokio::spawn(forward_chat_stream(upstream, tx));

    let mut response = Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response();
    // Keeps reverse proxies from buffering the event stream.
    response.headers_mut().insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

/// Re-emits Ollama's NDJSON chunks as `{content, done}` events, ending with
/// `[DONE]`.
async fn forward_chat_stream(
    upstream: reqwest::Response,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    let mut body = std::pin::pin!(upstream.bytes_stream());
    let mut lines = LineBuffer::default();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Chat stream interrupted: {err}");
                let event = Event::default().data(json!({ "error": err.to_string() }).to_string());
                let _ = tx.send(Ok(event)).await;
                return;
            }
        };

        for line in lines.push(&bytes) {
            let Some(parsed) = parse_chunk(&line) else {
                continue;
            };
            if let Some(content) = parsed.content() {
                let event = Event::default()
                    .data(json!({ "content": content, "done": parsed.done }).to_string());
                if tx.send(Ok(event)).await.is_err() {
                    info!("Chat stream client disconnected");
                    return;
                }
            }
            if parsed.done {
                let _ = tx.send(Ok(Event::default().data(STREAM_DONE))).await;
                return;
            }
        }
    }

    if let Some(parsed) = lines.finish().as_deref().and_then(parse_chunk) {
        if let Some(content) = parsed.content() {
            let event = Event::default()
                .data(json!({ "content": content, "done": parsed.done }).to_string());
            let _ = tx.send(Ok(event)).await;
        }
    }
    let _ = tx.send(Ok(Event::default().data(STREAM_DONE))).await;
}

fn with_system_prompt(payload: ChatRequest) -> Option<Vec<ChatMessage>> {
    let messages = payload.into_messages();
    if messages.is_empty() {
        return None;
    }
    let mut all = Vec::with_capacity(messages.len() + 1);
    all.push(system_message());
    all.extend(messages);
    Some(all)
}

fn missing_messages() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Provide `prompt` or `messages[]`" })),
    )
        .into_response()
}

fn upstream_failed(err: UpstreamError) -> Response {
    warn!("Ollama request failed: {err}");
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": "ai_upstream_failed", "detail": err.to_string() })),
    )
        .into_response()
}
