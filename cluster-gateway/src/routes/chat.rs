//! OpenAI-compatible /v1/chat/completions endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use cluster_common::chat::{
    completion_id, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, UsageInfo,
};
use cluster_common::{FinishReason, ModelUsage, WorkerType};
use futures_util::future::join_all;
use futures_util::stream::select_all;
use futures_util::StreamExt;
use serde::Serialize;

use super::check_model;
use crate::error::{ApiError, Result};
use crate::stream::{ChunkAction, StreamAssembler};
use crate::validation::{validate_chat, ChatPlan};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// POST /v1/chat/completions
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let plan = validate_chat(request, state.config.api.max_n)?;
    check_model(&state, &plan.model, &[WorkerType::Llm]).await?;

    if plan.stream {
        stream_completion(&state, plan).await
    } else {
        Ok(Json(complete(&state, plan).await?).into_response())
    }
}

/// Run `n` generations concurrently and fold them into one response.
async fn complete(state: &AppState, plan: ChatPlan) -> Result<ChatCompletionResponse> {
    let calls = (0..plan.n).map(|_| state.manager.generate(plan.prompt.clone()));
    let outputs = join_all(calls).await;

    let mut choices = Vec::with_capacity(outputs.len());
    let mut usage = ModelUsage::default();
    for (index, output) in outputs.into_iter().enumerate() {
        let output = output?;
        if output.is_error() {
            return Err(model_worker::Error::from_output(&output).into());
        }
        if let Some(u) = &output.usage {
            usage.add(u);
        }
        choices.push(Choice {
            index: index as u32,
            message: ChatMessage::assistant(output.text),
            finish_reason: output.finish_reason.or(Some(FinishReason::Stop)),
        });
    }

    Ok(ChatCompletionResponse::new(
        plan.model,
        choices,
        UsageInfo::from(usage),
    ))
}

/// Stream `n` choices as SSE frames.
///
/// Every choice stream is opened before the response starts, so selection failures
/// still come back as plain HTTP errors.
async fn stream_completion(state: &AppState, plan: ChatPlan) -> Result<Response> {
    let mut choices = Vec::with_capacity(plan.n);
    for index in 0..plan.n {
        let outputs = state.manager.generate_stream(plan.prompt.clone()).await?;
        choices.push(outputs.map(move |output| (index, output)));
    }

    let n = plan.n;
    let model = plan.model;
    let mut assembler = StreamAssembler::new(
        completion_id(),
        chrono::Utc::now().timestamp(),
        model.clone(),
        n,
    );

    let frames = stream! {
        for index in 0..n {
            yield data_frame(&assembler.role_chunk(index));
        }

        let mut merged = select_all(choices);
        let mut deferred = Vec::new();
        while let Some((index, output)) = merged.next().await {
            if output.is_error() {
                tracing::warn!(
                    model = %model,
                    choice = index,
                    code = output.error_code,
                    "Generation failed mid-stream"
                );
                yield data_frame(&model_worker::Error::from_output(&output).to_body());
                return;
            }
            match assembler.push(index, &output) {
                ChunkAction::Emit(chunk) => yield data_frame(&chunk),
                ChunkAction::Defer(chunk) => deferred.push(chunk),
                ChunkAction::Skip => {}
            }
        }

        for chunk in deferred {
            yield data_frame(&chunk);
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(frames).into_response())
}

fn data_frame<T: Serialize>(payload: &T) -> std::result::Result<Event, Infallible> {
    Ok(Event::default().data(serde_json::to_string(payload).unwrap_or_default()))
}
