//! Chat request checks run before anything is dispatched.

use cluster_common::chat::ChatCompletionRequest;
use cluster_common::{ModelMessage, PromptRequest};

use crate::error::{ApiError, Result};

/// A request that passed validation, ready to fan out into `n` generations.
#[derive(Debug, Clone)]
pub struct ChatPlan {
    pub model: String,
    pub n: usize,
    pub stream: bool,
    pub prompt: PromptRequest,
}

/// `max_n` caps how many choices one request may fan out into.
pub fn validate_chat(request: ChatCompletionRequest, max_n: usize) -> Result<ChatPlan> {
    let model = request
        .model
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("'model' is a required property".to_string()))?;

    let messages = request
        .messages
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("'messages' is a required property".to_string()))?
        .into_messages();

    let n = match request.n {
        Some(n) if n <= 0 => {
            return Err(out_of_range(format!("{} is less than the minimum of 1 - 'n'", n)))
        }
        Some(n) => match usize::try_from(n) {
            Ok(n) if n <= max_n => n,
            _ => {
                return Err(out_of_range(format!(
                    "{} is greater than the maximum of {} - 'n'",
                    n, max_n
                )))
            }
        },
        None => 1,
    };

    let max_new_tokens = match request.max_new_tokens {
        Some(t) if t <= 0 => {
            return Err(out_of_range(format!(
                "{} is less than the minimum of 1 - 'max_tokens'",
                t
            )))
        }
        Some(t) => Some(u32::try_from(t).unwrap_or(u32::MAX)),
        None => None,
    };

    if let Some(t) = request.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(out_of_range(format!(
                "{} is outside the range [0, 2] - 'temperature'",
                t
            )));
        }
    }

    if let Some(p) = request.top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(out_of_range(format!(
                "{} is outside the range [0, 1] - 'top_p'",
                p
            )));
        }
    }

    if let Some(k) = request.top_k {
        if k != -1 && k <= 0 {
            return Err(out_of_range(format!(
                "{} is not -1 or a positive integer - 'top_k'",
                k
            )));
        }
    }

    let prompt = PromptRequest {
        temperature: request.temperature,
        max_new_tokens,
        stop: request.stop.map(|s| s.into_vec()),
        top_p: request.top_p,
        top_k: request.top_k,
        user: request.user,
        ..PromptRequest::new(
            model.clone(),
            messages
                .into_iter()
                .map(|m| ModelMessage::new(m.role, m.content))
                .collect(),
        )
    };

    Ok(ChatPlan {
        model,
        n,
        stream: request.stream,
        prompt,
    })
}

fn out_of_range(message: String) -> ApiError {
    ApiError::ParamOutOfRange(message)
}
