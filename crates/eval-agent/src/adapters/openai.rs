//! OpenAI-compatible `/chat/completions` backend (llama.cpp, vLLM, ...).

use scoring::TokenUsage;
use serde::{Deserialize, Serialize};

use super::{send_json, GenerationError, HttpBackend, RawCompletion};
use crate::prompts::Prompt;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn request_body<'a>(backend: &'a HttpBackend, prompt: &'a Prompt) -> ChatRequest<'a> {
    ChatRequest {
        model: &backend.model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: &prompt.system,
            },
            ChatMessage {
                role: "user",
                content: &prompt.user,
            },
        ],
        max_tokens: backend.max_tokens,
        temperature: backend.temperature,
        stream: false,
    }
}

fn into_completion(response: ChatResponse) -> Result<RawCompletion, GenerationError> {
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| GenerationError::ParseFailure("response has no choices".into()))?;
    Ok(RawCompletion {
        text,
        tokens: response.usage.map(|u| TokenUsage {
            prompt: u.prompt_tokens,
            completion: u.completion_tokens,
        }),
    })
}

pub async fn complete(backend: &HttpBackend, prompt: &Prompt) -> Result<RawCompletion, GenerationError> {
    let url = format!("{}/chat/completions", backend.base_url);
    let mut request = backend.client().post(&url).json(&request_body(backend, prompt));
    if let Some(key) = &backend.api_key {
        request = request.bearer_auth(key);
    }
    let response: ChatResponse = send_json(request).await?;
    into_completion(response)
}
