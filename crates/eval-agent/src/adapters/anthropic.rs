//! Hosted Messages API backend.

use scoring::TokenUsage;
use serde::{Deserialize, Serialize};

use super::{send_json, GenerationError, HttpBackend, RawCompletion};
use crate::prompts::Prompt;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn into_completion(response: MessagesResponse) -> Result<RawCompletion, GenerationError> {
    let text: String = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        return Err(GenerationError::ParseFailure("response has no text blocks".into()));
    }
    Ok(RawCompletion {
        text,
        tokens: response.usage.map(|u| TokenUsage {
            prompt: u.input_tokens,
            completion: u.output_tokens,
        }),
    })
}

pub async fn complete(backend: &HttpBackend, prompt: &Prompt) -> Result<RawCompletion, GenerationError> {
    let url = format!("{}/v1/messages", backend.base_url);
    let body = MessagesRequest {
        model: &backend.model,
        system: &prompt.system,
        messages: vec![Message {
            role: "user",
            content: &prompt.user,
        }],
        max_tokens: backend.max_tokens,
        temperature: backend.temperature,
    };
    let mut request = backend
        .client()
        .post(&url)
        .header("anthropic-version", API_VERSION)
        .json(&body);
    if let Some(key) = &backend.api_key {
        request = request.header("x-api-key", key);
    }
    let response: MessagesResponse = send_json(request).await?;
    into_completion(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joins_text_blocks_and_reads_usage() {
        let body = r#"{
            "id": "msg_1",
            "type": "message",
            "content": [
                {"type": "text", "text": "```sql\nSELECT name "},
                {"type": "tool_use", "id": "t", "name": "x", "input": {}},
                {"type": "text", "text": "FROM student\n```"}
            ],
            "usage": {"input_tokens": 300, "output_tokens": 12}
        }"#;
        let response: MessagesResponse = serde_json::from_str(body).unwrap();
        let completion = into_completion(response).unwrap();
        assert_eq!(completion.text, "```sql\nSELECT name FROM student\n```");
        assert_eq!(completion.tokens.unwrap().total(), 312);
    }

    #[test]
    fn test_no_text_is_parse_failure() {
        let response: MessagesResponse = serde_json::from_str(r#"{"content": []}"#).unwrap();
        assert!(into_completion(response).is_err());
    }
}
