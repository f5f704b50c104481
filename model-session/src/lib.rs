//! Client sessions for OpenAI-compatible model endpoints.
//!
//! [ModelClient] assembles chat- and text-completion requests directly on
//! hyper's legacy client; [Conversation] holds the rolling multi-turn message
//! log used for vision sessions, including the in-place rewrite of the
//! previous user turn that keeps image payloads out of the stored history.

use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("hyper error `{0}`")]
    Hyper(#[from] hyper::Error),
    #[error("hyper-util error `{0}`")]
    HyperUtil(#[from] hyper_util::client::legacy::Error),
    #[error("invalid uri `{0}`")]
    Uri(#[from] http::uri::InvalidUri),
    #[error("IO error `{0}`")]
    Io(#[from] std::io::Error),
    #[error("JSON error `{0}`")]
    Json(#[from] serde_json::Error),
    #[error("request not successful. status code: `{0}`")]
    RequestFailed(http::StatusCode),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("response contained no message content")]
    EmptyResponse,
}

pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Wire types for the chat completions API.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message content is either a plain string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system<S: Into<String>>(text: S) -> Self {
        ChatMessage {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn user<S: Into<String>>(text: S) -> Self {
        ChatMessage {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn assistant<S: Into<String>>(text: S) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    /// Vendor-specific reasoning knob; omitted for models without one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    pub content: Option<String>,
}

impl ChatResponse {
    /// The text of the first choice.
    pub fn text(&self) -> Result<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .ok_or(Error::EmptyResponse)
    }
}

// ---------------------------------------------------------------------------
// Client.

/// A client for one OpenAI-compatible API base (e.g. `https://api.openai.com/v1`
/// or a local serving runtime's `http://127.0.0.1:8000/v1`).
#[derive(Clone, Debug)]
pub struct ModelClient {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl ModelClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.post_json("chat/completions", request).await
    }

    /// Raw text completion, used when proxying to the serving runtime.
    pub async fn completion(
        &self,
        request: &relearn_types::CompletionRequest,
    ) -> Result<relearn_types::CompletionResponse> {
        self.post_json("completions", request).await
    }

    /// POST a JSON payload to a path relative to the API base and parse the
    /// JSON response.
    pub async fn post_json<T, R>(&self, rel: &str, payload: &T) -> Result<R>
    where
        T: Serialize,
        R: serde::de::DeserializeOwned,
    {
        let uri: hyper::Uri = format!("{}/{}", self.base_url, rel).parse()?;
        let body_bytes = serde_json::to_vec(payload)?;

        let mut req = hyper::Request::new(Full::new(Bytes::from(body_bytes)));
        *req.method_mut() = hyper::Method::POST;
        *req.uri_mut() = uri;
        req.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &self.api_key {
            let value = format!("Bearer {key}");
            if let Ok(value) = http::HeaderValue::from_str(&value) {
                req.headers_mut().insert(http::header::AUTHORIZATION, value);
            }
        }

        let client =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build(hyper_tls::HttpsConnector::new());

        tracing::trace!("making request to {}", req.uri());
        let response = match tokio::time::timeout(self.timeout, client.request(req)).await {
            Ok(result) => result?,
            Err(_elapsed) => return Err(Error::Timeout(self.timeout)),
        };

        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            let body_str = String::from_utf8_lossy(body.as_ref());
            tracing::error!("response {status:?}: \"{body_str}\"");
            return Err(Error::RequestFailed(status));
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

// ---------------------------------------------------------------------------
// Image payloads.

fn image_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Read an image from disk and encode it as a base64 data-URL content part.
pub fn image_content_part(path: &Path, detail: &str) -> Result<ContentPart> {
    let bytes = std::fs::read(path)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(ContentPart::ImageUrl {
        image_url: ImageUrl {
            url: format!("data:{};base64,{}", image_mime_type(path), encoded),
            detail: Some(detail.to_string()),
        },
    })
}

// ---------------------------------------------------------------------------
// Rolling conversation log.

/// A rolling multi-turn conversation with in-place history rewriting.
///
/// The log holds alternating user/assistant messages for one session. The
/// caller is responsible for only recording complete turns: push the user
/// turn, make the call, then either record the assistant reply or pop the
/// user turn back off on failure.
#[derive(Debug, Default, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Push a user turn of text plus images (as base64 data URLs).
    pub fn push_user_with_images(
        &mut self,
        text: &str,
        images: &[std::path::PathBuf],
        detail: &str,
    ) -> Result<()> {
        let mut parts = vec![ContentPart::Text {
            text: text.to_string(),
        }];
        for image in images {
            parts.push(image_content_part(image, detail)?);
        }
        self.messages.push(ChatMessage {
            role: Role::User,
            content: MessageContent::Parts(parts),
        });
        Ok(())
    }

    /// Drop the most recent message (used to roll back a failed turn).
    pub fn pop_last(&mut self) -> Option<ChatMessage> {
        self.messages.pop()
    }

    /// Rewrite the message before the most recent one in place.
    ///
    /// After an assistant reply is recorded this is the user message of the
    /// completed turn; replacing it with a compact placeholder keeps image
    /// payloads out of the retained history.
    pub fn rewrite_previous_user_turn(&mut self, text: &str) {
        let n = self.messages.len();
        if n >= 2 {
            self.messages[n - 2] = ChatMessage::user(text);
        }
    }

    /// Number of completed user/assistant exchanges.
    pub fn turn_count(&self) -> usize {
        let users = self
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .count();
        let assistants = self
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        users.min(assistants)
    }

    /// Remove the `k` earliest messages.
    pub fn pop_earliest(&mut self, k: usize) {
        let k = k.min(self.messages.len());
        self.messages.drain(..k);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn chat_request_serialization_omits_absent_knobs() {
        let request = ChatRequest {
            model: "qwen/qwen3-32b".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 1.0,
            top_p: 0.99,
            max_completion_tokens: None,
            reasoning_effort: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("max_completion_tokens").is_none());
        assert!(value.get("reasoning_effort").is_none());
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "hi");
    }

    #[test]
    fn image_parts_use_data_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let mut fd = std::fs::File::create(&path).unwrap();
        fd.write_all(b"not really a png").unwrap();

        let part = image_content_part(&path, "auto").unwrap();
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "image_url");
        let url = value["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(value["image_url"]["detail"], "auto");
    }

    #[test]
    fn conversation_rewrites_previous_user_turn() {
        let mut conversation = Conversation::new();
        conversation
            .push_user_with_images("describe", &[], "auto")
            .unwrap();
        conversation.push(ChatMessage::assistant("a description"));
        conversation.rewrite_previous_user_turn("placeholder");

        assert_eq!(conversation.len(), 2);
        assert_eq!(
            conversation.messages()[0],
            ChatMessage::user("placeholder")
        );
        assert_eq!(
            conversation.messages()[1],
            ChatMessage::assistant("a description")
        );
    }

    #[test]
    fn conversation_turn_count_and_eviction() {
        let mut conversation = Conversation::new();
        for i in 0..3 {
            conversation.push(ChatMessage::user(format!("u{i}")));
            conversation.push(ChatMessage::assistant(format!("a{i}")));
        }
        assert_eq!(conversation.turn_count(), 3);

        conversation.pop_earliest(2);
        assert_eq!(conversation.turn_count(), 2);
        assert_eq!(conversation.messages()[0], ChatMessage::user("u1"));
    }

    #[test]
    fn failed_turn_rolls_back_cleanly() {
        let mut conversation = Conversation::new();
        conversation
            .push_user_with_images("first", &[], "auto")
            .unwrap();
        conversation.push(ChatMessage::assistant("ok"));

        let before = conversation.messages().to_vec();
        conversation
            .push_user_with_images("second", &[], "auto")
            .unwrap();
        // The model call failed; roll the user turn back off.
        conversation.pop_last();
        assert_eq!(conversation.messages(), &before[..]);
    }

    #[test]
    fn chat_response_text_extraction() {
        let raw = r#"{"choices": [{"message": {"role": "assistant", "content": "hello"}}]}"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.text().unwrap(), "hello");

        let raw = r#"{"choices": []}"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert!(matches!(response.text(), Err(Error::EmptyResponse)));
    }
}
