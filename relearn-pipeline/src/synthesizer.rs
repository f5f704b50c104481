//! The context synthesizer: turns frame chunks into textual [Context]
//! records using a vision model in a rolling multi-turn session.

use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use model_session::{ChatMessage, ChatRequest, Conversation, ModelClient};
use relearn_types::Context;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame_buffer::FrameChunk;
use crate::{ContextWindow, Error, Result, prompts};

#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    pub vision_model: String,
    /// Per-session identity recorded on every context.
    pub author: String,
    /// Completed assistant turns retained before the oldest user/assistant
    /// pair is evicted from the session.
    pub max_turns: usize,
    /// Context window size W; a snapshot is emitted on every insert that
    /// leaves the window holding exactly W contexts.
    pub window_size: usize,
}

/// Run the synthesizer until the chunk queue closes.
///
/// Strictly sequential: chunks are described one at a time against a single
/// rolling conversation. A chunk whose model call fails is dropped; the
/// session log never records a partial turn.
pub async fn run_synthesizer(
    config: SynthesizerConfig,
    client: ModelClient,
    mut chunk_rx: mpsc::Receiver<FrameChunk>,
    snapshot_tx: mpsc::Sender<Vec<Context>>,
) {
    let mut session = Session::new(config.clone(), client);
    let mut window = ContextWindow::new(config.window_size);

    while let Some(chunk) = chunk_rx.recv().await {
        let first_index = chunk.first_index;
        match session.describe_chunk(chunk).await {
            Ok(context) => {
                debug!(
                    "context from frames at {first_index}: {} chars",
                    context.content.len()
                );
                if let Some(snapshot) = window.push(context) {
                    // Blocking send: snapshots are never dropped on
                    // backpressure from the generator.
                    if snapshot_tx.send(snapshot).await.is_err() {
                        info!("snapshot queue closed, stopping synthesizer");
                        return;
                    }
                } else {
                    debug!(
                        "have {}/{} contexts, waiting for more",
                        window.len(),
                        config.window_size
                    );
                }
            }
            Err(e) => {
                warn!("dropping frame chunk at {first_index} after model error: {e}");
            }
        }
    }
    info!("frame chunk queue closed, stopping synthesizer");
}

/// One rolling vision session.
pub struct Session {
    config: SynthesizerConfig,
    client: ModelClient,
    conversation: Conversation,
    first_turn: bool,
}

impl Session {
    pub fn new(config: SynthesizerConfig, client: ModelClient) -> Self {
        Self {
            config,
            client,
            conversation: Conversation::new(),
            first_turn: true,
        }
    }

    /// Describe one chunk, advancing the rolling session on success.
    pub async fn describe_chunk(&mut self, chunk: FrameChunk) -> Result<Context> {
        let time = mean_modified_time(&chunk.frames)?;

        let text = if self.first_turn {
            prompts::FIRST_TURN_PROMPT
        } else {
            prompts::CONTINUATION_PROMPT
        };
        self.conversation
            .push_user_with_images(text, &chunk.frames, "auto")?;

        let request = ChatRequest {
            model: self.config.vision_model.clone(),
            messages: self.conversation.messages().to_vec(),
            temperature: 1.0,
            top_p: 1.0,
            max_completion_tokens: None,
            reasoning_effort: None,
        };

        let description = match self.client.chat_completion(&request).await {
            Ok(response) => match response.text() {
                Ok(text) => text.to_string(),
                Err(e) => {
                    self.conversation.pop_last();
                    return Err(e.into());
                }
            },
            Err(e) => {
                self.conversation.pop_last();
                return Err(e.into());
            }
        };

        self.conversation
            .push(ChatMessage::assistant(description.clone()));
        // The image payloads of the turn just completed are no longer
        // needed; shrink the stored history to the placeholder.
        self.conversation
            .rewrite_previous_user_turn(prompts::HISTORY_PLACEHOLDER);
        if self.conversation.turn_count() >= self.config.max_turns {
            self.conversation.pop_earliest(2);
        }
        self.first_turn = false;

        Ok(Context {
            time,
            author: self.config.author.clone(),
            content: description,
        })
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }
}

/// The arithmetic mean of the frames' modification instants.
fn mean_modified_time(frames: &[PathBuf]) -> Result<DateTime<Local>> {
    assert!(!frames.is_empty());
    let mut sum_millis: i64 = 0;
    for frame in frames {
        let modified = std::fs::metadata(frame)?.modified()?;
        let modified: DateTime<Utc> = modified.into();
        sum_millis += modified.timestamp_millis();
    }
    let mean = sum_millis / frames.len() as i64;
    let mean = DateTime::<Utc>::from_timestamp_millis(mean).ok_or(Error::Timestamp)?;
    Ok(mean.with_timezone(&Local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_frames(dir: &tempfile::TempDir, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.path().join(format!("screenshot_{i:04}.png"));
                let mut fd = std::fs::File::create(&path).unwrap();
                fd.write_all(b"png bytes").unwrap();
                path
            })
            .collect()
    }

    /// Stub chat endpoint: replies with a numbered description and remembers
    /// how many messages each request carried.
    async fn spawn_stub(message_counts: Arc<std::sync::Mutex<Vec<usize>>>) -> String {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = move |Json(body): Json<serde_json::Value>| {
            let calls = calls.clone();
            let message_counts = message_counts.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let messages = body["messages"].as_array().unwrap();
                message_counts.lock().unwrap().push(messages.len());
                Json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": format!("description {n}")}}]
                }))
            }
        };
        let app = axum::Router::new().route("/chat/completions", axum::routing::post(handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_config() -> SynthesizerConfig {
        SynthesizerConfig {
            vision_model: "stub-vlm".into(),
            author: "eugene".into(),
            max_turns: 3,
            window_size: 2,
        }
    }

    #[tokio::test]
    async fn session_rolls_and_rewrites_history() {
        let message_counts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let base = spawn_stub(message_counts.clone()).await;
        let client = ModelClient::new(&base, None);

        let dir = tempfile::tempdir().unwrap();
        let frames = write_frames(&dir, 3);

        let mut session = Session::new(test_config(), client);

        let first = session
            .describe_chunk(FrameChunk {
                first_index: 0,
                frames: frames.clone(),
            })
            .await
            .unwrap();
        assert_eq!(first.author, "eugene");
        assert_eq!(first.content, "description 0");

        // After the turn completes, the stored user message has been
        // rewritten to the placeholder (no image payloads retained).
        assert_eq!(
            session.conversation().messages()[0],
            ChatMessage::user(prompts::HISTORY_PLACEHOLDER)
        );

        let second = session
            .describe_chunk(FrameChunk {
                first_index: 3,
                frames: frames.clone(),
            })
            .await
            .unwrap();
        assert_eq!(second.content, "description 1");

        // First request carried one message, second carried three (the
        // rewritten turn plus its reply plus the new user turn).
        assert_eq!(*message_counts.lock().unwrap(), vec![1, 3]);

        // Third turn reaches max_turns and evicts the oldest pair.
        session
            .describe_chunk(FrameChunk {
                first_index: 6,
                frames,
            })
            .await
            .unwrap();
        assert_eq!(session.conversation().turn_count(), 2);
    }

    #[tokio::test]
    async fn failed_call_leaves_session_clean() {
        // Point the client at a closed port; the call fails outright.
        let client = ModelClient::new("http://127.0.0.1:9", None)
            .with_timeout(std::time::Duration::from_millis(200));

        let dir = tempfile::tempdir().unwrap();
        let frames = write_frames(&dir, 2);

        let mut session = Session::new(test_config(), client);
        let result = session
            .describe_chunk(FrameChunk {
                first_index: 0,
                frames,
            })
            .await;
        assert!(result.is_err());
        assert!(session.conversation().is_empty());
    }

    #[tokio::test]
    async fn context_time_is_mean_of_frame_mtimes() {
        let dir = tempfile::tempdir().unwrap();
        let frames = write_frames(&dir, 2);

        let t0 = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        let t1 = t0 + std::time::Duration::from_secs(100);
        for (frame, mtime) in frames.iter().zip([t0, t1]) {
            let fd = std::fs::OpenOptions::new().write(true).open(frame).unwrap();
            fd.set_modified(mtime).unwrap();
        }

        let mean = mean_modified_time(&frames).unwrap();
        let expected: DateTime<Utc> = (t0 + std::time::Duration::from_secs(50)).into();
        assert_eq!(mean.with_timezone(&Utc), expected);
    }
}
