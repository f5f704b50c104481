//! Core type definitions shared by the relearn pipeline, store and server.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// A single question/answer pair parsed from a model reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QAPair {
    pub question: String,
    pub answer: String,
}

/// One training record, the on-disk shape in the example store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleRecord {
    pub prompt: String,
    pub completion: String,
}

impl From<QAPair> for ExampleRecord {
    fn from(qa: QAPair) -> ExampleRecord {
        ExampleRecord {
            prompt: qa.question,
            completion: qa.answer,
        }
    }
}

/// An element of an upload payload.
///
/// Uploaders send either `prompt`/`completion` (already in storage shape) or
/// `question`/`answer`; both are normalized to [ExampleRecord] at the ingress
/// boundary. Elements of a single upload may mix the two shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UploadRecord {
    Example { prompt: String, completion: String },
    QA { question: String, answer: String },
}

impl UploadRecord {
    pub fn normalize(self) -> ExampleRecord {
        match self {
            UploadRecord::Example { prompt, completion } => ExampleRecord { prompt, completion },
            UploadRecord::QA { question, answer } => ExampleRecord {
                prompt: question,
                completion: answer,
            },
        }
    }
}

/// Response body of `POST /upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: String,
    pub count: usize,
    pub appended: usize,
    /// Records left in the store after any carve (always `< batch size`
    /// when `training_triggered`).
    pub pending_examples: usize,
    pub training_triggered: bool,
    pub training_requests: usize,
    pub train_files: Vec<String>,
}

/// A timestamped textual description of a window of user activity.
///
/// `time` is the mean of the source frames' modification instants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub time: DateTime<Local>,
    pub author: String,
    pub content: String,
}

impl std::fmt::Display for Context {
    /// Renders the canonical transcript block consumed by the Q&A generator.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let formatted_time = self.time.format("%A %B %dth %I:%M%p");
        write!(
            f,
            "All of this work was done on {} by {}:\n\n{}",
            formatted_time, self.author, self.content
        )
    }
}

/// A fine-tuned adapter registered with the serving runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adapter {
    pub id: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

/// Request body for the trainer's `/train-and-update` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    pub data_path: String,
    /// The adapter the trainer should resume from. Absent for the first job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_adapter_path: Option<String>,
}

/// Response body of the trainer's `/train-and-update` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainResponse {
    pub status: String,
    pub adapter_name: String,
    pub new_adapter_path: String,
    pub previous_adapter_path: Option<String>,
}

/// Request body for `POST /infer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferRequest {
    pub prompt: String,
}

/// Response body of `POST /infer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferResponse {
    pub output: String,
}

/// Response body of `GET /latest_loss`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossReport {
    pub loss: f64,
}

/// Request body for the serving runtime's `/v1/completions` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
}

/// Response body of the serving runtime's `/v1/completions` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<CompletionChoice>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_record_normalizes_both_shapes() {
        let raw = r#"[{"prompt": "p", "completion": "c"}, {"question": "q", "answer": "a"}]"#;
        let records: Vec<UploadRecord> = serde_json::from_str(raw).unwrap();
        let normalized: Vec<ExampleRecord> =
            records.into_iter().map(UploadRecord::normalize).collect();
        assert_eq!(
            normalized,
            vec![
                ExampleRecord {
                    prompt: "p".into(),
                    completion: "c".into()
                },
                ExampleRecord {
                    prompt: "q".into(),
                    completion: "a".into()
                },
            ]
        );
    }

    #[test]
    fn upload_record_rejects_unknown_shape() {
        let raw = r#"[{"input": "p", "output": "c"}]"#;
        let parsed: Result<Vec<UploadRecord>, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn context_transcript_block() {
        use chrono::TimeZone;
        let ctx = Context {
            time: Local.with_ymd_and_hms(2025, 10, 24, 23, 40, 0).unwrap(),
            author: "eugene".into(),
            content: "Opened the spreadsheet.".into(),
        };
        let rendered = ctx.to_string();
        assert!(rendered.starts_with("All of this work was done on Friday October 24th 11:40PM by eugene:"));
        assert!(rendered.ends_with("\n\nOpened the spreadsheet."));
    }
}
