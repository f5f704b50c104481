//! The Q&A generator: fans a window snapshot out across every
//! (model, prompt fragment) pair and parses the replies into training pairs.

use std::sync::LazyLock;

use futures::future;
use model_session::{ChatMessage, ChatRequest, ModelClient};
use regex::Regex;
use relearn_types::{Context, ExampleRecord, QAPair};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::prompts;

#[derive(Debug, Clone)]
pub struct QaGeneratorConfig {
    /// The text models to fan out across (M).
    pub models: Vec<String>,
    pub max_completion_tokens: u32,
    /// Fan-out rounds accumulated before the pairs are handed to the sink.
    pub rounds_per_dispatch: usize,
}

/// Serialize a window snapshot to the canonical transcript consumed by the
/// Q&A models: one header-plus-content block per context, blank-line
/// separated.
pub fn render_transcript(contexts: &[Context]) -> String {
    contexts
        .iter()
        .map(|ctx| ctx.to_string())
        .collect::<Vec<_>>()
        .join("\n\n")
}

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());
static SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-+$").unwrap());
static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^###\s*\d+\.\s*").unwrap());

/// Parse a model reply of `### N. question / answer` sections into pairs.
///
/// Thinking blocks (`<think>…</think>`) and all-hyphen separator lines are
/// removed first; within each section the first line is the question and the
/// remaining text is the answer.
pub fn parse_qa_pairs(response: &str) -> Vec<QAPair> {
    let without_thinking = THINK_RE.replace_all(response, "");
    let cleaned = without_thinking
        .trim()
        .lines()
        .map(str::trim)
        .filter(|line| !SEPARATOR_RE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n");

    let mut pairs = Vec::new();
    for section in HEADER_RE.split(&cleaned) {
        let section = section.trim();
        if section.is_empty() {
            continue;
        }
        let (question, answer) = match section.split_once('\n') {
            Some((question, answer)) => (question, answer),
            None => (section, ""),
        };
        pairs.push(QAPair {
            question: question.trim().to_string(),
            answer: answer.trim().to_string(),
        });
    }
    pairs
}

/// Generate pairs for one snapshot: one call per (model, fragment) pair, all
/// in parallel, failures yielding empty results.
pub async fn generate_for_snapshot(
    config: &QaGeneratorConfig,
    client: &ModelClient,
    snapshot: &[Context],
) -> Vec<QAPair> {
    let transcript = render_transcript(snapshot);

    let mut calls = Vec::with_capacity(config.models.len() * prompts::PROMPT_FRAGMENTS.len());
    for model in &config.models {
        for fragment in prompts::PROMPT_FRAGMENTS {
            let request = ChatRequest {
                model: model.clone(),
                messages: vec![
                    ChatMessage::system(prompts::qa_system_prompt(fragment)),
                    ChatMessage::user(transcript.clone()),
                ],
                temperature: 1.0,
                top_p: 0.99,
                max_completion_tokens: Some(config.max_completion_tokens),
                reasoning_effort: prompts::reasoning_effort_for(model).map(String::from),
            };
            let client = client.clone();
            let model = model.clone();
            calls.push(async move {
                let started = std::time::Instant::now();
                match client.chat_completion(&request).await {
                    Ok(response) => match response.text() {
                        Ok(text) => {
                            debug!(
                                "model {model} replied in {:.2}s",
                                started.elapsed().as_secs_f64()
                            );
                            parse_qa_pairs(text)
                        }
                        Err(e) => {
                            warn!("model {model} returned no content: {e}");
                            Vec::new()
                        }
                    },
                    Err(e) => {
                        warn!("Q&A call to {model} failed: {e}");
                        Vec::new()
                    }
                }
            });
        }
    }

    future::join_all(calls).await.into_iter().flatten().collect()
}

/// Run the generator until the snapshot queue closes, handing accumulated
/// records to `sink` (the example store's append path).
pub async fn run_qa_generator<F, Fut>(
    config: QaGeneratorConfig,
    client: ModelClient,
    mut snapshot_rx: mpsc::Receiver<Vec<Context>>,
    sink: F,
) where
    F: Fn(Vec<ExampleRecord>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut pending: Vec<ExampleRecord> = Vec::new();
    let mut rounds = 0usize;

    while let Some(snapshot) = snapshot_rx.recv().await {
        let pairs = generate_for_snapshot(&config, &client, &snapshot).await;
        info!(
            "generated {} Q&A pairs from {} contexts",
            pairs.len(),
            snapshot.len()
        );
        pending.extend(pairs.into_iter().map(ExampleRecord::from));
        rounds += 1;

        if rounds >= config.rounds_per_dispatch {
            if !pending.is_empty() {
                sink(std::mem::take(&mut pending)).await;
            }
            rounds = 0;
        }
    }

    // Drain whatever accumulated before the queue closed.
    if !pending.is_empty() {
        sink(pending).await;
    }
    info!("snapshot queue closed, stopping Q&A generator");
}
