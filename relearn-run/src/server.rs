//! The ingress HTTP API.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use model_session::ModelClient;
use rand::seq::IndexedRandom;
use relearn_types::{
    Adapter, CompletionRequest, ExampleRecord, InferRequest, InferResponse, LossReport,
    UploadRecord, UploadResponse,
};
use serde::Deserialize;
use tracing::error;

use crate::dispatcher::TrainingDispatcher;
use crate::loss_tail::LossCell;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<TrainingDispatcher>,
    pub loss: Arc<LossCell>,
    /// Client for the serving runtime's completions API.
    pub runtime: ModelClient,
    pub serving_model: String,
    /// Default sample count per batch for `/get_data`.
    pub samples_per_batch: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/get_data", get(get_data))
        .route("/latest_loss", get(latest_loss))
        .route("/infer", post(infer))
        .route("/adapter", get(adapter))
        .with_state(state)
}

type HandlerError = (StatusCode, String);

/// Accept prompt/completion (or question/answer) pairs, append them to the
/// store and trigger training for every full batch that can be carved. The
/// response is returned as soon as carving completes; training runs on.
async fn upload(
    State(state): State<AppState>,
    Json(payloads): Json<Vec<UploadRecord>>,
) -> Result<Json<UploadResponse>, HandlerError> {
    let records: Vec<ExampleRecord> = payloads.into_iter().map(UploadRecord::normalize).collect();

    match state.dispatcher.upload(records).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            error!("upload failed: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("store error: {e}"),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetDataParams {
    samples_per_batch: Option<usize>,
}

/// Uniform random samples from each finalized batch file, latest batch first.
async fn get_data(
    State(state): State<AppState>,
    Query(params): Query<GetDataParams>,
) -> Result<Json<Vec<Vec<ExampleRecord>>>, HandlerError> {
    let samples_per_batch = params.samples_per_batch.unwrap_or(state.samples_per_batch);
    let store = state.dispatcher.store();

    let sampled = tokio::task::spawn_blocking(move || -> example_store::Result<_> {
        let mut result = Vec::new();
        let mut rng = rand::rng();
        for batch_path in store.batch_files()? {
            let records = example_store::read_batch_file(&batch_path)?;
            let sample_size = samples_per_batch.min(records.len());
            if sample_size > 0 {
                let sample: Vec<ExampleRecord> = records
                    .choose_multiple(&mut rng, sample_size)
                    .cloned()
                    .collect();
                result.push(sample);
            }
        }
        Ok(result)
    })
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("sampling task failed: {e}"),
        )
    })?
    .map_err(|e| {
        error!("get_data failed: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("store error: {e}"),
        )
    })?;

    Ok(Json(sampled))
}

/// The most recent training loss observed by the telemetry tailer.
async fn latest_loss(State(state): State<AppState>) -> Result<Json<LossReport>, HandlerError> {
    match state.loss.load() {
        Some(loss) => Ok(Json(LossReport { loss })),
        None => Err((
            StatusCode::NOT_FOUND,
            "no loss value available yet".to_string(),
        )),
    }
}

/// Proxy a prompt to the serving runtime's completion API.
async fn infer(
    State(state): State<AppState>,
    Json(request): Json<InferRequest>,
) -> Result<Json<InferResponse>, HandlerError> {
    let completion = CompletionRequest {
        model: state.serving_model.clone(),
        prompt: request.prompt,
        max_tokens: 512,
        temperature: 0.7,
    };

    match state.runtime.completion(&completion).await {
        Ok(response) => match response.choices.into_iter().next() {
            Some(choice) => Ok(Json(InferResponse {
                output: choice.text,
            })),
            None => Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "serving runtime returned no choices".to_string(),
            )),
        },
        Err(e) => {
            error!("inference proxy failed: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// The dispatcher's current adapter, 404 before the first successful job.
async fn adapter(State(state): State<AppState>) -> Result<Json<Adapter>, HandlerError> {
    match state.dispatcher.current_adapter().await {
        Some(adapter) => Ok(Json(adapter)),
        None => Err((StatusCode::NOT_FOUND, "no adapter trained yet".to_string())),
    }
}
