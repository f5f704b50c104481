//! The training dispatcher: the upload composite (append, carve, schedule
//! training) and the process-wide adapter pointer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use example_store::ExampleStore;
use model_session::ModelClient;
use relearn_types::{Adapter, ExampleRecord, TrainRequest, TrainResponse, UploadResponse};
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

/// The last successfully trained adapter plus its retained predecessors.
///
/// Superseded adapter files are never deleted here; cleaning them up after a
/// grace period is left to an out-of-band job.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    pub current: Option<Adapter>,
    pub history: Vec<Adapter>,
}

/// Trainer client plus the registry it updates; shared with the background
/// training tasks.
struct TrainerHandle {
    trainer: ModelClient,
    /// Held across the whole train-then-swap sequence so that no two jobs
    /// observe the same stale base adapter.
    registry: Mutex<AdapterRegistry>,
}

impl TrainerHandle {
    /// Run one training job and swap the current adapter on success.
    ///
    /// On any failure the pointer is left alone and the next batch retries
    /// against the same base. No automatic retry.
    async fn train(&self, batch_path: &Path) -> model_session::Result<Adapter> {
        let mut registry = self.registry.lock().await;

        let request = TrainRequest {
            data_path: batch_path.to_string_lossy().into_owned(),
            base_adapter_path: registry.current.as_ref().map(|a| a.path.clone()),
        };
        info!("triggering training for {}", batch_path.display());

        let response: TrainResponse = self.trainer.post_json("train-and-update", &request).await?;

        let adapter = Adapter {
            id: response.adapter_name,
            path: response.new_adapter_path,
            created_at: Utc::now(),
        };
        info!("current adapter is now {} at {}", adapter.id, adapter.path);
        if let Some(previous) = registry.current.replace(adapter.clone()) {
            registry.history.push(previous);
        }
        Ok(adapter)
    }
}

pub struct TrainingDispatcher {
    store: Arc<ExampleStore>,
    batch_size: usize,
    handle: Arc<TrainerHandle>,
    inflight: Arc<Semaphore>,
}

impl TrainingDispatcher {
    pub fn new(
        store: Arc<ExampleStore>,
        trainer: ModelClient,
        batch_size: usize,
        max_inflight: usize,
    ) -> Self {
        assert!(batch_size > 0);
        Self {
            store,
            batch_size,
            handle: Arc::new(TrainerHandle {
                trainer,
                registry: Mutex::new(AdapterRegistry::default()),
            }),
            inflight: Arc::new(Semaphore::new(max_inflight)),
        }
    }

    pub fn store(&self) -> Arc<ExampleStore> {
        self.store.clone()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn current_adapter(&self) -> Option<Adapter> {
        self.handle.registry.lock().await.current.clone()
    }

    /// Train one batch file, serialized with all other jobs.
    pub async fn train(&self, batch_path: &Path) -> model_session::Result<Adapter> {
        self.handle.train(batch_path).await
    }

    /// Append uploaded records and, whenever at least one full batch can be
    /// formed, carve all possible batches and schedule one training request
    /// per batch file. The caller gets its response as soon as carving
    /// completes; training runs in the background.
    pub async fn upload(
        &self,
        records: Vec<ExampleRecord>,
    ) -> example_store::Result<UploadResponse> {
        let count = records.len();
        let store = self.store.clone();
        let batch_size = self.batch_size;

        let (total_after, appended, carved) =
            tokio::task::spawn_blocking(move || -> example_store::Result<_> {
                let (total, appended) = store.append(&records)?;
                if total >= batch_size {
                    let carved = store.carve(batch_size)?;
                    Ok((total, appended, Some(carved)))
                } else {
                    Ok((total, appended, None))
                }
            })
            .await
            .map_err(std::io::Error::other)??;

        let mut train_files = Vec::new();
        let mut pending_examples = total_after;
        if let Some(carved) = carved {
            pending_examples = carved.remainder;
            for batch_path in carved.batch_files {
                train_files.push(batch_path.to_string_lossy().into_owned());
                self.spawn_train(batch_path);
            }
        }

        Ok(UploadResponse {
            status: "ok".to_string(),
            count,
            appended,
            pending_examples,
            training_triggered: !train_files.is_empty(),
            training_requests: train_files.len(),
            train_files,
        })
    }

    /// Schedule a fire-and-forget training job for one batch file.
    ///
    /// Admission is bounded: when the inflight cap is reached the batch is
    /// refused (and logged) instead of queueing unbounded work. The batch
    /// file stays on disk; the operator can re-trigger it.
    fn spawn_train(&self, batch_path: PathBuf) {
        let permit = match self.inflight.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                error!(
                    "refusing training admission for {}: inflight cap reached",
                    batch_path.display()
                );
                return;
            }
        };

        let handle = self.handle.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle.train(&batch_path).await {
                warn!("training failed for {}: {e}", batch_path.display());
            }
        });
    }
}
