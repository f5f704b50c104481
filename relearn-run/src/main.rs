use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{Result, WrapErr};
use model_session::ModelClient;
use relearn_pipeline::FrameBuffer;
use relearn_pipeline::qa_generator::{QaGeneratorConfig, run_qa_generator};
use relearn_pipeline::synthesizer::{SynthesizerConfig, run_synthesizer};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use relearn_run::dispatcher::TrainingDispatcher;
use relearn_run::loss_tail::{self, LossCell};
use relearn_run::{frame_watch, server};

/// How long draining workers get to finish their in-flight item on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(version, about = "continual-learning pipeline server")]
struct RelearnRunCliArgs {
    /// Address for the ingress HTTP API.
    #[arg(long, env = "RELEARN_LISTEN_ADDR", default_value = "0.0.0.0:8002")]
    listen_addr: std::net::SocketAddr,

    /// Path of the append-only example store.
    #[arg(long, env = "RELEARN_STORE_PATH", default_value = "data/recent_examples.jsonl")]
    store_path: PathBuf,

    /// Records per training batch (B).
    #[arg(long, env = "RELEARN_BATCH_SIZE", default_value_t = 512)]
    batch_size: usize,

    /// Default samples per batch for /get_data.
    #[arg(long, env = "RELEARN_SAMPLES_PER_BATCH", default_value_t = 10)]
    samples_per_batch: usize,

    /// Base URL of the trainer service.
    #[arg(long, env = "RELEARN_TRAINER_URL", default_value = "http://127.0.0.1:8001")]
    trainer_url: String,

    /// Base URL of the serving runtime's OpenAI-compatible API.
    #[arg(long, env = "RELEARN_RUNTIME_URL", default_value = "http://127.0.0.1:8000/v1")]
    runtime_url: String,

    /// Model id passed to the serving runtime for /infer.
    #[arg(long, env = "RELEARN_SERVING_MODEL", default_value = "Qwen/Qwen3-8B")]
    serving_model: String,

    /// Trainer log followed for loss telemetry.
    #[arg(long, env = "RELEARN_TELEMETRY_LOG", default_value = "workflow.log")]
    telemetry_log: PathBuf,

    #[arg(long, env = "RELEARN_TAIL_POLL_MILLIS", default_value_t = 500)]
    tail_poll_millis: u64,

    /// Maximum concurrently admitted training jobs.
    #[arg(long, env = "RELEARN_MAX_INFLIGHT_TRAININGS", default_value_t = 4)]
    max_inflight_trainings: usize,

    #[arg(long, env = "RELEARN_TRAIN_TIMEOUT_SECS", default_value_t = 600)]
    train_timeout_secs: u64,

    /// Capture directory to watch. When absent the server runs ingress-only
    /// (no capture pipeline).
    #[arg(long, env = "RELEARN_CAPTURE_DIR")]
    capture_dir: Option<PathBuf>,

    /// Identity recorded on every synthesized context.
    #[arg(long, env = "RELEARN_AUTHOR", default_value = "user")]
    author: String,

    /// Frames per chunk (F).
    #[arg(long, env = "RELEARN_FRAME_CHUNK_SIZE", default_value_t = 5)]
    frame_chunk_size: usize,

    /// Contexts in the sliding window (W).
    #[arg(long, env = "RELEARN_CONTEXT_WINDOW_SIZE", default_value_t = 4)]
    context_window_size: usize,

    /// Completed assistant turns kept in the vision session (T).
    #[arg(long, env = "RELEARN_MAX_CONVERSATION_TURNS", default_value_t = 6)]
    max_conversation_turns: usize,

    /// Depth of the bounded inter-stage queues.
    #[arg(long, env = "RELEARN_QUEUE_DEPTH", default_value_t = 256)]
    queue_depth: usize,

    /// Vision model for context synthesis.
    #[arg(long, env = "RELEARN_VISION_MODEL", default_value = "gpt-5-chat-latest")]
    vision_model: String,

    /// Text models for the Q&A fan-out, comma separated.
    #[arg(
        long,
        env = "RELEARN_QA_MODELS",
        value_delimiter = ',',
        default_value = "openai/gpt-oss-120b,moonshotai/kimi-k2-instruct-0905,meta-llama/llama-4-maverick-17b-128e-instruct,qwen/qwen3-32b"
    )]
    qa_models: Vec<String>,

    #[arg(long, env = "RELEARN_MAX_COMPLETION_TOKENS", default_value_t = 8192)]
    max_completion_tokens: u32,

    /// Q&A fan-out rounds accumulated before records are appended.
    #[arg(long, env = "RELEARN_ROUNDS_PER_DISPATCH", default_value_t = 1)]
    rounds_per_dispatch: usize,

    /// Base URL of the OpenAI-compatible API used by both pipeline stages.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    api_base: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "RELEARN_COMPLETION_TIMEOUT_SECS", default_value_t = 300)]
    completion_timeout_secs: u64,
}

fn init_tracing() {
    use tracing_subscriber::{
        EnvFilter,
        fmt::{self, format, time},
        prelude::*,
    };

    let evt_fmt = format().with_timer(time::Uptime::default()).compact();
    let fmt_layer = fmt::layer().event_format(evt_fmt);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let args = RelearnRunCliArgs::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("relearn-runtime")
        .build()?;

    runtime.block_on(run(args))
}

async fn run(args: RelearnRunCliArgs) -> Result<()> {
    // Fail startup, not the first upload, when the store is unwritable.
    let store = Arc::new(example_store::ExampleStore::new(&args.store_path));
    store
        .append(&[])
        .wrap_err_with(|| format!("store path {} is not writable", args.store_path.display()))?;
    info!("example store at {}", args.store_path.display());

    let trainer = ModelClient::new(&args.trainer_url, None)
        .with_timeout(Duration::from_secs(args.train_timeout_secs));
    let dispatcher = Arc::new(TrainingDispatcher::new(
        store,
        trainer,
        args.batch_size,
        args.max_inflight_trainings,
    ));

    let loss = Arc::new(LossCell::new());
    let tail_task = tokio::spawn(loss_tail::run_loss_tail(
        args.telemetry_log.clone(),
        loss.clone(),
        Duration::from_millis(args.tail_poll_millis),
        100,
    ));

    // The capture pipeline is optional; without a capture directory the
    // server only accepts external uploads.
    let mut stage_tasks = Vec::new();
    let mut watch_task = None;
    if let Some(capture_dir) = args.capture_dir.clone() {
        let api_key = args.api_key.clone().ok_or_else(|| {
            eyre::eyre!("OPENAI_API_KEY must be set to run the capture pipeline")
        })?;
        let llm = ModelClient::new(&args.api_base, Some(api_key))
            .with_timeout(Duration::from_secs(args.completion_timeout_secs));

        let (chunk_tx, chunk_rx) = mpsc::channel(args.queue_depth);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(args.queue_depth);

        let synth_config = SynthesizerConfig {
            vision_model: args.vision_model.clone(),
            author: args.author.clone(),
            max_turns: args.max_conversation_turns,
            window_size: args.context_window_size,
        };
        stage_tasks.push(tokio::spawn(run_synthesizer(
            synth_config,
            llm.clone(),
            chunk_rx,
            snapshot_tx,
        )));

        let qa_config = QaGeneratorConfig {
            models: args.qa_models.clone(),
            max_completion_tokens: args.max_completion_tokens,
            rounds_per_dispatch: args.rounds_per_dispatch,
        };
        let sink_dispatcher = dispatcher.clone();
        stage_tasks.push(tokio::spawn(run_qa_generator(
            qa_config,
            llm,
            snapshot_rx,
            move |records| {
                let dispatcher = sink_dispatcher.clone();
                async move {
                    match dispatcher.upload(records).await {
                        Ok(response) => info!(
                            "appended {} generated records ({} pending, {} training requests)",
                            response.appended,
                            response.pending_examples,
                            response.training_requests
                        ),
                        Err(e) => error!("failed to append generated records: {e}"),
                    }
                }
            },
        )));

        let frame_buffer = FrameBuffer::new(args.frame_chunk_size, chunk_tx);
        watch_task = Some(tokio::spawn(async move {
            if let Err(e) = frame_watch::run_frame_watch(capture_dir, frame_buffer).await {
                error!("capture watch failed: {e}");
            }
        }));
    } else {
        info!("no capture directory configured, running ingress-only");
    }

    let state = server::AppState {
        dispatcher,
        loss,
        runtime: ModelClient::new(&args.runtime_url, None)
            .with_timeout(Duration::from_secs(args.completion_timeout_secs)),
        serving_model: args.serving_model.clone(),
        samples_per_batch: args.samples_per_batch,
    };
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!("ingress API at http://{}/", listener.local_addr()?);
    let serve_future = {
        use std::future::IntoFuture;
        axum::serve(listener, app).into_future()
    };

    tokio::select! {
        result = serve_future => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("got Ctrl-C, shutting down");
        }
    }

    // Stop the capture source first; downstream stages drain the items
    // already queued and exit as their input channels close.
    if let Some(watch) = watch_task {
        watch.abort();
    }
    for task in stage_tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("stage did not drain within the shutdown grace period");
        }
    }
    tail_task.abort();

    Ok(())
}
