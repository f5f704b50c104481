//! The streaming stages that turn a stream of screen captures into
//! prompt/completion training examples.
//!
//! Stages are connected by bounded tokio channels. Producers block when a
//! downstream queue is full; nothing in the pipeline drops data on
//! backpressure. Each stage worker runs until its input channel closes.

pub mod context_window;
pub mod frame_buffer;
pub mod prompts;
pub mod qa_generator;
pub mod synthesizer;

pub use context_window::ContextWindow;
pub use frame_buffer::{FrameBuffer, FrameChunk};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("model session error: {0}")]
    Session(#[from] model_session::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame timestamp out of range")]
    Timestamp,
}

pub type Result<T> = std::result::Result<T, Error>;
