use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::debug;

/// A fixed-size run of consecutive captured frames, processed as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameChunk {
    /// Monotonic index of the first frame in this chunk.
    pub first_index: u64,
    pub frames: Vec<PathBuf>,
}

/// Accumulates capture paths and cuts fixed-size [FrameChunk]s.
///
/// Frames are the raw signal; losing one here would invalidate the entire
/// downstream record, so when the synthesizer queue is full `submit` waits
/// for room instead of dropping.
pub struct FrameBuffer {
    chunk_size: usize,
    buffer: Vec<PathBuf>,
    chunks_cut: u64,
    chunk_tx: mpsc::Sender<FrameChunk>,
}

impl FrameBuffer {
    pub fn new(chunk_size: usize, chunk_tx: mpsc::Sender<FrameChunk>) -> Self {
        assert!(chunk_size > 0);
        Self {
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            chunks_cut: 0,
            chunk_tx,
        }
    }

    /// Submit one captured frame path.
    pub async fn submit(
        &mut self,
        path: PathBuf,
    ) -> Result<(), mpsc::error::SendError<FrameChunk>> {
        self.buffer.push(path);
        if self.buffer.len() >= self.chunk_size {
            let frames: Vec<PathBuf> = self.buffer.drain(..self.chunk_size).collect();
            let chunk = FrameChunk {
                first_index: self.chunks_cut * self.chunk_size as u64,
                frames,
            };
            self.chunks_cut += 1;
            debug!(
                "cut frame chunk starting at {} ({} frames buffered)",
                chunk.first_index,
                self.buffer.len()
            );
            self.chunk_tx.send(chunk).await?;
        }
        Ok(())
    }

    /// Frames currently buffered, waiting for a full chunk.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
