//! Capture-source interface: watches the capture directory and feeds newly
//! written frames to the frame buffer.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use relearn_pipeline::FrameBuffer;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn is_frame(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("png")
            || ext.eq_ignore_ascii_case("jpg")
            || ext.eq_ignore_ascii_case("jpeg")
    )
}

/// Watch `capture_dir` for newly created images and submit each to the frame
/// buffer, in path order within one event.
///
/// The notify callback blocks on a bounded channel when the pipeline is
/// saturated, so capture notifications back up instead of being dropped.
pub async fn run_frame_watch(
    capture_dir: PathBuf,
    mut frame_buffer: FrameBuffer,
) -> notify::Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<Vec<PathBuf>>(256);

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_)) {
                    return;
                }
                let mut paths: Vec<PathBuf> =
                    event.paths.into_iter().filter(|p| is_frame(p)).collect();
                if paths.is_empty() {
                    return;
                }
                paths.sort();
                if event_tx.blocking_send(paths).is_err() {
                    // Receiver gone; the pipeline is shutting down.
                }
            }
            Err(e) => warn!("capture watch error: {e}"),
        }
    })?;
    watcher.watch(&capture_dir, RecursiveMode::NonRecursive)?;
    info!("watching capture directory {}", capture_dir.display());

    while let Some(paths) = event_rx.recv().await {
        for path in paths {
            if frame_buffer.submit(path).await.is_err() {
                info!("frame chunk queue closed, stopping capture watch");
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submits_new_frames_as_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (chunk_tx, mut chunk_rx) = mpsc::channel(16);
        let frame_buffer = FrameBuffer::new(2, chunk_tx);

        let watch = tokio::spawn(run_frame_watch(dir.path().to_path_buf(), frame_buffer));

        // Give the watcher a moment to register before writing frames.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        for i in 0..2 {
            std::fs::write(dir.path().join(format!("screenshot_{i:04}.png")), b"png").unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        // A non-frame file is ignored.
        std::fs::write(dir.path().join("notes.txt"), b"not a frame").unwrap();

        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), chunk_rx.recv())
            .await
            .expect("no chunk arrived")
            .unwrap();
        assert_eq!(chunk.first_index, 0);
        assert_eq!(chunk.frames.len(), 2);
        assert!(chunk.frames.iter().all(|f| is_frame(f)));

        watch.abort();
    }
}
