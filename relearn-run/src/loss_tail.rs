//! Telemetry tail: follows the trainer's log file and publishes the most
//! recent training loss through a lock-free cell.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

/// Single-writer many-reader cell for the latest observed loss.
///
/// Reads and writes are single-word atomics on the bit pattern of the f64;
/// the NaN pattern marks "no loss observed yet". No locking on either side.
#[derive(Debug)]
pub struct LossCell {
    bits: AtomicU64,
}

impl Default for LossCell {
    fn default() -> Self {
        Self::new()
    }
}

impl LossCell {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(f64::NAN.to_bits()),
        }
    }

    pub fn store(&self, loss: f64) {
        self.bits.store(loss.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> Option<f64> {
        let value = f64::from_bits(self.bits.load(Ordering::Relaxed));
        if value.is_nan() { None } else { Some(value) }
    }
}

static LOSS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{'loss':\s*([\d.]+)").unwrap());

/// Extract the loss scalar from one trainer log line.
fn extract_loss(line: &str) -> Option<f64> {
    let captures = LOSS_RE.captures(line)?;
    captures.get(1)?.as_str().parse().ok()
}

/// Follow the trainer log, starting from the last `backlog_lines` lines, and
/// store every matched loss into `cell`. Equivalent to `tail -f -n 100`.
///
/// Runs until the surrounding task is dropped. If the log does not exist at
/// startup, loss monitoring is disabled (the trainer may live on another
/// host).
pub async fn run_loss_tail(
    log_path: PathBuf,
    cell: Arc<LossCell>,
    poll_interval: Duration,
    backlog_lines: usize,
) {
    let initial = match tokio::fs::read_to_string(&log_path).await {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                "telemetry log {} is not readable ({e}); loss monitoring disabled",
                log_path.display()
            );
            return;
        }
    };

    // Replay the recent backlog so a restart re-observes the latest loss.
    let lines: Vec<&str> = initial.lines().collect();
    let start = lines.len().saturating_sub(backlog_lines);
    for line in &lines[start..] {
        if let Some(loss) = extract_loss(line) {
            cell.store(loss);
        }
    }
    let mut offset = initial.len() as u64;
    drop(initial);

    info!("tailing telemetry log {}", log_path.display());

    // Carries a trailing partial line between polls.
    let mut carry = String::new();
    loop {
        tokio::time::sleep(poll_interval).await;

        let len = match tokio::fs::metadata(&log_path).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                debug!("telemetry log unavailable: {e}");
                continue;
            }
        };
        if len < offset {
            // Truncated or rotated; start over from the beginning.
            warn!("telemetry log shrank, re-reading from the start");
            offset = 0;
            carry.clear();
        }
        if len == offset {
            continue;
        }

        let mut file = match tokio::fs::File::open(&log_path).await {
            Ok(file) => file,
            Err(e) => {
                debug!("telemetry log unavailable: {e}");
                continue;
            }
        };
        if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            continue;
        }
        let mut chunk = String::new();
        match file.read_to_string(&mut chunk).await {
            Ok(read) => offset += read as u64,
            Err(e) => {
                debug!("error reading telemetry log: {e}");
                continue;
            }
        }

        carry.push_str(&chunk);
        while let Some(newline) = carry.find('\n') {
            let line: String = carry.drain(..=newline).collect();
            if let Some(loss) = extract_loss(line.trim_end()) {
                debug!("updated loss: {loss}");
                cell.store(loss);
            }
        }
    }
}
