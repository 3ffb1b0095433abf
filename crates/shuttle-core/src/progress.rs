// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Progress aggregation
//
// The transport engine reports every acknowledged chunk on an append-only
// channel; the aggregator folds those into cumulative snapshots. Snapshots
// are published through a watch channel so late subscribers start from the
// current totals instead of replaying history.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;

/// Time constant of the speed average
const SPEED_TIME_CONSTANT: Duration = Duration::from_secs(3);

/// Minimum spacing between speed samples
const SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Point-in-time view of a transfer's progress
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub percentage: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Smoothed throughput
    pub speed_bytes_per_sec: f64,
    /// `None` until there is a usable speed estimate
    pub eta_seconds: Option<f64>,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.bytes_transferred >= self.total_bytes
    }

    /// Speed in MB/s, the unit the transfer logs use
    pub fn speed_mbps(&self) -> f64 {
        self.speed_bytes_per_sec / (1024.0 * 1024.0)
    }
}

/// Events the transport engine emits for the aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    ChunkAcknowledged {
        file_index: u32,
        chunk_index: u64,
        bytes: u64,
    },
    FileVerified {
        file_index: u32,
    },
}

pub type TransferEventSender = mpsc::UnboundedSender<TransferEvent>;
pub type TransferEventReceiver = mpsc::UnboundedReceiver<TransferEvent>;

pub fn transfer_event_channel() -> (TransferEventSender, TransferEventReceiver) {
    mpsc::unbounded_channel()
}

/// Folds acknowledged bytes into snapshots with an exponentially weighted speed
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    total_bytes: u64,
    transferred: u64,
    speed: f64,
    has_sample: bool,
    last_sample_at: Instant,
    bytes_since_sample: u64,
}

impl ProgressAggregator {
    pub fn new(total_bytes: u64) -> Self {
        Self::starting_at(total_bytes, Instant::now())
    }

    pub fn starting_at(total_bytes: u64, now: Instant) -> Self {
        Self {
            total_bytes,
            transferred: 0,
            speed: 0.0,
            has_sample: false,
            last_sample_at: now,
            bytes_since_sample: 0,
        }
    }

    /// Count `bytes` acknowledged at `now` and return the new snapshot
    pub fn record(&mut self, bytes: u64, now: Instant) -> ProgressSnapshot {
        let remaining = self.total_bytes - self.transferred;
        let accepted = bytes.min(remaining);
        self.transferred += accepted;
        self.bytes_since_sample += accepted;

        let elapsed = now.saturating_duration_since(self.last_sample_at);
        if elapsed >= SAMPLE_INTERVAL {
            let secs = elapsed.as_secs_f64();
            let rate = self.bytes_since_sample as f64 / secs;
            if self.has_sample {
                let alpha = 1.0 - (-secs / SPEED_TIME_CONSTANT.as_secs_f64()).exp();
                self.speed += alpha * (rate - self.speed);
            } else {
                self.speed = rate;
                self.has_sample = true;
            }
            self.last_sample_at = now;
            self.bytes_since_sample = 0;
        }

        self.snapshot()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let percentage = if self.total_bytes == 0 {
            100.0
        } else {
            (self.transferred as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        };

        let remaining = self.total_bytes - self.transferred;
        let eta_seconds = if remaining == 0 {
            Some(0.0)
        } else if self.has_sample && self.speed > 0.0 {
            Some(remaining as f64 / self.speed)
        } else {
            None
        };

        ProgressSnapshot {
            percentage,
            bytes_transferred: self.transferred,
            total_bytes: self.total_bytes,
            speed_bytes_per_sec: self.speed,
            eta_seconds,
        }
    }
}

/// Drain transfer events into `publish` until the engine drops its sender
pub async fn run_aggregator(
    mut aggregator: ProgressAggregator,
    mut events: TransferEventReceiver,
    publish: impl Fn(ProgressSnapshot),
) {
    publish(aggregator.snapshot());
    while let Some(event) = events.recv().await {
        if let TransferEvent::ChunkAcknowledged { bytes, .. } = event {
            publish(aggregator.record(bytes, Instant::now()));
        }
    }
}

/// Restartable stream of snapshots: yields the current value first, then every change
pub struct ProgressStream {
    inner: WatchStream<ProgressSnapshot>,
}

impl ProgressStream {
    pub fn new(rx: watch::Receiver<ProgressSnapshot>) -> Self {
        Self {
            inner: WatchStream::new(rx),
        }
    }
}

impl Stream for ProgressStream {
    type Item = ProgressSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
