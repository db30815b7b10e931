//! Progress events emitted by the indexing orchestrator.
//!
//! The sink is a one-way channel; send failures are ignored so a slow or
//! dropped consumer can never abort indexing.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexPhase {
  Scanning,
  Chunking,
  Embedding,
  Storing,
  Complete,
}

impl std::fmt::Display for IndexPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      IndexPhase::Scanning => "scanning",
      IndexPhase::Chunking => "chunking",
      IndexPhase::Embedding => "embedding",
      IndexPhase::Storing => "storing",
      IndexPhase::Complete => "complete",
    };
    f.write_str(s)
  }
}

/// One progress update.
#[derive(Debug, Clone)]
pub struct IndexProgress {
  pub phase: IndexPhase,
  pub current: usize,
  pub total: usize,
  pub message: String,
  pub eta_seconds: Option<f64>,
}

impl IndexProgress {
  pub fn percent(&self) -> u8 {
    if self.total == 0 {
      100
    } else {
      ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
    }
  }
}

pub type ProgressSender = mpsc::Sender<IndexProgress>;

/// Best-effort progress emitter around an optional channel.
pub struct ProgressReporter {
  tx: Option<ProgressSender>,
}

impl ProgressReporter {
  pub fn new(tx: Option<ProgressSender>) -> Self {
    Self { tx }
  }

  pub async fn emit(&self, phase: IndexPhase, current: usize, total: usize, message: impl Into<String>) {
    self.emit_with_eta(phase, current, total, message, None).await;
  }

  pub async fn emit_with_eta(
    &self,
    phase: IndexPhase,
    current: usize,
    total: usize,
    message: impl Into<String>,
    eta_seconds: Option<f64>,
  ) {
    if let Some(tx) = &self.tx {
      let _ = tx
        .send(IndexProgress {
          phase,
          current,
          total,
          message: message.into(),
          eta_seconds,
        })
        .await;
    }
  }
}

/// ETA from an exponential moving average of per-batch throughput.
pub struct EtaTracker {
  ema_rate: Option<f64>,
  alpha: f64,
}

impl Default for EtaTracker {
  fn default() -> Self {
    Self::new(0.3)
  }
}

impl EtaTracker {
  pub fn new(alpha: f64) -> Self {
    Self { ema_rate: None, alpha }
  }

  /// Record a completed batch of `items` taking `elapsed`.
  pub fn record_batch(&mut self, items: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    if items == 0 || secs <= f64::EPSILON {
      return;
    }
    let rate = items as f64 / secs;
    self.ema_rate = Some(match self.ema_rate {
      Some(ema) => self.alpha * rate + (1.0 - self.alpha) * ema,
      None => rate,
    });
  }

  /// Estimated seconds to process `remaining` items, if a rate is known.
  pub fn eta_seconds(&self, remaining: usize) -> Option<f64> {
    let rate = self.ema_rate?;
    if rate <= f64::EPSILON {
      return None;
    }
    Some(remaining as f64 / rate)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_percent() {
    let progress = IndexProgress {
      phase: IndexPhase::Embedding,
      current: 25,
      total: 100,
      message: String::new(),
      eta_seconds: None,
    };
    assert_eq!(progress.percent(), 25);

    let done = IndexProgress {
      phase: IndexPhase::Complete,
      current: 0,
      total: 0,
      message: String::new(),
      eta_seconds: None,
    };
    assert_eq!(done.percent(), 100);
  }

  #[test]
  fn test_eta_smooths_toward_recent_rate() {
    let mut tracker = EtaTracker::new(0.5);
    assert_eq!(tracker.eta_seconds(100), None);

    // 10 items/sec
    tracker.record_batch(100, Duration::from_secs(10));
    assert_eq!(tracker.eta_seconds(100), Some(10.0));

    // A faster batch pulls the estimate down, but not all the way
    tracker.record_batch(100, Duration::from_secs(5));
    let eta = tracker.eta_seconds(100).unwrap();
    assert!(eta < 10.0 && eta > 5.0, "eta: {}", eta);
  }

  #[test]
  fn test_eta_ignores_degenerate_batches() {
    let mut tracker = EtaTracker::default();
    tracker.record_batch(0, Duration::from_secs(1));
    assert_eq!(tracker.eta_seconds(10), None);
  }

  #[tokio::test]
  async fn test_reporter_survives_dropped_receiver() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let reporter = ProgressReporter::new(Some(tx));
    // Must not error or panic
    reporter.emit(IndexPhase::Scanning, 0, 10, "scanning").await;
  }

  #[tokio::test]
  async fn test_reporter_none_sink() {
    let reporter = ProgressReporter::new(None);
    reporter.emit(IndexPhase::Complete, 1, 1, "done").await;
  }
}
