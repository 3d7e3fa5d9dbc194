//! Progress events
//!
//! The orchestrator reports progress through the narrow [`ProgressPublisher`]
//! capability. Publishers must not block; an observer that falls behind
//! loses events rather than slowing the run down.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::models::{FileType, PeriodKey};

/// Capacity of the broadcast channel behind [`BroadcastProgress`]
pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// Stage of a run or of one file type within it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Downloading,
    Parsing,
    Classifying,
    Writing,
    Done,
    Errored,
    /// The whole run has finished and its totals are final
    Aggregated,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Downloading => "downloading",
            Stage::Parsing => "parsing",
            Stage::Classifying => "classifying",
            Stage::Writing => "writing",
            Stage::Done => "done",
            Stage::Errored => "errored",
            Stage::Aggregated => "aggregated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Errored | Stage::Aggregated)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub period_key: PeriodKey,
    /// `None` for run-level events
    pub file_type: Option<FileType>,
    pub stage: Stage,
    pub records_processed: u64,
    /// Known only for downloads with a content length
    pub total_records: Option<u64>,
    /// Share of the input consumed, `0.0..=100.0`
    pub percentage: f64,
    pub error_message: Option<String>,
}

impl ProgressEvent {
    pub fn new(period_key: PeriodKey, file_type: Option<FileType>, stage: Stage) -> Self {
        Self {
            period_key,
            file_type,
            stage,
            records_processed: 0,
            total_records: None,
            percentage: 0.0,
            error_message: None,
        }
    }

    pub fn records(mut self, processed: u64, total: Option<u64>) -> Self {
        self.records_processed = processed;
        self.total_records = total;
        self
    }

    pub fn percentage(mut self, percentage: f64) -> Self {
        self.percentage = percentage.clamp(0.0, 100.0);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Sink for progress events
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressPublisher for NoopProgress {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Writes events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProgress;

impl ProgressPublisher for LoggingProgress {
    fn publish(&self, event: ProgressEvent) {
        let file_type = event.file_type.map(|ft| ft.as_str()).unwrap_or("-");
        if event.stage.is_terminal() {
            info!(
                period = %event.period_key,
                file_type,
                stage = %event.stage,
                records = event.records_processed,
                error = event.error_message.as_deref().unwrap_or(""),
                "Progress"
            );
        } else {
            debug!(
                period = %event.period_key,
                file_type,
                stage = %event.stage,
                records = event.records_processed,
                percentage = format_args!("{:.1}", event.percentage),
                "Progress"
            );
        }
    }
}

/// Fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastProgress {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastProgress {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_CAPACITY)
    }
}

impl ProgressPublisher for BroadcastProgress {
    fn publish(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key() -> PeriodKey {
        "2024-01".parse().unwrap()
    }

    #[test]
    fn test_event_builder_clamps_percentage() {
        let event = ProgressEvent::new(key(), Some(FileType::Artists), Stage::Writing)
            .records(50, None)
            .percentage(140.0);
        assert_eq!(event.percentage, 100.0);
        assert_eq!(event.records_processed, 50);
        assert!(event.error_message.is_none());
    }

    #[test]
    fn test_event_serializes_stage_snake_case() {
        let event = ProgressEvent::new(key(), None, Stage::Aggregated).error("boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "aggregated");
        assert_eq!(json["period_key"], "2024-01");
        assert_eq!(json["error_message"], "boom");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let progress = BroadcastProgress::new(8);
        progress.publish(ProgressEvent::new(key(), None, Stage::Pending));

        let mut rx = progress.subscribe();
        assert_eq!(progress.subscriber_count(), 1);
        progress.publish(ProgressEvent::new(key(), Some(FileType::Labels), Stage::Parsing));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.stage, Stage::Parsing);
        assert_eq!(event.file_type, Some(FileType::Labels));
    }
}
