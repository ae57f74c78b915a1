//! Progress reporting.
//!
//! Reporters are purely observational. `ChannelReporter` forwards events to
//! a bounded channel with non-blocking sends so a slow consumer never stalls
//! a calculation; overflow is counted and dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::cache::{CacheEvent, StageId};

/// Receives progress notifications from a run.
///
/// Every method has an empty default.
pub trait ProgressReporter: Send + Sync {
    /// Human-readable description of the current step.
    fn describe(&self, _text: &str) {}

    /// Completion fraction in `[0, 1]`.
    fn progress(&self, _fraction: f32) {}

    /// A stage artifact was just computed.
    fn artifact_ready(&self, _stage: StageId) {}

    /// A named comparison metric.
    fn metric(&self, _name: &str, _value: f64) {}

    /// A cache transition.
    fn cache_event(&self, _event: CacheEvent) {}
}

/// Reporter that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {}

/// One forwarded notification.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Describe(String),
    Progress(f32),
    ArtifactReady(StageId),
    Metric { name: String, value: f64 },
    Cache(CacheEvent),
}

/// Reporter that forwards events over a bounded channel.
#[derive(Debug)]
pub struct ChannelReporter {
    tx: Sender<ProgressEvent>,
    rx: Receiver<ProgressEvent>,
    dropped: AtomicU64,
}

impl ChannelReporter {
    /// Creates a reporter buffering up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// A receiver for the forwarded events.
    #[must_use]
    pub fn receiver(&self) -> Receiver<ProgressEvent> {
        self.rx.clone()
    }

    /// Drains every buffered event.
    #[must_use]
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.rx.try_iter().collect()
    }

    /// Events lost to a full buffer.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, event: ProgressEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl ProgressReporter for ChannelReporter {
    fn describe(&self, text: &str) {
        self.send(ProgressEvent::Describe(text.to_string()));
    }

    fn progress(&self, fraction: f32) {
        self.send(ProgressEvent::Progress(fraction.clamp(0.0, 1.0)));
    }

    fn artifact_ready(&self, stage: StageId) {
        self.send(ProgressEvent::ArtifactReady(stage));
    }

    fn metric(&self, name: &str, value: f64) {
        self.send(ProgressEvent::Metric {
            name: name.to_string(),
            value,
        });
    }

    fn cache_event(&self, event: CacheEvent) {
        self.send(ProgressEvent::Cache(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_reporter_forwards_in_order() {
        let reporter = ChannelReporter::new(8);
        reporter.describe("computing potential");
        reporter.progress(1.5);
        reporter.artifact_ready(StageId::Potential);

        assert_eq!(
            reporter.drain(),
            vec![
                ProgressEvent::Describe("computing potential".to_string()),
                ProgressEvent::Progress(1.0),
                ProgressEvent::ArtifactReady(StageId::Potential),
            ]
        );
    }

    #[test]
    fn test_overflow_is_counted_not_blocking() {
        let reporter = ChannelReporter::new(2);
        for i in 0..5 {
            reporter.metric("r_factor", f64::from(i));
        }
        assert_eq!(reporter.dropped(), 3);
        assert_eq!(reporter.drain().len(), 2);
    }

    #[test]
    fn test_null_reporter_accepts_everything() {
        let reporter = NullReporter;
        reporter.describe("x");
        reporter.progress(0.5);
        reporter.metric("m", 1.0);
    }
}
