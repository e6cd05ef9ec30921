//! Downstream pipeline contract
//!
//! Workers push read results to a [`PipelineSink`] fire-and-forget: the
//! engine never waits for downstream acknowledgement and never retries on
//! pipeline-side failure. What happens after the sink (caching, storage,
//! export) is a collaborator's concern.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::types::TimestampedValue;

/// Receiving contract for collected values.
#[async_trait]
pub trait PipelineSink: Send + Sync {
    /// Push a batch of values downstream. Must not block the poll loop
    /// beyond a bounded hand-off.
    async fn send(&self, values: Vec<TimestampedValue>);
}

/// Sink backed by a bounded channel. On backpressure the batch is dropped
/// and counted rather than stalling the polling path.
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<TimestampedValue>>,
    dropped_batches: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving end for the downstream consumer.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<TimestampedValue>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx,
                dropped_batches: AtomicU64::new(0),
            }),
            rx,
        )
    }

    /// Batches dropped because the downstream consumer fell behind.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PipelineSink for ChannelSink {
    async fn send(&self, values: Vec<TimestampedValue>) {
        if values.is_empty() {
            return;
        }
        if let Err(e) = self.tx.try_send(values) {
            self.dropped_batches.fetch_add(1, Ordering::Relaxed);
            debug!("pipeline backpressure, batch dropped: {}", e);
        }
    }
}

/// Sink that discards everything. Useful when running without a pipeline.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl PipelineSink for NullSink {
    async fn send(&self, _values: Vec<TimestampedValue>) {}
}

/// Sink that accumulates batches in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingSink {
    values: Mutex<Vec<TimestampedValue>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn values(&self) -> Vec<TimestampedValue> {
        self.values.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

#[async_trait]
impl PipelineSink for CollectingSink {
    async fn send(&self, values: Vec<TimestampedValue>) {
        self.values.lock().extend(values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DataValue;

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.send(vec![TimestampedValue::new("p1", DataValue::Int(1))]).await;

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].point_id, "p1");
        assert_eq!(sink.dropped_batches(), 0);
    }

    #[tokio::test]
    async fn test_channel_sink_drops_on_backpressure() {
        let (sink, _rx) = ChannelSink::new(1);
        sink.send(vec![TimestampedValue::new("p1", DataValue::Int(1))]).await;
        sink.send(vec![TimestampedValue::new("p2", DataValue::Int(2))]).await;
        assert_eq!(sink.dropped_batches(), 1);
    }

    #[tokio::test]
    async fn test_collecting_sink_accumulates() {
        let sink = CollectingSink::new();
        sink.send(vec![
            TimestampedValue::new("p1", DataValue::Int(1)),
            TimestampedValue::new("p2", DataValue::Int(2)),
        ])
        .await;
        assert_eq!(sink.len(), 2);
    }
}
