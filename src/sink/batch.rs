// =============================================================================
// BatchSink — buffering decorator over any other sink
// =============================================================================
//
// Writes land in a FIFO buffer; a flush delivers the whole buffer to the
// wrapped sink in enqueue order, with `batchedBy`/`batchSize` stamped on each
// item. Flush triggers: buffer reaches `batch_size`, the oldest item ages past
// `flush_timeout` (background task), or close. Flushes are serialized per
// instance, so items never interleave or reorder. Close performs a final
// flush, so a clean shutdown loses nothing.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{RouteContext, Sink, SinkCounters, SinkKind, SinkStatus};
use crate::error::FlowError;
use crate::model::{meta, MarketMessage};

struct Buffered {
    msg: MarketMessage,
    ctx: RouteContext,
}

struct BatchBuffer {
    items: VecDeque<Buffered>,
    /// Enqueue time of the oldest buffered item.
    oldest: Option<Instant>,
}

pub struct BatchSink {
    id: String,
    inner: Arc<dyn Sink>,
    batch_size: usize,
    flush_timeout: Duration,
    buffer: Mutex<BatchBuffer>,
    /// Serializes flushes for this instance.
    flush_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
    counters: SinkCounters,
}

impl BatchSink {
    /// Wrap `inner` and start the timeout flusher.
    pub fn wrap(
        id: impl Into<String>,
        inner: Arc<dyn Sink>,
        batch_size: usize,
        flush_timeout: Duration,
    ) -> Arc<Self> {
        let sink = Arc::new(Self {
            id: id.into(),
            inner,
            batch_size: batch_size.max(1),
            flush_timeout,
            buffer: Mutex::new(BatchBuffer {
                items: VecDeque::new(),
                oldest: None,
            }),
            flush_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            flusher: Mutex::new(None),
            counters: SinkCounters::new(),
        });

        let task_sink = Arc::clone(&sink);
        let handle = tokio::spawn(async move {
            // Tick faster than the timeout so a lone message never waits much
            // past its deadline.
            let period = (task_sink.flush_timeout / 4).max(Duration::from_millis(10));
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if task_sink.closed.load(Ordering::SeqCst) {
                    break;
                }
                let due = {
                    let buffer = task_sink.buffer.lock();
                    matches!(buffer.oldest, Some(oldest) if oldest.elapsed() >= task_sink.flush_timeout)
                };
                if due {
                    task_sink.flush().await;
                }
            }
        });
        *sink.flusher.lock() = Some(handle);

        sink
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().items.len()
    }

    /// Drain the buffer and deliver to the wrapped sink. Serialized per
    /// instance; concurrent callers queue up behind the gate.
    pub async fn flush(&self) {
        let _gate = self.flush_gate.lock().await;

        let drained: Vec<Buffered> = {
            let mut buffer = self.buffer.lock();
            buffer.oldest = None;
            buffer.items.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        let batch_size = drained.len();
        debug!(sink = %self.id, batch_size, "flushing batch");

        for Buffered { mut msg, ctx } in drained {
            msg.set_meta(meta::BATCHED_BY, json!(self.id));
            msg.set_meta(meta::BATCH_SIZE, json!(batch_size));
            if let Err(e) = self.inner.write(msg, &ctx).await {
                warn!(sink = %self.id, error = %e, "batched write failed");
            }
        }
    }
}

#[async_trait]
impl Sink for BatchSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Batch
    }

    async fn write(&self, msg: MarketMessage, ctx: &RouteContext) -> Result<(), FlowError> {
        let started = Instant::now();

        if self.closed.load(Ordering::SeqCst) {
            self.counters.record(started, false);
            return Err(FlowError::sink(&self.id, "batch sink closed"));
        }

        let full = {
            let mut buffer = self.buffer.lock();
            if buffer.items.is_empty() {
                buffer.oldest = Some(Instant::now());
            }
            buffer.items.push_back(Buffered { msg, ctx: ctx.clone() });
            buffer.items.len() >= self.batch_size
        };

        if full {
            self.flush().await;
        }

        self.counters.record(started, true);
        Ok(())
    }

    fn status(&self) -> SinkStatus {
        self.counters.snapshot(&self.id, SinkKind::Batch)
    }

    /// Final flush then close the wrapped sink. Idempotent.
    async fn close(&self) -> Result<(), FlowError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.flusher.lock().take() {
            handle.abort();
        }
        self.flush().await;
        self.inner.close().await
    }

    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.inner.set_enabled(enabled);
    }
}
