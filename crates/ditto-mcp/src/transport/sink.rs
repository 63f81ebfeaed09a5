use std::{
    convert::Infallible,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// The outbound half of one streaming response.
///
/// None of the operations fail: a sink whose peer went away simply refuses
/// writes, and closing twice is harmless.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Mark the response as started. Idempotent; writes before this are refused.
    fn open(&self);

    /// Queue one event. `false` means the sink is gone.
    async fn write(&self, event: Event) -> bool;

    /// End the response body.
    fn close(&self);

    /// Resolves once the peer disconnected or [`EventSink::close`] was called.
    async fn closed(&self);
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// [`EventSink`] over a bounded channel whose receiving end feeds an
/// [`axum::response::sse::Sse`] body.
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
    opened: AtomicBool,
    shutdown: CancellationToken,
}

impl ChannelSink {
    /// A sink plus the event stream it feeds. The stream ends when the sink is
    /// closed or dropped.
    pub fn channel(buffer: usize) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(buffer);
        let shutdown = CancellationToken::new();
        let stream = ReceiverStream::new(rx)
            .take_until(shutdown.clone().cancelled_owned())
            .map(Ok::<_, Infallible>);
        let sink = Self {
            tx,
            opened: AtomicBool::new(false),
            shutdown,
        };
        (sink, Box::pin(stream))
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    fn open(&self) {
        self.opened.store(true, Ordering::Release);
    }

    async fn write(&self, event: Event) -> bool {
        if !self.opened.load(Ordering::Acquire) || self.is_closed() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(event) => sent.is_ok(),
            _ = self.shutdown.cancelled() => false,
        }
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
