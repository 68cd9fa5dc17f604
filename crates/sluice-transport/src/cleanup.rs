//! Exactly-once deferred release of a connection pair.
//!
//! The pair sits in a slot until one of three things happens:
//! - a bridge terminal signal fires ([`DeferredRelease::attach`])
//! - a caller releases it inline ([`DeferredRelease::run`])
//! - ownership moves elsewhere ([`DeferredRelease::disarm`])
//!
//! Whichever comes first takes the pair; everything after is a no-op.

use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::TransportError;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::bridge::{BridgeSignal, ResponseWriter};
use crate::connection::ConnectionPair;

type ReleasedCallback = Box<dyn Fn() + Send + Sync>;

pub(crate) struct DeferredRelease {
    pair: Mutex<Option<Arc<ConnectionPair>>>,
    on_released: Option<ReleasedCallback>,
}

impl DeferredRelease {
    pub(crate) fn new(pair: Arc<ConnectionPair>) -> Arc<Self> {
        Arc::new(Self {
            pair: Mutex::new(Some(pair)),
            on_released: None,
        })
    }

    /// Like [`new`](Self::new), with a callback run after the release finishes.
    pub(crate) fn with_callback<F>(pair: Arc<ConnectionPair>, on_released: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            pair: Mutex::new(Some(pair)),
            on_released: Some(Box::new(on_released)),
        })
    }

    /// Take the pair without releasing it.
    pub(crate) fn disarm(&self) -> Option<Arc<ConnectionPair>> {
        self.pair.lock().take()
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.pair.lock().is_some()
    }

    /// Release inline. Returns `true` if this call performed the release.
    pub(crate) async fn run(&self) -> bool {
        let Some(pair) = self.disarm() else {
            return false;
        };
        release(&pair).await;
        self.finished();
        true
    }

    /// Release on a background task. Returns `true` if this call claimed the pair.
    pub(crate) fn fire_detached(self: &Arc<Self>) -> bool {
        let Some(pair) = self.disarm() else {
            return false;
        };
        match Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                drop(handle.spawn(async move {
                    release(&pair).await;
                    this.finished();
                }));
            }
            Err(_) => {
                warn!("no runtime available, dropping connection pair without closing it");
                self.finished();
            }
        }
        true
    }

    /// Release when the response stream closes or errors, whichever fires first.
    pub(crate) fn attach(self: &Arc<Self>, writer: &ResponseWriter) {
        let this = self.clone();
        writer.on_signal(move |signal| {
            if this.fire_detached() {
                debug!(?signal, "response stream terminated, releasing connection");
            }
        });
    }

    fn finished(&self) {
        if let Some(callback) = &self.on_released {
            callback();
        }
    }
}

async fn release(pair: &ConnectionPair) {
    if let Err(e) = pair.release().await {
        warn!(error = %e, "connection release failed");
    }
}

/// The failure carried by a terminal signal, if any.
pub(crate) fn stream_failure(signal: &BridgeSignal) -> Option<TransportError> {
    match signal {
        BridgeSignal::Errored(reason) => Some(TransportError::StreamFailure(reason.clone())),
        BridgeSignal::Closed => None,
    }
}

/// Log and count a stream failure. Attached to every bridge a manager hands out.
pub(crate) fn observe_stream_errors(writer: &ResponseWriter) {
    writer.on_signal(|signal| {
        if let Some(err) = stream_failure(signal) {
            warn!(code = err.code(), error = %err, "response stream failed");
            metrics::counter!(crate::metrics::STREAM_ERRORS_TOTAL).increment(1);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::response_bridge;
    use crate::connection::{ConnectionFactory, TransportOptions};
    use crate::testing::{FakeFactory, FakeScript};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fixture() -> (FakeFactory, Arc<ConnectionPair>) {
        let factory = FakeFactory::new(FakeScript::default());
        let pair = factory.create(TransportOptions::stateless()).await.unwrap();
        (factory, Arc::new(pair))
    }

    fn counting(pair: Arc<ConnectionPair>) -> (Arc<DeferredRelease>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cleanup = DeferredRelease::with_callback(pair, move || {
            let _ = c.fetch_add(1, Ordering::SeqCst);
        });
        (cleanup, count)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn closed_then_errored_releases_once() {
        let (factory, pair) = fixture().await;
        let (cleanup, count) = counting(pair);
        let (writer, stream) = response_bridge();
        cleanup.attach(&writer);

        drop(stream);
        writer.destroy("late failure");
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(factory.stats().transport_closes(), 1);
    }

    #[tokio::test]
    async fn errored_then_closed_releases_once() {
        let (factory, pair) = fixture().await;
        let (cleanup, count) = counting(pair);
        let (writer, stream) = response_bridge();
        cleanup.attach(&writer);

        writer.destroy("boom");
        drop(stream);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(factory.stats().server_closes(), 1);
    }

    #[tokio::test]
    async fn inline_run_wins_over_later_signal() {
        let (factory, pair) = fixture().await;
        let (cleanup, count) = counting(pair);
        let (writer, stream) = response_bridge();
        cleanup.attach(&writer);

        assert!(cleanup.run().await);
        assert!(!cleanup.run().await);
        drop(stream);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(factory.stats().transport_closes(), 1);
    }

    #[test]
    fn errored_signal_maps_to_stream_failure() {
        let err = stream_failure(&BridgeSignal::Errored("reset".into())).unwrap();
        assert_eq!(err.code(), "STREAM_FAILURE");
        assert_eq!(err.status_code(), 500);
        assert!(!err.is_client_error());
        assert!(err.to_string().contains("reset"));
        assert!(stream_failure(&BridgeSignal::Closed).is_none());
    }

    #[test]
    fn destroyed_stream_is_logged_as_stream_failure() {
        let (logs, _guard) = sluice_core::logging::capture_logs();
        let (writer, _stream) = response_bridge();
        observe_stream_errors(&writer);

        writer.destroy("socket reset");

        let events = logs.events();
        let failure = events
            .iter()
            .find(|e| e.message == "response stream failed")
            .unwrap();
        assert_eq!(failure.level, tracing::Level::WARN);
        assert_eq!(failure.field("code"), Some("STREAM_FAILURE"));
    }

    #[tokio::test]
    async fn disarmed_slot_never_releases() {
        let (factory, pair) = fixture().await;
        let cleanup = DeferredRelease::new(pair);
        let (writer, stream) = response_bridge();
        cleanup.attach(&writer);

        assert!(cleanup.disarm().is_some());
        assert!(!cleanup.is_armed());
        drop(stream);
        settle().await;

        assert_eq!(factory.stats().transport_closes(), 0);
    }
}
