//! Push-style response writer bridged onto a pull-based byte stream.
//!
//! Connections write their response through a [`ResponseWriter`], the way
//! they would drive a callback-style server response: set a status and
//! headers, then `write` chunks and finally `end`. Every chunk is forwarded
//! into an internal pipe whose readable side, [`ResponseStream`], is handed
//! to the caller as a [`futures::Stream`] of [`Bytes`].
//!
//! Header state follows a single guarded transition: `headers_sent` flips to
//! `true` on the first `write` or `end`. Header mutations after that are
//! rejected with a warning, never a panic.
//!
//! The bridge emits two terminal signals, each at most once:
//! - [`BridgeSignal::Closed`]: the consumer read EOF or dropped the stream
//! - [`BridgeSignal::Errored`]: the writer was destroyed with a failure

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use sluice_core::TransportError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::headers::{LegacyHeaderValue, LegacyHeaders, convert_headers};

type Chunk = Result<Bytes, io::Error>;
type SignalListener = Arc<dyn Fn(&BridgeSignal) + Send + Sync>;

/// Terminal signal emitted by the bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeSignal {
    /// The readable side finished or was dropped by its consumer.
    Closed,
    /// The writer was destroyed with an error.
    Errored(String),
}

struct Head {
    status: StatusCode,
    status_message: Option<String>,
    headers: LegacyHeaders,
    headers_sent: bool,
}

struct Shared {
    head: Mutex<Head>,
    tx: Mutex<Option<mpsc::UnboundedSender<Chunk>>>,
    listeners: Mutex<Vec<SignalListener>>,
    closed: AtomicBool,
    errored: AtomicBool,
    bytes_written: AtomicU64,
}

impl Shared {
    fn emit(&self, signal: &BridgeSignal) {
        let flag = match signal {
            BridgeSignal::Closed => &self.closed,
            BridgeSignal::Errored(_) => &self.errored,
        };
        if flag.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners: Vec<SignalListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(signal);
        }
    }
}

/// Create a connected writer/stream pair.
pub fn response_bridge() -> (ResponseWriter, ResponseStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        head: Mutex::new(Head {
            status: StatusCode::OK,
            status_message: None,
            headers: LegacyHeaders::new(),
            headers_sent: false,
        }),
        tx: Mutex::new(Some(tx)),
        listeners: Mutex::new(Vec::new()),
        closed: AtomicBool::new(false),
        errored: AtomicBool::new(false),
        bytes_written: AtomicU64::new(0),
    });
    (
        ResponseWriter {
            shared: shared.clone(),
        },
        ResponseStream { rx, shared },
    )
}

/// Push-style face of the bridge. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ResponseWriter {
    shared: Arc<Shared>,
}

impl ResponseWriter {
    /// Set the status and merge `headers` into the pending head.
    ///
    /// Returns `false` (and logs a warning) once headers have been sent.
    pub fn write_head<I, V>(&self, status: StatusCode, headers: I) -> bool
    where
        I: IntoIterator<Item = (String, V)>,
        V: Into<LegacyHeaderValue>,
    {
        self.write_head_inner(status, None, headers)
    }

    /// [`write_head`](Self::write_head) with an explicit reason phrase.
    pub fn write_head_with_message<I, V>(
        &self,
        status: StatusCode,
        status_message: impl Into<String>,
        headers: I,
    ) -> bool
    where
        I: IntoIterator<Item = (String, V)>,
        V: Into<LegacyHeaderValue>,
    {
        self.write_head_inner(status, Some(status_message.into()), headers)
    }

    fn write_head_inner<I, V>(
        &self,
        status: StatusCode,
        status_message: Option<String>,
        headers: I,
    ) -> bool
    where
        I: IntoIterator<Item = (String, V)>,
        V: Into<LegacyHeaderValue>,
    {
        let mut head = self.shared.head.lock();
        if head.headers_sent {
            warn!(status = status.as_u16(), "write_head after headers were sent, ignoring");
            return false;
        }
        head.status = status;
        head.status_message = status_message;
        for (name, value) in headers {
            let _ = head
                .headers
                .insert(name.to_ascii_lowercase(), Some(value.into()));
        }
        true
    }

    /// Set (replace) a single header. Names are case-insensitive.
    pub fn set_header(&self, name: &str, value: impl Into<LegacyHeaderValue>) -> bool {
        let mut head = self.shared.head.lock();
        if head.headers_sent {
            warn!(header = name, "set_header after headers were sent, ignoring");
            return false;
        }
        let _ = head
            .headers
            .insert(name.to_ascii_lowercase(), Some(value.into()));
        true
    }

    /// Current value of a header.
    pub fn get_header(&self, name: &str) -> Option<LegacyHeaderValue> {
        self.shared
            .head
            .lock()
            .headers
            .get(&name.to_ascii_lowercase())
            .cloned()
            .flatten()
    }

    /// Snapshot of all pending headers.
    pub fn get_headers(&self) -> LegacyHeaders {
        self.shared.head.lock().headers.clone()
    }

    /// Remove a header. Returns `false` if headers were already sent.
    pub fn remove_header(&self, name: &str) -> bool {
        let mut head = self.shared.head.lock();
        if head.headers_sent {
            warn!(header = name, "remove_header after headers were sent, ignoring");
            return false;
        }
        let _ = head.headers.remove(&name.to_ascii_lowercase());
        true
    }

    /// Whether the head has been committed by a `write` or `end`.
    pub fn headers_sent(&self) -> bool {
        self.shared.head.lock().headers_sent
    }

    /// Current status code.
    pub fn status(&self) -> StatusCode {
        self.shared.head.lock().status
    }

    /// Reason phrase passed to [`write_head_with_message`](Self::write_head_with_message).
    pub fn status_message(&self) -> Option<String> {
        self.shared.head.lock().status_message.clone()
    }

    /// Status plus converted headers, as handed to the caller.
    pub fn head_snapshot(&self) -> (StatusCode, HeaderMap) {
        let head = self.shared.head.lock();
        (head.status, convert_headers(&head.headers))
    }

    /// Total body bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }

    /// Whether `end` or `destroy` has been called.
    pub fn is_finished(&self) -> bool {
        self.shared.tx.lock().is_none()
    }

    /// Not ended, and the consumer is still reading.
    pub fn is_writable(&self) -> bool {
        self.shared.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn commit_head(&self) {
        let mut head = self.shared.head.lock();
        if !head.headers_sent {
            head.headers_sent = true;
            debug!(status = head.status.as_u16(), "response head committed");
        }
    }

    fn push(&self, chunk: Bytes) -> bool {
        let tx = self.shared.tx.lock();
        let Some(tx) = tx.as_ref() else {
            debug!("write after end, dropping chunk");
            return false;
        };
        if chunk.is_empty() {
            return !tx.is_closed();
        }
        let len = chunk.len() as u64;
        if tx.send(Ok(chunk)).is_err() {
            debug!("response consumer gone, dropping chunk");
            return false;
        }
        let _ = self.shared.bytes_written.fetch_add(len, Ordering::Relaxed);
        true
    }

    /// Write a body chunk. Commits the head on first call.
    ///
    /// Returns `false` when the stream has ended or its consumer is gone.
    pub fn write(&self, chunk: impl Into<Bytes>) -> bool {
        self.commit_head();
        self.push(chunk.into())
    }

    /// Finish the response, optionally writing a final chunk.
    pub fn end(&self, chunk: Option<Bytes>) {
        self.commit_head();
        if let Some(chunk) = chunk {
            let _ = self.push(chunk);
        }
        let _ = self.shared.tx.lock().take();
    }

    /// Abort the response: the stream yields an error and `Errored` fires.
    pub fn destroy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(tx) = self.shared.tx.lock().take() {
            let _ = tx.send(Err(io::Error::other(TransportError::StreamFailure(
                reason.clone(),
            ))));
        }
        self.shared.emit(&BridgeSignal::Errored(reason));
    }

    /// Subscribe to terminal signals. Listeners run on the emitting thread
    /// and must not block.
    pub fn on_signal<F>(&self, listener: F)
    where
        F: Fn(&BridgeSignal) + Send + Sync + 'static,
    {
        self.shared.listeners.lock().push(Arc::new(listener));
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = self.shared.head.lock();
        f.debug_struct("ResponseWriter")
            .field("status", &head.status)
            .field("headers_sent", &head.headers_sent)
            .finish_non_exhaustive()
    }
}

/// Pull-based face of the bridge.
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<Chunk>,
    shared: Arc<Shared>,
}

impl ResponseStream {
    /// Drain the stream into one buffer.
    pub async fn read_to_end(mut self) -> Result<Bytes, io::Error> {
        use futures::StreamExt;

        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ResponseStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                self.shared.emit(&BridgeSignal::Closed);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.shared.emit(&BridgeSignal::Closed);
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .field("errored", &self.shared.errored.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use sluice_core::logging::capture_logs;
    use std::sync::atomic::AtomicUsize;
    use tracing::Level;

    fn header(name: &str, value: &str) -> Vec<(String, LegacyHeaderValue)> {
        vec![(name.to_owned(), value.into())]
    }

    #[tokio::test]
    async fn writes_flow_to_stream_in_order() {
        let (writer, stream) = response_bridge();
        assert!(writer.write_head(StatusCode::OK, header("content-type", "text/plain")));
        assert!(writer.write("hello "));
        assert!(writer.write(Bytes::from_static(b"world")));
        writer.end(Some(Bytes::from_static(b"!")));

        let body = stream.read_to_end().await.unwrap();
        assert_eq!(&body[..], b"hello world!");
        assert_eq!(writer.bytes_written(), 12);
    }

    #[test]
    fn headers_sent_flips_on_first_write_only() {
        let (writer, _stream) = response_bridge();
        assert!(!writer.headers_sent());
        assert!(writer.set_header("X-Trace", "1"));
        assert!(!writer.headers_sent());
        let _ = writer.write("a");
        assert!(writer.headers_sent());
    }

    #[test]
    fn end_commits_head() {
        let (writer, _stream) = response_bridge();
        writer.end(None);
        assert!(writer.headers_sent());
        assert!(writer.is_finished());
    }

    #[test]
    fn header_mutation_after_send_is_rejected_with_warning() {
        let (logs, _guard) = capture_logs();
        let (writer, _stream) = response_bridge();
        assert!(writer.set_header("content-type", "application/json"));
        let _ = writer.write("{}");

        assert!(!writer.set_header("content-type", "text/html"));
        assert!(!writer.remove_header("content-type"));
        assert!(!writer.write_head(StatusCode::IM_A_TEAPOT, header("x", "y")));

        assert_eq!(
            writer.get_header("content-type"),
            Some(LegacyHeaderValue::Scalar("application/json".into()))
        );
        assert_eq!(writer.status(), StatusCode::OK);
        assert_eq!(logs.count_at_level(Level::WARN), 3);
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let (writer, _stream) = response_bridge();
        let _ = writer.set_header("Content-Type", "text/plain");
        assert!(writer.get_header("content-type").is_some());
        assert!(writer.remove_header("CONTENT-TYPE"));
        assert!(writer.get_header("content-type").is_none());
        assert!(writer.get_headers().is_empty());
    }

    #[test]
    fn head_snapshot_converts_lists() {
        let (writer, _stream) = response_bridge();
        let _ = writer.write_head_with_message(
            StatusCode::CREATED,
            "Created",
            vec![("set-cookie".to_owned(), vec!["a=1", "b=2"])],
        );
        let (status, headers) = writer.head_snapshot();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(writer.status_message().as_deref(), Some("Created"));
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn write_after_end_is_dropped() {
        let (writer, _stream) = response_bridge();
        writer.end(None);
        assert!(!writer.write("late"));
        assert_eq!(writer.bytes_written(), 0);
    }

    #[test]
    fn write_after_consumer_drop_returns_false() {
        let (writer, stream) = response_bridge();
        drop(stream);
        assert!(!writer.write("nobody listening"));
    }

    #[test]
    fn writable_until_ended_or_abandoned() {
        let (writer, stream) = response_bridge();
        assert!(writer.is_writable());
        drop(stream);
        assert!(!writer.is_writable());

        let (writer, _stream) = response_bridge();
        writer.end(None);
        assert!(!writer.is_writable());
    }

    #[tokio::test]
    async fn destroy_surfaces_error_and_signal() {
        let (writer, mut stream) = response_bridge();
        let signals = Arc::new(Mutex::new(Vec::new()));
        let seen = signals.clone();
        writer.on_signal(move |s| seen.lock().push(s.clone()));

        let _ = writer.write("partial");
        writer.destroy("upstream reset");

        assert_eq!(&stream.next().await.unwrap().unwrap()[..], b"partial");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("upstream reset"));
        let cause = err.get_ref().and_then(|e| e.downcast_ref::<TransportError>());
        assert_eq!(cause.map(TransportError::code), Some("STREAM_FAILURE"));
        assert!(stream.next().await.is_none());
        drop(stream);

        let signals = signals.lock().clone();
        assert_eq!(
            signals,
            vec![
                BridgeSignal::Errored("upstream reset".into()),
                BridgeSignal::Closed
            ]
        );
    }

    #[tokio::test]
    async fn closed_fires_once_on_eof_then_drop() {
        let (writer, stream) = response_bridge();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        writer.on_signal(move |s| {
            if *s == BridgeSignal::Closed {
                let _ = c.fetch_add(1, Ordering::SeqCst);
            }
        });
        writer.end(Some(Bytes::from_static(b"x")));
        let _ = stream.read_to_end().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_stream_emits_closed() {
        let (writer, stream) = response_bridge();
        let closed = Arc::new(AtomicBool::new(false));
        let c = closed.clone();
        writer.on_signal(move |s| {
            if *s == BridgeSignal::Closed {
                c.store(true, Ordering::SeqCst);
            }
        });
        drop(stream);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cloned_writer_shares_state() {
        let (writer, stream) = response_bridge();
        let background = writer.clone();
        let task = tokio::spawn(async move {
            let _ = background.write("from task");
            background.end(None);
        });
        task.await.unwrap();
        assert!(writer.headers_sent());
        let body = stream.read_to_end().await.unwrap();
        assert_eq!(&body[..], b"from task");
    }
}
