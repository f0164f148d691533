//! Bounded body capture.
//!
//! [`CaptureBody`] forwards every frame unchanged while keeping a copy of the
//! first `limit` bytes. When the stream ends, fails or is dropped, the copy is
//! delivered once through a oneshot channel.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::oneshot;

/// Body type used on both sides of the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Default capture bound per body.
pub const DEFAULT_MAX_BODY_CAPTURE: usize = 256 * 1024;

/// What a [`CaptureBody`] saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    /// First `limit` bytes of the body.
    pub bytes: Vec<u8>,
    /// Total bytes that passed through.
    pub seen: u64,
    /// Whether the body reached end of stream.
    pub complete: bool,
}

impl Captured {
    /// Cut at the bound, or never finished.
    pub fn truncated(&self) -> bool {
        !self.complete || self.seen > self.bytes.len() as u64
    }
}

/// A pass-through body that records a bounded prefix.
pub struct CaptureBody {
    inner: ProxyBody,
    limit: usize,
    captured: Captured,
    done: Option<oneshot::Sender<Captured>>,
}

impl CaptureBody {
    /// Wraps `inner`; the receiver resolves once the body is finished with.
    pub fn new(inner: ProxyBody, limit: usize) -> (Self, oneshot::Receiver<Captured>) {
        let (tx, rx) = oneshot::channel();
        let body = Self {
            inner,
            limit,
            captured: Captured::default(),
            done: Some(tx),
        };
        (body, rx)
    }

    fn record(&mut self, data: &Bytes) {
        self.captured.seen += data.len() as u64;
        let room = self.limit.saturating_sub(self.captured.bytes.len());
        if room > 0 {
            let take = room.min(data.len());
            self.captured.bytes.extend_from_slice(&data[..take]);
        }
    }

    fn finish(&mut self, complete: bool) {
        if let Some(done) = self.done.take() {
            self.captured.complete = complete;
            // Nobody waiting is fine.
            let _ = done.send(std::mem::take(&mut self.captured));
        }
    }
}

impl Body for CaptureBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.record(data);
                }
                if this.inner.is_end_stream() {
                    this.finish(true);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish(false);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        let complete = self.inner.is_end_stream();
        self.finish(complete);
    }
}

/// An empty body.
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// A body holding `chunk`.
pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
