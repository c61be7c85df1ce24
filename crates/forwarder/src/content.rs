//! Adapts a byte stream into an [`http_body::Body`] so a [`StreamCopier`]
//! pump can feed an outbound request body (or an inbound response body)
//! without buffering it whole (spec §4.1.4 "StreamCopyHttpContent").
//!
//! Splits into a producer half ([`StreamCopyHttpContentSink`], an
//! `AsyncWrite`) and a consumer half ([`StreamCopyHttpContent`], a `Body`),
//! connected by a bounded channel. The engine needs to know two things this
//! pairing alone can't answer directly: whether the destination has started
//! reading the content, and whether the content has been fully consumed —
//! both independent of whether a response has come back yet, since with
//! full-duplex upload/download the answer to "is the body done" can arrive
//! before or after the response headers (spec §4.1.6).
//!
//! [`StreamCopier`]: crate::copy

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::{mpsc, watch};

type Chunk = std::io::Result<Bytes>;
type SendFuture = Pin<Box<dyn Future<Output = Result<(), mpsc::error::SendError<Chunk>>> + Send>>;

/// The `Body` half. Implements [`http_body::Body`] over chunks received
/// from the paired [`StreamCopyHttpContentSink`].
pub struct StreamCopyHttpContent {
	receiver: mpsc::Receiver<Chunk>,
	started: Arc<AtomicBool>,
	consumed_tx: watch::Sender<bool>,
}

impl Body for StreamCopyHttpContent {
	type Data = Bytes;
	type Error = std::io::Error;

	fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, std::io::Error>>> {
		let this = self.get_mut();
		this.started.store(true, Ordering::Release);
		match this.receiver.poll_recv(cx) {
			Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
			Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
			Poll::Ready(None) => {
				let _ = this.consumed_tx.send(true);
				Poll::Ready(None)
			}
			Poll::Pending => Poll::Pending,
		}
	}

	fn is_end_stream(&self) -> bool {
		false
	}

	fn size_hint(&self) -> SizeHint {
		SizeHint::default()
	}
}

/// The producer half, written to by a [`crate::copy::copy_stream`] pump.
pub struct StreamCopyHttpContentSink {
	sender: Option<mpsc::Sender<Chunk>>,
	pending: Option<SendFuture>,
}

impl tokio::io::AsyncWrite for StreamCopyHttpContentSink {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		let this = self.get_mut();
		loop {
			if let Some(fut) = this.pending.as_mut() {
				return match fut.as_mut().poll(cx) {
					Poll::Ready(Ok(())) => {
						this.pending = None;
						Poll::Ready(Ok(buf.len()))
					}
					Poll::Ready(Err(_)) => {
						this.pending = None;
						this.sender = None;
						Poll::Ready(Err(broken_pipe()))
					}
					Poll::Pending => Poll::Pending,
				};
			}
			let Some(sender) = this.sender.clone() else {
				return Poll::Ready(Err(broken_pipe()));
			};
			let chunk = Bytes::copy_from_slice(buf);
			this.pending = Some(Box::pin(async move { sender.send(Ok(chunk)).await }));
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		self.get_mut().sender = None;
		Poll::Ready(Ok(()))
	}
}

fn broken_pipe() -> std::io::Error {
	std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stream copy content consumer dropped")
}

/// Lets the engine observe the two facts that matter about a content
/// transfer without owning either half of the pipe (spec §4.1.4).
pub struct ContentSignals {
	started: Arc<AtomicBool>,
	consumed_rx: watch::Receiver<bool>,
}

impl ContentSignals {
	/// Has the consumer polled the body at least once?
	pub fn started(&self) -> bool {
		self.started.load(Ordering::Acquire)
	}

	/// Resolves once the producer side has sent its last chunk and the body
	/// has reported end-of-stream. Resolves immediately if that already
	/// happened.
	pub async fn wait_consumed(&mut self) {
		if *self.consumed_rx.borrow() {
			return;
		}
		let _ = self.consumed_rx.changed().await;
	}
}

/// Creates a connected `(content, sink, signals)` triple. `capacity` bounds
/// how many chunks may be in flight before the sink's writer blocks,
/// providing the backpressure a full-duplex copy needs.
pub fn stream_copy_http_content(capacity: usize) -> (StreamCopyHttpContent, StreamCopyHttpContentSink, ContentSignals) {
	let (tx, rx) = mpsc::channel(capacity);
	let (consumed_tx, consumed_rx) = watch::channel(false);
	let started = Arc::new(AtomicBool::new(false));
	let content = StreamCopyHttpContent {
		receiver: rx,
		started: started.clone(),
		consumed_tx,
	};
	let sink = StreamCopyHttpContentSink {
		sender: Some(tx),
		pending: None,
	};
	let signals = ContentSignals { started, consumed_rx };
	(content, sink, signals)
}
