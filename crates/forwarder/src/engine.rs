//! The forwarding engine (spec §4.1): turns one inbound request into one
//! outbound request, classifies whatever goes wrong into the closed
//! [`ErrorKind`] taxonomy, and for a successful `101 Switching Protocols`
//! response keeps the connection alive as a raw byte pump. Grounded on the
//! upstream gateway's `proxy/httpproxy.rs::proxy_to_upstream` and
//! `handle_upgrade`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, StatusCode, header};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio_util::sync::CancellationToken;

use crate::content::{StreamCopyHttpContentSink, stream_copy_http_content};
use crate::copy::{ActivityToken, CopyOutcome, copy_duplex, idle_timeout};
use crate::error::{ErrorFeature, ErrorKind, PumpSide};
use crate::request::{self, BodyShape, RequestContext, classify_body};
use crate::telemetry::ForwarderMetrics;
use crate::transform::{ResponseTransformContext, TransformPipeline};
use crate::{Body, Request, Response};

/// The stages `forward()` moves a request through (spec §4.1 state
/// machine). Emitted as `tracing` events and, for the two content-transfer
/// stages, used by [`ObservedResponseBody`] to report completion
/// independently of when `forward()` itself returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderStage {
	ReceivedRequest,
	SentRequest,
	ReceivedResponse,
	ResponseContentTransferStart,
	ResponseUpgrade,
	Completed,
}

/// The outbound HTTP client contract (spec §6). Implementations own their
/// own connection pooling and TLS; this crate never constructs connections
/// itself. An implementation forwarding to a real destination must preserve
/// `hyper::upgrade::OnUpgrade` on both the request and response extensions
/// for [`Forwarder::forward`] to support protocol upgrades.
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync {
	async fn send(&self, request: Request) -> Result<Response, anyhow::Error>;
}

/// Runs the forwarding state machine for one request at a time; cheap to
/// clone (everything inside is an `Arc`) and meant to be shared across
/// concurrent inbound requests (spec §5 "Shared resources").
#[derive(Clone)]
pub struct Forwarder {
	client: Arc<dyn HttpClient>,
	pipeline: TransformPipeline,
	metrics: Arc<ForwarderMetrics>,
	idle_timeout: Duration,
}

impl Forwarder {
	pub fn new(client: Arc<dyn HttpClient>, pipeline: TransformPipeline, metrics: Arc<ForwarderMetrics>, idle_timeout: Duration) -> Self {
		Forwarder {
			client,
			pipeline,
			metrics,
			idle_timeout,
		}
	}

	/// Forwards `inbound` to the destination named by `ctx` and returns the
	/// response to send back to the client. `cancel` is the external
	/// cancellation source (spec §5 "request_cancel"/"content_cancel"
	/// collapsed to one token, see DESIGN.md): fired on inbound-connection
	/// abort, it interrupts the destination HTTP client call, the request
	/// body pump, and an upgrade's byte pumps alike. Never returns an `Err`:
	/// every failure is folded into the returned [`Response`] per spec §7.
	pub async fn forward(&self, mut inbound: Request, ctx: RequestContext<'_>, cancel: &CancellationToken) -> Response {
		self.metrics.invoke(ctx.cluster_id, ctx.route_id, ctx.destination_id);
		tracing::debug!(stage = ?ForwarderStage::ReceivedRequest, "forwarding request");

		let inbound_headers = inbound.headers().clone();
		let body_shape = classify_body(inbound.method(), &inbound_headers, inbound.version());
		let client_upgrade = if crate::headers::upgrade_type(&inbound_headers).is_some() {
			inbound.extensions_mut().remove::<OnUpgrade>()
		} else {
			None
		};

		let built = match request::build_outbound_request(&inbound, &ctx, &self.pipeline) {
			Ok(b) => b,
			Err(kind) => return self.error_response(kind, None),
		};

		let (outbound_body, pump) = match body_shape {
			BodyShape::Empty => (Body::empty(), None),
			_ => {
				let (content, sink, signals) = stream_copy_http_content(4);
				let (activity, idle_cancel) = idle_timeout(cancel, self.idle_timeout);
				let body = std::mem::replace(inbound.body_mut(), Body::empty());
				let handle = tokio::spawn(pump_request_body(body, sink, idle_cancel, activity));
				(Body::new(content), Some((handle, signals)))
			}
		};
		let outbound = request::with_body(built, outbound_body);

		tracing::debug!(stage = ?ForwarderStage::SentRequest, "request sent to destination");
		let response = tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				if let Some((handle, _)) = pump {
					handle.abort();
				}
				return self.error_response(ErrorKind::RequestCanceled, None);
			}
			result = self.client.send(outbound) => match result {
				Ok(r) => r,
				Err(e) => {
					if let Some((handle, _)) = pump {
						handle.abort();
					}
					return self.error_response(ErrorKind::Request, Some(e));
				}
			},
		};
		tracing::debug!(stage = ?ForwarderStage::ReceivedResponse, status = %response.status(), "response headers received");

		// The upload may still be in flight (full-duplex): watch it in the
		// background. Once headers are committed the outcome can only be
		// logged, never change the status already decided above.
		if let Some((handle, _signals)) = pump {
			let metrics = self.metrics.clone();
			tokio::spawn(async move {
				match handle.await {
					Ok(PumpOutcome::Failed { side, error }) => {
						let kind = match side {
							PumpSide::Input => ErrorKind::RequestBodyClient,
							PumpSide::Output => ErrorKind::RequestBodyDestination,
						};
						metrics.failed(kind);
						tracing::warn!(?kind, %error, "request body pump failed after response headers were already sent");
					}
					Ok(PumpOutcome::Canceled) => {
						metrics.failed(ErrorKind::RequestBodyCanceled);
					}
					Ok(PumpOutcome::Done) | Err(_) => {}
				}
			});
		}

		if response.status() == StatusCode::SWITCHING_PROTOCOLS {
			return self.handle_upgrade(response, client_upgrade, cancel);
		}

		tracing::debug!(stage = ?ForwarderStage::ResponseContentTransferStart, "streaming response content");
		let (mut parts, body) = response.into_parts();
		crate::headers::strip_hop_by_hop(&mut parts.headers);
		{
			let mut tctx = ResponseTransformContext {
				headers: &mut parts.headers,
				reached_client: true,
			};
			if let Err(e) = self.pipeline.apply_response(&mut tctx) {
				tracing::debug!(error = %e, "response transform failed");
			}
		}
		self.metrics.stop(parts.status);
		let metrics = self.metrics.clone();
		let observed = ObservedResponseBody::new(body, metrics, self.pipeline.clone());
		let mut out = Response::new(Body::new(observed));
		*out.status_mut() = parts.status;
		*out.version_mut() = parts.version;
		std::mem::swap(out.headers_mut(), &mut parts.headers);
		*out.extensions_mut() = parts.extensions;
		out
	}

	/// Runs both upgrade pumps concurrently once hyper hands back the raw
	/// connections, and returns the `101` response immediately so the
	/// hosting layer can write it and complete the handshake (spec §4.1.6).
	fn handle_upgrade(&self, response: Response, client_upgrade: Option<OnUpgrade>, cancel: &CancellationToken) -> Response {
		tracing::debug!(stage = ?ForwarderStage::ResponseUpgrade, "switching protocols");
		let dest_upgrade = response.extensions().get::<OnUpgrade>().is_some();
		let (mut parts, _) = response.into_parts();
		let dest_on_upgrade = parts.extensions.remove::<OnUpgrade>();
		// The destination's own `Connection: upgrade`/`Upgrade` pair is exactly
		// what a 101 response must keep; `strip_hop_by_hop` already preserves
		// that pair through the strip the same way it does on the request side.
		crate::headers::strip_hop_by_hop(&mut parts.headers);
		{
			let mut tctx = ResponseTransformContext {
				headers: &mut parts.headers,
				reached_client: true,
			};
			if let Err(e) = self.pipeline.apply_response(&mut tctx) {
				tracing::debug!(error = %e, "response transform failed on upgrade");
			}
		}
		self.metrics.stop(parts.status);
		let metrics = self.metrics.clone();
		let idle = self.idle_timeout;
		let cancel = cancel.clone();

		if let (Some(client_upgrade), Some(dest_upgrade)) = (client_upgrade, dest_on_upgrade) {
			tokio::spawn(async move {
				let client_io = match client_upgrade.await {
					Ok(u) => TokioIo::new(u),
					Err(e) => {
						metrics.failed(ErrorKind::UpgradeRequestClient);
						tracing::warn!(error = %e, "client upgrade handshake failed");
						return;
					}
				};
				let dest_io = match dest_upgrade.await {
					Ok(u) => TokioIo::new(u),
					Err(e) => {
						metrics.failed(ErrorKind::UpgradeRequestDestination);
						tracing::warn!(error = %e, "destination upgrade handshake failed");
						return;
					}
				};
				let (activity, idle_cancel) = idle_timeout(&cancel, idle);
				let (c_read, c_write) = tokio::io::split(client_io);
				let (d_read, d_write) = tokio::io::split(dest_io);
				let (upload, download) = copy_duplex(c_read, d_write, d_read, c_write, &idle_cancel, Some(&activity)).await;
				classify_upgrade_outcome(&metrics, true, upload);
				classify_upgrade_outcome(&metrics, false, download);
			});
		} else if !dest_upgrade {
			tracing::warn!("destination returned 101 without an upgradeable connection");
		}

		let mut out = Response::new(Body::empty());
		*out.status_mut() = parts.status;
		*out.version_mut() = parts.version;
		*out.headers_mut() = parts.headers;
		out
	}

	fn error_response(&self, kind: ErrorKind, underlying: Option<anyhow::Error>) -> Response {
		self.metrics.failed(kind);
		tracing::debug!(stage = ?ForwarderStage::Completed, ?kind, "forwarding failed before response headers");
		let mut response = Response::new(Body::empty());
		*response.status_mut() = kind.status_code();
		response.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
		{
			let mut tctx = ResponseTransformContext {
				headers: response.headers_mut(),
				reached_client: false,
			};
			if let Err(e) = self.pipeline.apply_response(&mut tctx) {
				tracing::debug!(error = %e, "response transform failed on synthesized error response");
			}
		}
		let feature = match underlying {
			Some(e) => ErrorFeature::new(kind, e),
			None if kind.is_canceled() => ErrorFeature::canceled(kind),
			None => ErrorFeature::new(kind, anyhow::anyhow!("{kind}")),
		};
		response.extensions_mut().insert(feature);
		response
	}
}

fn classify_upgrade_outcome(metrics: &ForwarderMetrics, request_side: bool, outcome: CopyOutcome) {
	match outcome {
		CopyOutcome::Success { bytes } => {
			tracing::debug!(stage = ?ForwarderStage::Completed, request_side, bytes, "upgrade pump finished");
		}
		CopyOutcome::Canceled => metrics.failed(if request_side {
			ErrorKind::UpgradeRequestCanceled
		} else {
			ErrorKind::UpgradeResponseCanceled
		}),
		CopyOutcome::InputError(e) => {
			let kind = if request_side {
				ErrorKind::UpgradeRequestClient
			} else {
				ErrorKind::UpgradeResponseDestination
			};
			metrics.failed(kind);
			tracing::debug!(?kind, error = %e, "upgrade pump input error");
		}
		CopyOutcome::OutputError(e) => {
			let kind = if request_side {
				ErrorKind::UpgradeRequestDestination
			} else {
				ErrorKind::UpgradeResponseClient
			};
			metrics.failed(kind);
			tracing::debug!(?kind, error = %e, "upgrade pump output error");
		}
	}
}

/// Result of pumping the inbound request body into the outbound content
/// sink (spec §4.1.3 classification, applied to the request-body
/// direction).
enum PumpOutcome {
	Done,
	Canceled,
	Failed { side: PumpSide, error: anyhow::Error },
}

async fn pump_request_body(mut body: Body, mut sink: StreamCopyHttpContentSink, cancel: CancellationToken, activity: ActivityToken) -> PumpOutcome {
	use tokio::io::AsyncWriteExt;
	let mut total: u64 = 0;
	let mut last_emit = tokio::time::Instant::now();
	loop {
		let frame = tokio::select! {
			biased;
			_ = cancel.cancelled() => return PumpOutcome::Canceled,
			frame = body.frame() => frame,
		};
		match frame {
			None => {
				let _ = sink.shutdown().await;
				tracing::debug!(is_request = true, total_bytes = total, "ContentTransferred");
				return PumpOutcome::Done;
			}
			Some(Err(e)) => {
				return PumpOutcome::Failed {
					side: PumpSide::Input,
					error: e.into(),
				};
			}
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref() {
					activity.reset_timeout();
					if let Err(e) = sink.write_all(data).await {
						return PumpOutcome::Failed {
							side: PumpSide::Output,
							error: e.into(),
						};
					}
					total += data.len() as u64;
					if last_emit.elapsed() >= Duration::from_secs(1) {
						tracing::debug!(is_request = true, total_bytes = total, "ContentTransferring");
						last_emit = tokio::time::Instant::now();
					}
				}
			}
		}
	}
}

pin_project! {
	/// Wraps the destination's response body so its completion and failure
	/// are observed wherever it happens to be polled — which is the hosting
	/// layer's task, not `forward()`'s, since `forward()` already returned
	/// the response by the time the body is actually streamed out (spec
	/// §4.1 "ResponseContentTransferStart"/"Completed").
	pub struct ObservedResponseBody {
		#[pin]
		inner: Body,
		metrics: Arc<ForwarderMetrics>,
		pipeline: TransformPipeline,
		finished: bool,
	}
}

impl ObservedResponseBody {
	fn new(inner: Body, metrics: Arc<ForwarderMetrics>, pipeline: TransformPipeline) -> Self {
		ObservedResponseBody {
			inner,
			metrics,
			pipeline,
			finished: false,
		}
	}
}

impl HttpBody for ObservedResponseBody {
	type Data = Bytes;
	type Error = anyhow::Error;

	fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, anyhow::Error>>> {
		let mut this = self.project();
		match this.inner.as_mut().poll_frame(cx) {
			Poll::Ready(Some(Ok(mut frame))) => {
				if let Some(trailers) = frame.trailers_mut() {
					let mut tctx = ResponseTransformContext {
						headers: trailers,
						reached_client: true,
					};
					if let Err(e) = this.pipeline.apply_trailers(&mut tctx) {
						tracing::debug!(error = %e, "response trailer transform failed");
					}
				}
				Poll::Ready(Some(Ok(frame)))
			}
			Poll::Ready(Some(Err(e))) => {
				if !*this.finished {
					*this.finished = true;
					this.metrics.failed(ErrorKind::ResponseBodyDestination);
					tracing::debug!(stage = ?ForwarderStage::Completed, kind = ?ErrorKind::ResponseBodyDestination, "response body read failed");
				}
				Poll::Ready(Some(Err(anyhow::Error::new(e))))
			}
			Poll::Ready(None) => {
				if !*this.finished {
					*this.finished = true;
					tracing::debug!(stage = ?ForwarderStage::Completed, "response body fully forwarded");
				}
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

#[cfg(test)]
mod tests {
	use std::convert::Infallible;

	use http::{Method, Uri};
	use http::uri::{Authority, Scheme};
	use http_body_util::BodyExt as _;

	use super::*;

	struct EchoClient;

	#[async_trait::async_trait]
	impl HttpClient for EchoClient {
		async fn send(&self, request: Request) -> Result<Response, anyhow::Error> {
			let (parts, body) = request.into_parts();
			let collected = body.collect().await.map_err(|_: Infallible| unreachable!())?.to_bytes();
			let mut response = Response::new(Body::from(collected));
			response.headers_mut().insert("x-echo-path", parts.uri.path().parse().unwrap());
			Ok(response)
		}
	}

	struct FailingClient;

	#[async_trait::async_trait]
	impl HttpClient for FailingClient {
		async fn send(&self, _request: Request) -> Result<Response, anyhow::Error> {
			Err(anyhow::anyhow!("connection refused"))
		}
	}

	fn ctx() -> RequestContext<'static> {
		RequestContext {
			destination_scheme: Scheme::HTTP,
			destination_authority: Authority::from_static("dest.internal"),
			destination_path_prefix: "",
			path_base: "/base",
			client_addr: None,
			inbound_host: None,
			inbound_scheme: "http",
			cluster_id: None,
			route_id: None,
			destination_id: None,
		}
	}

	#[tokio::test]
	async fn forwards_and_strips_path_base() {
		let forwarder = Forwarder::new(
			Arc::new(EchoClient),
			TransformPipeline::default(),
			Arc::new(ForwarderMetrics::new_unregistered()),
			Duration::from_secs(30),
		);
		let inbound = http::Request::builder()
			.method(Method::POST)
			.uri(Uri::from_static("http://gateway/base/api"))
			.header(header::CONTENT_LENGTH, "5")
			.body(Body::from(&b"hello"[..]))
			.unwrap();

		let response = forwarder.forward(inbound, ctx(), &CancellationToken::new()).await;
		assert_eq!(response.headers().get("x-echo-path").unwrap(), "/api");
		let body = response.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(&body[..], b"hello");
	}

	#[tokio::test]
	async fn connect_failure_maps_to_502() {
		let forwarder = Forwarder::new(
			Arc::new(FailingClient),
			TransformPipeline::default(),
			Arc::new(ForwarderMetrics::new_unregistered()),
			Duration::from_secs(30),
		);
		let inbound = http::Request::builder()
			.method(Method::GET)
			.uri(Uri::from_static("http://gateway/base/api"))
			.body(Body::empty())
			.unwrap();

		let response = forwarder.forward(inbound, ctx(), &CancellationToken::new()).await;
		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
		assert!(response.extensions().get::<ErrorFeature>().unwrap().is_error());
	}

	#[tokio::test]
	async fn external_cancellation_short_circuits_before_the_client_call() {
		struct StallingClient;
		#[async_trait::async_trait]
		impl HttpClient for StallingClient {
			async fn send(&self, _request: Request) -> Result<Response, anyhow::Error> {
				std::future::pending().await
			}
		}

		let forwarder = Forwarder::new(
			Arc::new(StallingClient),
			TransformPipeline::default(),
			Arc::new(ForwarderMetrics::new_unregistered()),
			Duration::from_secs(30),
		);
		let inbound = http::Request::builder()
			.method(Method::GET)
			.uri(Uri::from_static("http://gateway/base/api"))
			.body(Body::empty())
			.unwrap();

		let cancel = CancellationToken::new();
		cancel.cancel();
		let response = forwarder.forward(inbound, ctx(), &cancel).await;
		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
		let feature = response.extensions().get::<ErrorFeature>().unwrap();
		assert_eq!(feature.kind, ErrorKind::RequestCanceled);
	}
}
