//! The transform pipeline (spec §3 "Transform", §4.1.2 step 5, §4.1.5).
//!
//! A [`Transform`] mutates the outbound request or response in place.
//! Transforms are immutable once the pipeline is built and are applied in
//! order; they are not required to be idempotent (spec §3).

use std::net::IpAddr;
use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, request};

use crate::headers::append_forwarded;

/// Everything a request transform needs: the outbound request parts being
/// built, plus the inbound connection facts that `X-Forwarded-*` transforms
/// append (spec §6).
pub struct RequestTransformContext<'a> {
	pub outbound: &'a mut request::Parts,
	pub client_addr: Option<IpAddr>,
	pub inbound_host: Option<&'a str>,
	pub inbound_scheme: &'a str,
	pub inbound_path_base: &'a str,
}

impl RequestTransformContext<'_> {
	/// Looks a header up the way spec §4.1.2 step 5 describes: across
	/// whichever bag it ended up in. In this crate's data model there is a
	/// single `HeaderMap` per outbound request, so this is just a
	/// convenience accessor, but it keeps call sites agnostic of that.
	pub fn header(&self, name: &HeaderName) -> Option<&HeaderValue> {
		self.outbound.headers.get(name)
	}

	pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
		self.outbound.headers.insert(name, value);
	}

	pub fn remove_header(&mut self, name: &HeaderName) {
		self.outbound.headers.remove(name);
	}
}

/// Everything a response/trailer transform needs. Shared between response
/// headers and response trailers (spec §4.1.5 "applies response-trailer
/// transforms to the inbound trailer feature") since a trailer block is just
/// another header map, with no status/version of its own to carry.
pub struct ResponseTransformContext<'a> {
	pub headers: &'a mut HeaderMap,
	/// Whether the response actually reached the client. Non-`always`
	/// transforms are skipped when this is `false` (spec §4.1.5).
	pub reached_client: bool,
}

pub trait RequestTransform: Send + Sync {
	fn apply(&self, ctx: &mut RequestTransformContext<'_>) -> anyhow::Result<()>;
}

pub trait ResponseTransform: Send + Sync {
	/// If `true`, this transform runs even on an errored/aborted response
	/// (spec §4.1.5). Defaults to `false`.
	fn always(&self) -> bool {
		false
	}
	fn apply(&self, ctx: &mut ResponseTransformContext<'_>) -> anyhow::Result<()>;
}

/// An ordered, immutable set of transforms built once and shared (via
/// `Arc`) across concurrent forwarded requests (spec §5 "Shared
/// resources").
#[derive(Clone, Default)]
pub struct TransformPipeline {
	request: Arc<Vec<Box<dyn RequestTransform>>>,
	response: Arc<Vec<Box<dyn ResponseTransform>>>,
	trailers: Arc<Vec<Box<dyn ResponseTransform>>>,
}

impl TransformPipeline {
	pub fn builder() -> TransformPipelineBuilder {
		TransformPipelineBuilder::default()
	}

	pub fn apply_request(&self, ctx: &mut RequestTransformContext<'_>) -> anyhow::Result<()> {
		for t in self.request.iter() {
			t.apply(ctx)?;
		}
		Ok(())
	}

	/// Applies response transforms. When `reached_client` is `false`, only
	/// `always()` transforms run (spec §4.1.5).
	pub fn apply_response(&self, ctx: &mut ResponseTransformContext<'_>) -> anyhow::Result<()> {
		for t in self.response.iter() {
			if ctx.reached_client || t.always() {
				t.apply(ctx)?;
			}
		}
		Ok(())
	}

	pub fn apply_trailers(&self, ctx: &mut ResponseTransformContext<'_>) -> anyhow::Result<()> {
		for t in self.trailers.iter() {
			if ctx.reached_client || t.always() {
				t.apply(ctx)?;
			}
		}
		Ok(())
	}
}

#[derive(Default)]
pub struct TransformPipelineBuilder {
	request: Vec<Box<dyn RequestTransform>>,
	response: Vec<Box<dyn ResponseTransform>>,
	trailers: Vec<Box<dyn ResponseTransform>>,
}

impl TransformPipelineBuilder {
	pub fn add_request(mut self, t: impl RequestTransform + 'static) -> Self {
		self.request.push(Box::new(t));
		self
	}

	pub fn add_response(mut self, t: impl ResponseTransform + 'static) -> Self {
		self.response.push(Box::new(t));
		self
	}

	pub fn add_trailer(mut self, t: impl ResponseTransform + 'static) -> Self {
		self.trailers.push(Box::new(t));
		self
	}

	pub fn build(self) -> TransformPipeline {
		TransformPipeline {
			request: Arc::new(self.request),
			response: Arc::new(self.response),
			trailers: Arc::new(self.trailers),
		}
	}
}

/// Sets (or clears) the outbound `Host` header. By default the engine
/// clears `Host` during request construction (spec §3 invariant); install
/// this transform to re-set it explicitly, e.g. to the destination's own
/// authority.
pub struct HostHeaderTransform(pub HeaderValue);

impl RequestTransform for HostHeaderTransform {
	fn apply(&self, ctx: &mut RequestTransformContext<'_>) -> anyhow::Result<()> {
		ctx.set_header(http::header::HOST, self.0.clone());
		Ok(())
	}
}

/// Appends the four `X-Forwarded-*` defaults described in spec §6. Each is
/// appended (never overwritten) so a chain of proxies accumulates the full
/// path.
#[derive(Default)]
pub struct XForwardedTransform {
	pub for_: bool,
	pub host: bool,
	pub proto: bool,
	pub path_base: bool,
}

impl XForwardedTransform {
	pub fn all() -> Self {
		XForwardedTransform {
			for_: true,
			host: true,
			proto: true,
			path_base: true,
		}
	}
}

impl RequestTransform for XForwardedTransform {
	fn apply(&self, ctx: &mut RequestTransformContext<'_>) -> anyhow::Result<()> {
		if self.for_ {
			if let Some(addr) = ctx.client_addr {
				append_forwarded(
					&mut ctx.outbound.headers,
					HeaderName::from_static("x-forwarded-for"),
					&addr.to_string(),
				);
			}
		}
		if self.host {
			if let Some(host) = ctx.inbound_host {
				append_forwarded(&mut ctx.outbound.headers, HeaderName::from_static("x-forwarded-host"), host);
			}
		}
		if self.proto {
			append_forwarded(
				&mut ctx.outbound.headers,
				HeaderName::from_static("x-forwarded-proto"),
				ctx.inbound_scheme,
			);
		}
		if self.path_base && !ctx.inbound_path_base.is_empty() {
			append_forwarded(
				&mut ctx.outbound.headers,
				HeaderName::from_static("x-forwarded-pathbase"),
				ctx.inbound_path_base,
			);
		}
		Ok(())
	}
}

/// Generic add/set/remove header modifier, the same shape as the upstream
/// gateway's `filters::HeaderModifier`.
#[derive(Default, Clone)]
pub struct HeaderModifier {
	pub add: Vec<(HeaderName, HeaderValue)>,
	pub set: Vec<(HeaderName, HeaderValue)>,
	pub remove: Vec<HeaderName>,
}

impl RequestTransform for HeaderModifier {
	fn apply(&self, ctx: &mut RequestTransformContext<'_>) -> anyhow::Result<()> {
		for (k, v) in &self.add {
			ctx.outbound.headers.append(k.clone(), v.clone());
		}
		for (k, v) in &self.set {
			ctx.outbound.headers.insert(k.clone(), v.clone());
		}
		for k in &self.remove {
			ctx.outbound.headers.remove(k);
		}
		Ok(())
	}
}

impl ResponseTransform for HeaderModifier {
	fn apply(&self, ctx: &mut ResponseTransformContext<'_>) -> anyhow::Result<()> {
		for (k, v) in &self.add {
			ctx.headers.append(k.clone(), v.clone());
		}
		for (k, v) in &self.set {
			ctx.headers.insert(k.clone(), v.clone());
		}
		for k in &self.remove {
			ctx.headers.remove(k);
		}
		Ok(())
	}
}
