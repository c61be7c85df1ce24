//! Outbound request construction (spec §4.1.2).
//!
//! Builds the request sent to the destination from the inbound request:
//! picks the outbound HTTP version, recomposes the URI against the
//! destination authority with the path-base dropped, filters headers, and
//! runs the request transform pipeline.

use std::net::IpAddr;

use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{HeaderValue, Method, Version, header};

use crate::error::ErrorKind;
use crate::headers::{copy_forwardable_headers, strip_hop_by_hop};
use crate::transform::{RequestTransformContext, TransformPipeline};
use crate::{Body, Request};

/// Destination and inbound-connection facts the request builder needs but
/// that come from outside the forwarding engine (routing, TLS termination,
/// connection info) — spec §6 "external collaborators".
pub struct RequestContext<'a> {
	pub destination_scheme: Scheme,
	pub destination_authority: Authority,
	/// Path component of the destination prefix, e.g. `/a/b/` for a
	/// destination prefix of `https://localhost:123/a/b/` (Glossary
	/// "Destination prefix"). The inbound path, with `path_base` dropped, is
	/// appended to this verbatim — no re-encoding.
	pub destination_path_prefix: &'a str,
	/// Prefix of the inbound path that is stripped before recomposing the
	/// outbound URI (spec §3 "Outbound Request" invariant).
	pub path_base: &'a str,
	pub client_addr: Option<IpAddr>,
	pub inbound_host: Option<&'a str>,
	pub inbound_scheme: &'a str,
	/// Opaque routing identifiers the hosting layer attaches purely for
	/// `ProxyInvoke` telemetry labeling (spec §6). This crate never reads
	/// them to make a routing decision of its own — choosing a cluster,
	/// route, or destination is an explicit non-goal (spec §1).
	pub cluster_id: Option<&'a str>,
	pub route_id: Option<&'a str>,
	pub destination_id: Option<&'a str>,
}

/// Whether the inbound request carries a body that must be streamed to the
/// destination, and how that body announces its own length (spec §4.1.2
/// step 1 "method and body classification").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyShape {
	/// No outbound body at all.
	Empty,
	/// Known length, forwarded with a `Content-Length` header.
	Sized(u64),
	/// Unknown length, forwarded chunked (HTTP/1.1) or as a length-less
	/// stream (HTTP/2+).
	Chunked,
}

/// Classifies the outbound request's body per spec §4.1.2 step 1. `POST`,
/// `PATCH`, `PUT`, `DELETE`, and any method this crate doesn't recognize
/// always carry a body, regardless of what the headers say; `GET`/`HEAD`/
/// `TRACE` only carry one when `Content-Length` or `Transfer-Encoding`
/// says so. Over HTTP/2 and newer, the method doesn't gate body presence at
/// all — any method is assumed to be arbitrary. Method comparison is
/// case-insensitive.
pub fn classify_body(method: &Method, headers: &http::HeaderMap, inbound_version: Version) -> BodyShape {
	let content_length = headers
		.get(header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|s| s.parse::<u64>().ok());
	let chunked = headers
		.get(header::TRANSFER_ENCODING)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|s| s.to_ascii_lowercase().contains("chunked"));

	let upper = method.as_str().to_ascii_uppercase();
	let conventionally_bodyless = matches!(upper.as_str(), "GET" | "HEAD" | "TRACE");

	let has_body = if inbound_version >= Version::HTTP_2 {
		true
	} else if conventionally_bodyless {
		content_length.is_some_and(|n| n > 0) || chunked
	} else {
		true
	};

	if !has_body {
		return BodyShape::Empty;
	}
	match content_length {
		Some(0) => BodyShape::Empty,
		Some(n) => BodyShape::Sized(n),
		None => BodyShape::Chunked,
	}
}

/// Picks the HTTP version to speak to the destination (spec §4.1.2 step 3):
/// HTTP/2 for a normal request, HTTP/1.1 when the inbound request is
/// upgrade-eligible, since HTTP/2 has no `Upgrade` mechanism to carry
/// forward.
pub fn outbound_version(upgrade_eligible: bool) -> Version {
	if upgrade_eligible { Version::HTTP_11 } else { Version::HTTP_2 }
}

/// Rewrites `inbound_path_and_query` against the destination, dropping
/// `path_base` as a prefix and appending what remains to
/// `destination_path_prefix` verbatim (Glossary "Destination prefix"; spec
/// §3 "Outbound Request"). If the inbound path does not start with
/// `path_base`, the path is forwarded unchanged — a missing prefix is a
/// routing-layer concern, not a forwarding failure.
pub fn compose_destination_uri(
	scheme: Scheme,
	authority: Authority,
	destination_path_prefix: &str,
	inbound_path_and_query: &PathAndQuery,
	path_base: &str,
) -> Result<Uri, ErrorKind> {
	let full = inbound_path_and_query.as_str();
	let trimmed = if !path_base.is_empty() && path_base != "/" {
		full.strip_prefix(path_base).unwrap_or(full)
	} else {
		full
	};
	if !trimmed.is_empty() && !trimmed.starts_with('/') && !trimmed.starts_with('?') {
		return Err(ErrorKind::Request);
	}
	let prefix = destination_path_prefix.trim_end_matches('/');
	let joined = if trimmed.is_empty() {
		if prefix.is_empty() { "/".to_string() } else { prefix.to_string() }
	} else {
		format!("{prefix}{trimmed}")
	};
	Uri::builder()
		.scheme(scheme)
		.authority(authority)
		.path_and_query(joined)
		.build()
		.map_err(|_| ErrorKind::Request)
}

/// Builds the outbound request from the inbound one. Returns the outbound
/// request with an empty body placeholder — the caller (the forwarding
/// engine) installs the real streamed body, since that requires the
/// [`crate::copy::StreamCopier`] wiring this module does not own.
pub fn build_outbound_request(
	inbound: &Request,
	ctx: &RequestContext<'_>,
	pipeline: &TransformPipeline,
) -> Result<http::Request<()>, ErrorKind> {
	let method = inbound.method().clone();
	let upgrade_eligible = crate::headers::upgrade_type(inbound.headers()).is_some();
	let version = outbound_version(upgrade_eligible);
	let path_and_query = inbound.uri().path_and_query().cloned().unwrap_or_else(|| PathAndQuery::from_static("/"));
	let uri = compose_destination_uri(
		ctx.destination_scheme.clone(),
		ctx.destination_authority.clone(),
		ctx.destination_path_prefix,
		&path_and_query,
		ctx.path_base,
	)?;

	let mut builder = http::Request::builder().method(method).uri(uri).version(version);
	{
		let headers = builder.headers_mut().expect("fresh builder has no error");
		copy_forwardable_headers(inbound.headers(), headers);
		if let Some(upgrade) = strip_hop_by_hop(headers) {
			// Forwarded separately from ordinary hop-by-hop stripping: an
			// upgrade request must keep exactly this pair.
			headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
			headers.insert(header::UPGRADE, upgrade);
		}
	}
	let outbound = builder.body(()).map_err(|_| ErrorKind::Request)?;
	let (mut parts, body) = outbound.into_parts();

	let mut tctx = RequestTransformContext {
		outbound: &mut parts,
		client_addr: ctx.client_addr,
		inbound_host: ctx.inbound_host,
		inbound_scheme: ctx.inbound_scheme,
		inbound_path_base: ctx.path_base,
	};
	pipeline.apply_request(&mut tctx).map_err(|_| ErrorKind::Request)?;

	Ok(http::Request::from_parts(parts, body))
}

/// Rebuilds `built` (produced by [`build_outbound_request`]) with the real
/// outbound body attached.
pub fn with_body(built: http::Request<()>, body: Body) -> Request {
	let (parts, _) = built.into_parts();
	http::Request::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
	use http::Uri;

	use super::*;

	#[test]
	fn classify_empty_get() {
		let h = http::HeaderMap::new();
		assert_eq!(classify_body(&Method::GET, &h, Version::HTTP_11), BodyShape::Empty);
	}

	#[test]
	fn classify_sized_post() {
		let mut h = http::HeaderMap::new();
		h.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
		assert_eq!(classify_body(&Method::POST, &h, Version::HTTP_11), BodyShape::Sized(42));
	}

	#[test]
	fn classify_chunked_post() {
		let mut h = http::HeaderMap::new();
		h.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
		assert_eq!(classify_body(&Method::POST, &h, Version::HTTP_11), BodyShape::Chunked);
	}

	#[test]
	fn classify_post_without_headers_still_has_body() {
		// POST always carries a body per spec, even with no Content-Length
		// and no Transfer-Encoding — unlike GET/HEAD/TRACE.
		let h = http::HeaderMap::new();
		assert_eq!(classify_body(&Method::POST, &h, Version::HTTP_11), BodyShape::Chunked);
	}

	#[test]
	fn classify_post_zero_length_is_still_empty_shape() {
		let mut h = http::HeaderMap::new();
		h.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
		assert_eq!(classify_body(&Method::POST, &h, Version::HTTP_11), BodyShape::Empty);
	}

	#[test]
	fn classify_get_zero_length_is_empty() {
		let mut h = http::HeaderMap::new();
		h.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
		assert_eq!(classify_body(&Method::GET, &h, Version::HTTP_11), BodyShape::Empty);
	}

	#[test]
	fn classify_get_over_http2_always_has_body() {
		let h = http::HeaderMap::new();
		assert_eq!(classify_body(&Method::GET, &h, Version::HTTP_2), BodyShape::Chunked);
	}

	#[test]
	fn compose_uri_drops_path_base_and_keeps_destination_path_prefix() {
		let uri = compose_destination_uri(
			Scheme::HTTPS,
			Authority::from_static("localhost:123"),
			"/a/b/",
			&PathAndQuery::from_static("/path/base/dropped/api/test?a=b&c=d"),
			"/path/base/dropped",
		)
		.unwrap();
		assert_eq!(uri, Uri::from_static("https://localhost:123/a/b/api/test?a=b&c=d"));
	}

	#[test]
	fn compose_uri_without_matching_prefix_passes_through() {
		let uri = compose_destination_uri(
			Scheme::HTTP,
			Authority::from_static("dest.example"),
			"",
			&PathAndQuery::from_static("/other/api"),
			"/base",
		)
		.unwrap();
		assert_eq!(uri, Uri::from_static("http://dest.example/other/api"));
	}

	#[test]
	fn outbound_version_depends_on_upgrade_eligibility() {
		assert_eq!(outbound_version(false), Version::HTTP_2);
		assert_eq!(outbound_version(true), Version::HTTP_11);
	}
}
