//! Hop-by-hop header table and header-copy helpers (spec §3 "Header
//! Filter", §4.1.2 step 4).

use headers::HeaderMapExt;
use http::{HeaderMap, HeaderName, HeaderValue, header};

/// Headers whose scope is a single network hop and must never be forwarded
/// verbatim to the destination. Mirrors the upstream gateway's
/// `HOP_HEADERS` table in `proxy/httpproxy.rs`, including the non-standard
/// `proxy-connection` some clients (e.g. libcurl) still send.
pub static HOP_BY_HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

/// True for any header name starting with `:` — HTTP/2 and HTTP/3
/// pseudo-headers (`:authority`, `:method`, `:path`, `:scheme`, `:status`,
/// and anything else using the same convention). The `http` crate's
/// `HeaderMap` never actually stores these, since they're parsed out of the
/// request line by the HTTP/2 and HTTP/3 implementations before reaching
/// application code — this check exists so callers who construct headers
/// from an untyped source (tests, a non-`http`-crate front end) cannot
/// smuggle one through. See spec §9 "header-copy filter".
pub fn is_pseudo_header(name: &HeaderName) -> bool {
	name.as_str().starts_with(':')
}

/// Does `name` require hop-by-hop or pseudo-header stripping before being
/// forwarded?
pub fn is_unsafe_to_forward(name: &HeaderName) -> bool {
	is_pseudo_header(name) || HOP_BY_HOP_HEADERS.contains(name)
}

/// What upgrade, if any, the headers request (spec "Upgrade" in GLOSSARY).
/// Only meaningful when `Connection` contains the literal token `upgrade`.
pub fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
	let connection = headers.typed_get::<headers::Connection>()?;
	if connection.contains(header::UPGRADE) {
		headers.get(header::UPGRADE).cloned()
	} else {
		None
	}
}

/// Strips hop-by-hop headers in place, preserving trailer negotiation and
/// upgrade headers as spec.md's distillation would otherwise silently drop
/// them (SPEC_FULL.md §3). Returns the upgrade type if the inbound
/// requested one, so the caller can decide whether this request is
/// upgrade-eligible.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) -> Option<HeaderValue> {
	let wants_trailers = headers
		.get(header::TE)
		.and_then(|h| h.to_str().ok())
		.map(|s| s.contains("trailers"))
		.unwrap_or(false);
	let upgrade = upgrade_type(headers);

	for name in HOP_BY_HOP_HEADERS.iter() {
		headers.remove(name);
	}

	if wants_trailers {
		headers.typed_insert(headers::Te::trailers());
	}
	if let Some(upgrade) = upgrade.clone() {
		headers.typed_insert(headers::Connection::upgrade());
		headers.insert(header::UPGRADE, upgrade);
	}
	upgrade
}

/// Copies every header from `src` into `dst` that is safe to forward,
/// skipping hop-by-hop headers, pseudo-headers, and (by default) `Host` —
/// spec §3 "Outbound Request" invariant. `Host` is handled by the caller
/// via a transform, not copied here.
pub fn copy_forwardable_headers(src: &HeaderMap, dst: &mut HeaderMap) {
	for (name, value) in src.iter() {
		if is_unsafe_to_forward(name) || *name == header::HOST {
			continue;
		}
		dst.append(name.clone(), value.clone());
	}
}

/// Appends `value` to an existing `name` header (or inserts it if absent),
/// used for the `X-Forwarded-*` defaults in spec §6, which must be
/// *appended*, never overwritten, so a chain of proxies accumulates a full
/// path.
pub fn append_forwarded(headers: &mut HeaderMap, name: HeaderName, value: &str) {
	let existing = headers
		.get(&name)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_string());
	let new_value = match existing {
		Some(existing) => format!("{existing}, {value}"),
		None => value.to_string(),
	};
	if let Ok(hv) = HeaderValue::from_str(&new_value) {
		headers.insert(name, hv);
	}
}
