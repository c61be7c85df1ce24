//! The closed failure taxonomy for a single forwarded request (spec §7).
//!
//! `forward()` never propagates an error to its caller: every failure is
//! classified into an [`ErrorKind`], attached to the inbound response as an
//! [`ErrorFeature`], and turned into a status code (when the response has
//! not yet been committed) following [`ErrorKind::status_code`].

use http::StatusCode;

/// Closed taxonomy. Variant order follows spec §7 exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	None,
	Request,
	RequestCanceled,
	RequestBodyCanceled,
	RequestBodyClient,
	RequestBodyDestination,
	ResponseBodyCanceled,
	ResponseBodyClient,
	ResponseBodyDestination,
	UpgradeRequestCanceled,
	UpgradeRequestClient,
	UpgradeRequestDestination,
	UpgradeResponseCanceled,
	UpgradeResponseClient,
	UpgradeResponseDestination,
}

impl ErrorKind {
	/// Status code to use IF this failure was reached before response
	/// headers were committed. Once headers are committed the status cannot
	/// change regardless of what this returns — the caller must check that
	/// separately (see [`super::engine::ForwardOutcome`]).
	pub fn status_code(self) -> StatusCode {
		match self {
			ErrorKind::None => StatusCode::OK,
			// Client-caused failure while uploading the request body gets a
			// 4xx; every other pre-header failure is a 502.
			ErrorKind::RequestBodyClient => StatusCode::BAD_REQUEST,
			_ => StatusCode::BAD_GATEWAY,
		}
	}

	pub fn is_canceled(self) -> bool {
		matches!(
			self,
			ErrorKind::RequestCanceled
				| ErrorKind::RequestBodyCanceled
				| ErrorKind::ResponseBodyCanceled
				| ErrorKind::UpgradeRequestCanceled
				| ErrorKind::UpgradeResponseCanceled
		)
	}
}

impl std::fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		std::fmt::Debug::fmt(self, f)
	}
}

/// Attached to the inbound response on any failure, for downstream
/// middleware to inspect (spec §6 "Error feature").
#[derive(Debug)]
pub struct ErrorFeature {
	pub kind: ErrorKind,
	pub underlying: Option<anyhow::Error>,
}

impl ErrorFeature {
	pub fn new(kind: ErrorKind, underlying: impl Into<anyhow::Error>) -> Self {
		ErrorFeature {
			kind,
			underlying: Some(underlying.into()),
		}
	}

	pub fn canceled(kind: ErrorKind) -> Self {
		debug_assert!(kind.is_canceled());
		ErrorFeature {
			kind,
			underlying: None,
		}
	}

	pub fn none() -> Self {
		ErrorFeature {
			kind: ErrorKind::None,
			underlying: None,
		}
	}

	pub fn is_error(&self) -> bool {
		!matches!(self.kind, ErrorKind::None)
	}
}

/// The side of a body-pump that failed, used to classify an I/O failure
/// into the `*Client`/`*Destination` kind pairs (spec §4.1.3 "Classification
/// of failure").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpSide {
	/// The read from the source (the client, for a request upload; the
	/// destination, for a response download) failed.
	Input,
	/// The write to the sink failed.
	Output,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_body_client_maps_to_400() {
		assert_eq!(ErrorKind::RequestBodyClient.status_code(), StatusCode::BAD_REQUEST);
	}

	#[test]
	fn everything_else_pre_header_maps_to_502() {
		for kind in [
			ErrorKind::Request,
			ErrorKind::RequestCanceled,
			ErrorKind::RequestBodyCanceled,
			ErrorKind::RequestBodyDestination,
			ErrorKind::ResponseBodyCanceled,
			ErrorKind::ResponseBodyClient,
			ErrorKind::ResponseBodyDestination,
		] {
			assert_eq!(kind.status_code(), StatusCode::BAD_GATEWAY, "{kind:?}");
		}
	}

	#[test]
	fn canceled_kinds_agree_with_is_canceled() {
		assert!(ErrorKind::RequestCanceled.is_canceled());
		assert!(!ErrorKind::Request.is_canceled());
	}
}
