use std::fmt;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};

/// Wraps a `Display`-able value so it can be used directly as a
/// `prometheus_client` label value, falling back to `"unknown"` when absent.
/// Mirrors the upstream gateway's `DefaultedUnknown` label wrapper.
#[derive(Clone, Hash, Debug, PartialEq, Eq)]
pub struct DefaultedUnknown<T>(pub Option<T>);

impl<T> From<Option<T>> for DefaultedUnknown<T> {
	fn from(value: Option<T>) -> Self {
		DefaultedUnknown(value)
	}
}

impl<T: fmt::Display> EncodeLabelValue for DefaultedUnknown<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
		match &self.0 {
			Some(v) => EncodeLabelValue::encode(&v.to_string(), writer),
			None => EncodeLabelValue::encode(&"unknown", writer),
		}
	}
}

impl<T> Default for DefaultedUnknown<T> {
	fn default() -> Self {
		DefaultedUnknown(None)
	}
}

/// Wraps any `Display` type so it can be encoded as a label value without
/// going through `DefaultedUnknown`'s `Option` semantics.
#[derive(Clone, Hash, Debug, PartialEq, Eq)]
pub struct EncodeDisplay<T>(pub T);

impl<T: fmt::Display> EncodeLabelValue for EncodeDisplay<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
		EncodeLabelValue::encode(&self.0.to_string(), writer)
	}
}
