//! Forwarder-local metrics (spec §6 "ProxyStart"/"ProxyStop"/"ProxyFailed"/
//! "ProxyInvoke"). Grounded on the upstream gateway's
//! `telemetry/metrics.rs::CommonTrafficLabels`/`Family` usage, reusing
//! [`proxy_rt_core::metrics`]'s label wrappers.

use http::StatusCode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use proxy_rt_core::metrics::{DefaultedUnknown, EncodeDisplay};

use crate::error::ErrorKind;

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
	kind: EncodeDisplay<ErrorKind>,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
	status: EncodeDisplay<u16>,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
struct InvokeLabels {
	cluster_id: DefaultedUnknown<String>,
	route_id: DefaultedUnknown<String>,
	destination_id: DefaultedUnknown<String>,
}

/// Counters for one [`crate::engine::Forwarder`]. Registered once at
/// startup and shared (via `Arc`) across every forwarded request.
pub struct ForwarderMetrics {
	invocations: Family<InvokeLabels, Counter>,
	completions: Family<StatusLabels, Counter>,
	failures: Family<FailureLabels, Counter>,
}

impl ForwarderMetrics {
	/// Registers this forwarder's counters under `registry`.
	pub fn new(registry: &mut Registry) -> Self {
		let invocations = Family::<InvokeLabels, Counter>::default();
		let completions = Family::<StatusLabels, Counter>::default();
		let failures = Family::<FailureLabels, Counter>::default();
		registry.register("forwarder_invocations", "requests handed to the forwarding engine", invocations.clone());
		registry.register("forwarder_completions", "requests whose response status was committed to the client", completions.clone());
		registry.register("forwarder_failures", "forwarded requests that ended in a non-`None` error kind", failures.clone());
		ForwarderMetrics {
			invocations,
			completions,
			failures,
		}
	}

	/// A counter set not attached to any registry, for tests and other
	/// contexts that don't care about exported metrics.
	pub fn new_unregistered() -> Self {
		ForwarderMetrics {
			invocations: Family::default(),
			completions: Family::default(),
			failures: Family::default(),
		}
	}

	/// `ProxyInvoke(clusterId, routeId, destinationId)`: one request entered
	/// `forward()`. The three identifiers are opaque labels supplied by
	/// whatever routing layer chose a destination for this request — this
	/// crate only threads them through for telemetry, never reads them to
	/// make a routing decision of its own.
	pub fn invoke(&self, cluster_id: Option<&str>, route_id: Option<&str>, destination_id: Option<&str>) {
		self.invocations
			.get_or_create(&InvokeLabels {
				cluster_id: cluster_id.map(str::to_string).into(),
				route_id: route_id.map(str::to_string).into(),
				destination_id: destination_id.map(str::to_string).into(),
			})
			.inc();
	}

	/// `ProxyStop(status_code)`: a response status was committed to the
	/// client, whether or not the body transfer that follows it succeeds.
	pub fn stop(&self, status: StatusCode) {
		self.completions
			.get_or_create(&StatusLabels {
				status: EncodeDisplay(status.as_u16()),
			})
			.inc();
	}

	/// `ProxyFailed`: the request ended with a non-`None` [`ErrorKind`].
	/// Called even for `ErrorKind::None`'s siblings that are themselves
	/// classified as cancellation, since those are still failures from the
	/// forwarder's point of view (spec §7).
	pub fn failed(&self, kind: ErrorKind) {
		if matches!(kind, ErrorKind::None) {
			return;
		}
		self.failures.get_or_create(&FailureLabels { kind: EncodeDisplay(kind) }).inc();
	}
}
