//! Core runtime of an HTTP reverse-proxy: request forwarding and
//! entity-scoped periodic scheduling. Routing, load balancing, session
//! affinity, authentication, configuration loading, dependency wiring,
//! process hosting, and TLS termination are all external collaborators —
//! this crate only forwards a request it is handed and runs actions on a
//! timer it is told to run.

pub mod content;
pub mod copy;
pub mod engine;
pub mod error;
pub mod headers;
pub mod request;
pub mod scheduler;
pub mod telemetry;
pub mod transform;

/// The body type used throughout the forwarding path.
pub type Body = axum_core::body::Body;
/// An inbound or outbound HTTP request.
pub type Request = http::Request<Body>;
/// An inbound or outbound HTTP response.
pub type Response = http::Response<Body>;

pub use engine::{Forwarder, ForwarderStage, HttpClient};
pub use error::{ErrorFeature, ErrorKind, PumpSide};
pub use request::RequestContext;
pub use scheduler::{EntityActionScheduler, Period};
pub use telemetry::ForwarderMetrics;
pub use transform::{RequestTransform, ResponseTransform, TransformPipeline};
