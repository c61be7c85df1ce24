// Logging setup. Simplified from the upstream gateway's Istio-flavored
// formatter: we keep the same shape (env-filter driven, reload-capable)
// but emit through `tracing-subscriber`'s stock `fmt` layer rather than a
// bespoke non-blocking JSON writer, since nothing downstream of this crate
// needs that wire format.

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Instant;

use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Registry, filter, reload};

pub static APPLICATION_START_TIME: OnceLock<Instant> = OnceLock::new();

type BoxLayer = Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, filter::Targets, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

static LOG_HANDLE: OnceLock<LogHandle> = OnceLock::new();

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}

/// Installs a global `tracing` subscriber. Idempotent-ish: a second call in
/// the same process will panic, same as upstream `tracing_subscriber::init`.
pub fn setup_logging() {
	let _ = APPLICATION_START_TIME.set(Instant::now());
	let format: BoxLayer = Box::new(tracing_subscriber::fmt::layer().with_target(true));
	let filter = default_filter();
	let (layer, reload) = reload::Layer::new(format.with_filter(filter));
	let _ = LOG_HANDLE.set(reload);
	tracing_subscriber::registry().with(layer).init();
}

fn default_filter() -> filter::Targets {
	let var = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
	filter::Targets::from_str(&var).expect("static filter should build")
}

/// Dynamically widen the logging filter. `reset` discards the current
/// directives and starts from `default_filter()` again.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
	let current = handle.with_current(|f| f.filter().to_string())?;
	let new_directive = if reset {
		if level.is_empty() {
			default_filter().to_string()
		} else {
			format!("{},{}", default_filter(), level)
		}
	} else {
		format!("{current},{level}")
	};
	let new_filter = filter::Targets::from_str(&new_directive)?;
	tracing::info!("new log filter is {new_filter}");
	handle.modify(|layer| {
		*layer.filter_mut() = new_filter;
	})?;
	Ok(())
}
