//! Bidirectional byte-stream copying (spec §4.1.3 "Stream Copy Activity
//! Token", §3). Grounded on the upstream gateway's `agent-core/src/copy.rs`
//! buffer-pool copier, simplified from its tiered buffer pool down to the
//! flat 64 KiB buffer this crate's spec calls for.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Size of the single reusable buffer each [`StreamCopier`] allocates.
pub const BUFFER_SIZE: usize = 64 * 1024;

/// How a copy ended (spec §4.1.3 "Classification of failure").
#[derive(Debug)]
pub enum CopyOutcome {
	/// The source reached EOF cleanly; `bytes` were moved.
	Success { bytes: u64 },
	/// The read side returned an error.
	InputError(io::Error),
	/// The write side returned an error.
	OutputError(io::Error),
	/// The copy was canceled before completion (spec §4.1.3 "Canceled").
	Canceled,
}

/// A handle that a running [`StreamCopier`] hands out so its caller can
/// report liveness without owning the copy loop itself — e.g. an
/// idle-timeout watchdog that must not fire while bytes are still moving
/// (spec §4.1.3 "Stream Copy Activity Token").
#[derive(Clone)]
pub struct ActivityToken {
	notify: Arc<Notify>,
}

impl ActivityToken {
	/// Signals that activity occurred, rearming whatever idle timer is
	/// watching this token.
	pub fn reset_timeout(&self) {
		self.notify.notify_one();
	}
}

/// Spawns a background idle-timeout watcher as a child of `parent` (spec §5
/// "all three sources are linked so that any cancellation interrupts every
/// outstanding stream operation"): the returned token fires on idle timeout
/// OR whenever `parent` itself is canceled, e.g. by the caller's external
/// `request_cancel`/`content_cancel`. Returns an [`ActivityToken`] the
/// copier resets on every successful read/write, and the linked
/// [`CancellationToken`]. Dropping the returned token's last clone (the
/// caller keeps no other handle) stops the watcher task once the copy that
/// owns it ends, since the notify `Arc` is then only held by the watcher's
/// own select loop — callers should let both halves be dropped together by
/// scoping them to a single copy.
pub fn idle_timeout(parent: &CancellationToken, idle: Duration) -> (ActivityToken, CancellationToken) {
	let notify = Arc::new(Notify::new());
	let cancel = parent.child_token();
	let token = ActivityToken { notify: notify.clone() };
	let watcher_cancel = cancel.clone();
	tokio::spawn(async move {
		loop {
			tokio::select! {
				_ = watcher_cancel.cancelled() => return,
				_ = tokio::time::sleep(idle) => {
					watcher_cancel.cancel();
					return;
				}
				_ = notify.notified() => continue,
			}
		}
	});
	(token, cancel)
}

/// Minimum gap between `ContentTransferring` events for a single pump (spec
/// §6 "`ContentTransferring` ... at most once per second").
const CONTENT_TRANSFERRING_INTERVAL: Duration = Duration::from_secs(1);

/// Copies bytes from `reader` to `writer` until EOF, cancellation, or
/// either side errors. A single `BUFFER_SIZE` buffer is reused for the
/// whole copy; no per-chunk allocation occurs after the first read.
/// `is_request` labels the emitted `ContentTransferring`/`ContentTransferred`
/// events by direction (spec §6), since one pump carries the request body
/// and the other the response body.
pub async fn copy_stream<R, W>(
	mut reader: R,
	mut writer: W,
	is_request: bool,
	cancel: &CancellationToken,
	activity: Option<&ActivityToken>,
) -> CopyOutcome
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut buf = vec![0u8; BUFFER_SIZE];
	let mut total: u64 = 0;
	let mut iops: u64 = 0;
	let mut read_time = Duration::ZERO;
	let mut write_time = Duration::ZERO;
	let mut first_read_time: Option<Duration> = None;
	let start = tokio::time::Instant::now();
	let mut last_emit = start;

	loop {
		let read_started = tokio::time::Instant::now();
		let read = tokio::select! {
			biased;
			_ = cancel.cancelled() => return CopyOutcome::Canceled,
			res = reader.read(&mut buf) => res,
		};
		read_time += read_started.elapsed();
		if first_read_time.is_none() {
			first_read_time = Some(start.elapsed());
		}
		let n = match read {
			Ok(0) => {
				let flush_started = tokio::time::Instant::now();
				if let Err(e) = writer.flush().await {
					return CopyOutcome::OutputError(e);
				}
				write_time += flush_started.elapsed();
				tracing::debug!(
					is_request,
					total_bytes = total,
					iops,
					read_time = ?read_time,
					write_time = ?write_time,
					first_read_time = ?first_read_time,
					"ContentTransferred"
				);
				return CopyOutcome::Success { bytes: total };
			}
			Ok(n) => n,
			Err(e) => return CopyOutcome::InputError(e),
		};
		if let Some(a) = activity {
			a.reset_timeout();
		}
		let write_started = tokio::time::Instant::now();
		if let Err(e) = writer.write_all(&buf[..n]).await {
			return CopyOutcome::OutputError(e);
		}
		write_time += write_started.elapsed();
		total += n as u64;
		iops += 1;
		if let Some(a) = activity {
			a.reset_timeout();
		}

		if last_emit.elapsed() >= CONTENT_TRANSFERRING_INTERVAL {
			tracing::debug!(is_request, total_bytes = total, iops, read_time = ?read_time, write_time = ?write_time, "ContentTransferring");
			last_emit = tokio::time::Instant::now();
		}
	}
}

/// Runs two [`copy_stream`] pumps concurrently over a pair of duplex
/// streams, the shape an HTTP Upgrade needs (spec §4.1.6): client→destination
/// and destination→client run side by side, sharing one cancellation token
/// so that either direction failing tears down the other.
pub async fn copy_duplex(
	a_read: impl AsyncRead + Unpin,
	a_write: impl AsyncWrite + Unpin,
	b_read: impl AsyncRead + Unpin,
	b_write: impl AsyncWrite + Unpin,
	cancel: &CancellationToken,
	activity: Option<&ActivityToken>,
) -> (CopyOutcome, CopyOutcome) {
	let forward = copy_stream(a_read, b_write, true, cancel, activity);
	let backward = copy_stream(b_read, a_write, false, cancel, activity);
	tokio::join!(forward, backward)
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::io::duplex;

	use super::*;

	#[tokio::test]
	async fn copies_until_eof() {
		let (mut client, server) = duplex(1024);
		let (server_read, server_write) = tokio::io::split(server);
		let cancel = CancellationToken::new();
		let copy_task = tokio::spawn(async move { copy_stream(server_read, server_write, true, &cancel, None).await });

		client.write_all(b"hello world").await.unwrap();
		drop(client);

		match copy_task.await.unwrap() {
			CopyOutcome::Success { bytes } => assert_eq!(bytes, 11),
			other => panic!("unexpected outcome: {other:?}"),
		}
	}

	#[tokio::test]
	async fn cancellation_stops_copy() {
		let (client, server) = duplex(1024);
		let (server_read, server_write) = tokio::io::split(server);
		let cancel = CancellationToken::new();
		let child = cancel.clone();
		let copy_task = tokio::spawn(async move { copy_stream(server_read, server_write, true, &child, None).await });

		cancel.cancel();
		match copy_task.await.unwrap() {
			CopyOutcome::Canceled => {}
			other => panic!("unexpected outcome: {other:?}"),
		}
		drop(client);
	}

	#[tokio::test(start_paused = true)]
	async fn idle_timeout_fires_without_activity() {
		let parent = CancellationToken::new();
		let (activity, cancel) = idle_timeout(&parent, Duration::from_millis(50));
		drop(activity);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(cancel.is_cancelled());
	}

	#[tokio::test]
	async fn idle_timeout_fires_when_parent_is_canceled() {
		let parent = CancellationToken::new();
		let (_activity, cancel) = idle_timeout(&parent, Duration::from_secs(30));
		parent.cancel();
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert!(cancel.is_cancelled());
	}

	#[tokio::test(start_paused = true)]
	async fn idle_timeout_does_not_fire_while_reset() {
		let parent = CancellationToken::new();
		let (activity, cancel) = idle_timeout(&parent, Duration::from_millis(50));
		for _ in 0..5 {
			tokio::time::sleep(Duration::from_millis(30)).await;
			activity.reset_timeout();
		}
		assert!(!cancel.is_cancelled());
	}
}
