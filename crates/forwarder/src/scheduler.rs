//! Timer-driven periodic action invocation per registered entity (spec
//! §4.2 "EntityActionScheduler"). No example in the example pack implements
//! anything resembling this, so it is grounded on the upstream gateway's
//! general background-task idioms instead: the `Weak` back-reference comes
//! from `core/src/drain.rs`'s watcher pattern (a background task must not
//! keep its owner alive), and the registry-of-entries-behind-a-lock shape
//! comes from `client/dns.rs`'s resolver cache.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Action = Arc<dyn Fn() -> ActionFuture + Send + Sync>;

/// How often a scheduled entity's action repeats (spec §4.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
	/// Fires once after `delay`, then the entity is automatically
	/// unscheduled.
	RunOnce(Duration),
	/// Fires every `interval`, indefinitely, until unscheduled.
	Infinite(Duration),
}

impl Period {
	fn duration(self) -> Duration {
		match self {
			Period::RunOnce(d) | Period::Infinite(d) => d,
		}
	}
}

struct Entry {
	period: Mutex<Period>,
	/// Bumped on every `change_period` and on removal, so a timer task
	/// woken from a stale `sleep` can tell it is no longer the current
	/// incarnation of this entity's schedule without racing the entry that
	/// superseded it (spec §4.2.4 "race-free rearm").
	version: AtomicU64,
	/// Set for the duration of `(entry.action)().await` (spec §4.2.3). While
	/// this is set there is no "currently armed timer" to replace, so
	/// `change_period` must not spawn a competing timer task — doing so
	/// would let the in-flight invocation and the new task's own invocation
	/// run concurrently for the same entity.
	running_callback: AtomicBool,
	action: Action,
}

struct Inner<K> {
	entries: Mutex<HashMap<K, Arc<Entry>>>,
	started: AtomicBool,
	disposed: AtomicBool,
}

/// Invokes a registered action on a timer, per entity, until the entity is
/// unscheduled, its action fails, or the scheduler is disposed. Cloning an
/// `EntityActionScheduler` shares the same registry.
#[derive(Clone)]
pub struct EntityActionScheduler<K> {
	inner: Arc<Inner<K>>,
}

impl<K> Default for EntityActionScheduler<K>
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<K> EntityActionScheduler<K>
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
{
	pub fn new() -> Self {
		EntityActionScheduler {
			inner: Arc::new(Inner {
				entries: Mutex::new(HashMap::new()),
				started: AtomicBool::new(false),
				disposed: AtomicBool::new(false),
			}),
		}
	}

	/// Registers `key` with `action` and `period`. If the scheduler has
	/// already been [`start`](Self::start)ed, the timer begins immediately;
	/// otherwise it begins when `start()` is called. If `key` is already
	/// registered, this call is silently rejected and the existing entry
	/// keeps its original period (spec §4.2.1) — use
	/// [`change_period`](Self::change_period) to reschedule an existing
	/// entity instead.
	pub fn schedule<F, Fut>(&self, key: K, period: Period, action: F)
	where
		F: Fn() -> Fut + Send + Sync + 'static,
		Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		if self.inner.disposed.load(Ordering::SeqCst) {
			return;
		}
		let mut entries = self.inner.entries.lock().unwrap();
		if entries.contains_key(&key) {
			return;
		}
		let entry = Arc::new(Entry {
			period: Mutex::new(period),
			version: AtomicU64::new(0),
			running_callback: AtomicBool::new(false),
			action: Arc::new(move || Box::pin(action()) as ActionFuture),
		});
		entries.insert(key.clone(), entry.clone());
		drop(entries);
		if self.inner.started.load(Ordering::SeqCst) {
			spawn_timer(&self.inner, key, entry, 0);
		}
	}

	/// Changes the period of an already-scheduled entity. A no-op if `key`
	/// is not scheduled. If a timer is currently armed (sleeping between
	/// firings), it is replaced immediately with one running the new period
	/// from now. If no timer is armed — the scheduler isn't started yet, or
	/// this entity's callback is currently executing — there is nothing to
	/// replace; the new period simply takes effect the next time the entity
	/// is armed (spec §4.2.3). Must not be called for an entity scheduled
	/// with [`Period::RunOnce`] — such an entity unschedules itself the
	/// moment its action starts running, so there is no period left to
	/// change.
	pub fn change_period(&self, key: &K, period: Period) {
		let entries = self.inner.entries.lock().unwrap();
		let Some(entry) = entries.get(key).cloned() else { return };
		debug_assert!(
			!matches!(*entry.period.lock().unwrap(), Period::RunOnce(_)),
			"change_period called on a run_once entity"
		);
		let version = {
			*entry.period.lock().unwrap() = period;
			entry.version.fetch_add(1, Ordering::SeqCst) + 1
		};
		drop(entries);
		if self.inner.started.load(Ordering::SeqCst) && !entry.running_callback.load(Ordering::SeqCst) {
			spawn_timer(&self.inner, key.clone(), entry, version);
		}
	}

	/// Removes `key`, stopping its timer. Its in-flight action invocation
	/// (if any) still runs to completion but will not be rescheduled.
	pub fn unschedule(&self, key: &K) {
		if let Some(entry) = self.inner.entries.lock().unwrap().remove(key) {
			entry.version.fetch_add(1, Ordering::SeqCst);
		}
	}

	pub fn is_scheduled(&self, key: &K) -> bool {
		self.inner.entries.lock().unwrap().contains_key(key)
	}

	/// Starts timers for every currently-registered entity and for every
	/// entity scheduled afterward. Idempotent.
	pub fn start(&self) {
		if self.inner.started.swap(true, Ordering::SeqCst) {
			return;
		}
		let entries: Vec<(K, Arc<Entry>)> = self
			.inner
			.entries
			.lock()
			.unwrap()
			.iter()
			.map(|(k, e)| (k.clone(), e.clone()))
			.collect();
		for (key, entry) in entries {
			let version = entry.version.load(Ordering::SeqCst);
			spawn_timer(&self.inner, key, entry, version);
		}
	}

	/// Stops all timers and clears the registry. A disposed scheduler
	/// rejects further `schedule` calls.
	pub fn dispose(&self) {
		self.inner.disposed.store(true, Ordering::SeqCst);
		let mut entries = self.inner.entries.lock().unwrap();
		for entry in entries.values() {
			entry.version.fetch_add(1, Ordering::SeqCst);
		}
		entries.clear();
	}
}

fn spawn_timer<K>(inner: &Arc<Inner<K>>, key: K, entry: Arc<Entry>, expected_version: u64)
where
	K: Eq + Hash + Clone + Send + Sync + 'static,
{
	let weak: Weak<Inner<K>> = Arc::downgrade(inner);
	tokio::spawn(async move {
		let mut version = expected_version;
		loop {
			let period = *entry.period.lock().unwrap();
			tokio::time::sleep(period.duration()).await;

			let Some(inner) = weak.upgrade() else { return };
			let still_current = {
				let entries = inner.entries.lock().unwrap();
				matches!(entries.get(&key), Some(current) if Arc::ptr_eq(current, &entry))
					&& entry.version.load(Ordering::SeqCst) == version
			};
			if !still_current {
				return;
			}

			// `run_once` removes the entry from the registry *before*
			// invoking the action, not after: by the time the action runs,
			// `is_scheduled` already reports false for it, and the
			// remove-on-failure path below becomes a no-op for this entry
			// since it is already gone.
			let is_run_once = matches!(period, Period::RunOnce(_));
			if is_run_once {
				let mut entries = inner.entries.lock().unwrap();
				if matches!(entries.get(&key), Some(current) if Arc::ptr_eq(current, &entry)) {
					entries.remove(&key);
				}
			}

			entry.running_callback.store(true, Ordering::SeqCst);
			let result = (entry.action)().await;
			entry.running_callback.store(false, Ordering::SeqCst);
			match result {
				Ok(()) => {}
				Err(error) => {
					tracing::warn!(%error, "scheduled entity action failed, unscheduling");
					inner.entries.lock().unwrap().remove(&key);
					return;
				}
			}

			if is_run_once {
				return;
			}

			version = entry.version.load(Ordering::SeqCst);
		}
	});
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use tokio::time::advance;

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn run_once_fires_exactly_once_then_unschedules() {
		let scheduler: EntityActionScheduler<&'static str> = EntityActionScheduler::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let c = calls.clone();
		scheduler.schedule("a", Period::RunOnce(Duration::from_millis(100)), move || {
			let c = c.clone();
			async move {
				c.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		});
		scheduler.start();

		advance(Duration::from_millis(150)).await;
		tokio::task::yield_now().await;
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(!scheduler.is_scheduled(&"a"));

		advance(Duration::from_secs(10)).await;
		tokio::task::yield_now().await;
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn infinite_period_keeps_firing() {
		let scheduler: EntityActionScheduler<&'static str> = EntityActionScheduler::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let c = calls.clone();
		scheduler.schedule("a", Period::Infinite(Duration::from_millis(50)), move || {
			let c = c.clone();
			async move {
				c.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		});
		scheduler.start();

		for _ in 0..3 {
			advance(Duration::from_millis(50)).await;
			tokio::task::yield_now().await;
		}
		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert!(scheduler.is_scheduled(&"a"));
	}

	#[tokio::test(start_paused = true)]
	async fn change_period_before_start_uses_new_period() {
		let scheduler: EntityActionScheduler<&'static str> = EntityActionScheduler::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let c = calls.clone();
		scheduler.schedule("a", Period::Infinite(Duration::from_secs(10)), move || {
			let c = c.clone();
			async move {
				c.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		});
		scheduler.change_period(&"a", Period::Infinite(Duration::from_millis(50)));
		scheduler.start();

		advance(Duration::from_millis(60)).await;
		tokio::task::yield_now().await;
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn change_period_during_in_flight_callback_does_not_double_invoke() {
		let scheduler: EntityActionScheduler<&'static str> = EntityActionScheduler::new();
		let concurrent = Arc::new(AtomicUsize::new(0));
		let max_concurrent = Arc::new(AtomicUsize::new(0));
		let total_calls = Arc::new(AtomicUsize::new(0));
		let (conc, max_conc, total) = (concurrent.clone(), max_concurrent.clone(), total_calls.clone());
		scheduler.schedule("a", Period::Infinite(Duration::from_millis(50)), move || {
			let (conc, max_conc, total) = (conc.clone(), max_conc.clone(), total.clone());
			async move {
				let now = conc.fetch_add(1, Ordering::SeqCst) + 1;
				max_conc.fetch_max(now, Ordering::SeqCst);
				total.fetch_add(1, Ordering::SeqCst);
				// Simulate a callback still running when `change_period` is called.
				tokio::time::sleep(Duration::from_millis(20)).await;
				conc.fetch_sub(1, Ordering::SeqCst);
				Ok(())
			}
		});
		scheduler.start();

		advance(Duration::from_millis(50)).await;
		tokio::task::yield_now().await;
		// The action is now in flight (inside its own 20ms sleep). A
		// `change_period` call here must not spawn a second timer that also
		// invokes the action concurrently.
		scheduler.change_period(&"a", Period::Infinite(Duration::from_millis(30)));
		advance(Duration::from_millis(20)).await;
		tokio::task::yield_now().await;

		advance(Duration::from_millis(30)).await;
		tokio::task::yield_now().await;

		assert_eq!(max_concurrent.load(Ordering::SeqCst), 1, "entity action ran concurrently with itself");
		assert_eq!(total_calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn unschedule_stops_future_firings() {
		let scheduler: EntityActionScheduler<&'static str> = EntityActionScheduler::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let c = calls.clone();
		scheduler.schedule("a", Period::Infinite(Duration::from_millis(50)), move || {
			let c = c.clone();
			async move {
				c.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		});
		scheduler.start();
		advance(Duration::from_millis(50)).await;
		tokio::task::yield_now().await;
		scheduler.unschedule(&"a");
		advance(Duration::from_secs(5)).await;
		tokio::task::yield_now().await;
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn failing_action_evicts_only_that_entity() {
		let scheduler: EntityActionScheduler<&'static str> = EntityActionScheduler::new();
		let good_calls = Arc::new(AtomicUsize::new(0));
		let gc = good_calls.clone();
		scheduler.schedule("good", Period::Infinite(Duration::from_millis(50)), move || {
			let gc = gc.clone();
			async move {
				gc.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		});
		scheduler.schedule("bad", Period::Infinite(Duration::from_millis(50)), || async {
			anyhow::bail!("boom")
		});
		scheduler.start();

		advance(Duration::from_millis(60)).await;
		tokio::task::yield_now().await;
		assert!(!scheduler.is_scheduled(&"bad"));
		assert!(scheduler.is_scheduled(&"good"));
		assert_eq!(good_calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn schedule_rejects_duplicate_key_keeping_original_period() {
		let scheduler: EntityActionScheduler<&'static str> = EntityActionScheduler::new();
		let calls = Arc::new(AtomicUsize::new(0));
		let c = calls.clone();
		scheduler.schedule("a", Period::Infinite(Duration::from_millis(50)), move || {
			let c = c.clone();
			async move {
				c.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}
		});
		// Second registration for the same key must be a no-op: a much
		// shorter period here should never take effect.
		scheduler.schedule("a", Period::Infinite(Duration::from_millis(1)), || async { Ok(()) });
		scheduler.start();

		advance(Duration::from_millis(50)).await;
		tokio::task::yield_now().await;
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn run_once_entry_is_unscheduled_before_its_action_runs() {
		let scheduler: EntityActionScheduler<&'static str> = EntityActionScheduler::new();
		let observed = Arc::new(std::sync::Mutex::new(None));
		let o = observed.clone();
		let scheduler_for_action = scheduler.clone();
		scheduler.schedule("a", Period::RunOnce(Duration::from_millis(10)), move || {
			let o = o.clone();
			let scheduler_for_action = scheduler_for_action.clone();
			async move {
				*o.lock().unwrap() = Some(scheduler_for_action.is_scheduled(&"a"));
				Ok(())
			}
		});
		scheduler.start();

		advance(Duration::from_millis(20)).await;
		tokio::task::yield_now().await;
		assert_eq!(*observed.lock().unwrap(), Some(false));
	}
}
