//! Metrics sink boundary.
//!
//! Pipeline logic MUST NOT depend on obs::metrics directly.
//! All instrumentation flows through MetricsEvent and MetricsSink.
//!
//! This module is the only allowed bridge between execution logic
//! and the global metrics state.

use crate::{metadata::TableId, obs::metrics};
use std::cell::RefCell;

thread_local! {
    static SINK_OVERRIDE: RefCell<Option<*const dyn MetricsSink>> = RefCell::new(None);
}

///
/// OpKind
///

#[derive(Clone, Copy, Debug)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

///
/// MetricsEvent
///

#[derive(Clone, Copy, Debug)]
pub enum MetricsEvent {
    SessionStart,
    SessionFinish {
        committed: bool,
    },
    CommandExecuted {
        table: Option<TableId>,
        kind: OpKind,
        rows_affected: u64,
    },
    CommandSkipped,
    ConcurrencyConflict,
    ValuesPropagated {
        count: u64,
    },
}

///
/// MetricsSink
///

pub trait MetricsSink {
    fn record(&self, event: MetricsEvent);
}

/// GlobalMetricsSink
/// Default process-local sink that writes into global metrics state.
/// Acts as the concrete sink when no scoped override is installed.

pub(crate) struct GlobalMetricsSink;

impl MetricsSink for GlobalMetricsSink {
    fn record(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::SessionStart => {
                metrics::with_state_mut(|m| {
                    m.ops.sessions_started = m.ops.sessions_started.saturating_add(1);
                });
            }

            MetricsEvent::SessionFinish { committed } => {
                metrics::with_state_mut(|m| {
                    if committed {
                        m.ops.sessions_committed = m.ops.sessions_committed.saturating_add(1);
                    } else {
                        m.ops.sessions_failed = m.ops.sessions_failed.saturating_add(1);
                    }
                });
            }

            MetricsEvent::CommandExecuted {
                table,
                kind,
                rows_affected,
            } => {
                metrics::with_state_mut(|m| {
                    m.ops.commands_executed = m.ops.commands_executed.saturating_add(1);
                    m.ops.rows_affected = m.ops.rows_affected.saturating_add(rows_affected);

                    if let Some(table) = table {
                        let entry = m.tables.entry(table).or_default();
                        match kind {
                            OpKind::Insert => entry.inserts = entry.inserts.saturating_add(1),
                            OpKind::Update => entry.updates = entry.updates.saturating_add(1),
                            OpKind::Delete => entry.deletes = entry.deletes.saturating_add(1),
                        }
                        entry.rows_affected = entry.rows_affected.saturating_add(rows_affected);
                    }
                });
            }

            MetricsEvent::CommandSkipped => {
                metrics::with_state_mut(|m| {
                    m.ops.commands_skipped = m.ops.commands_skipped.saturating_add(1);
                });
            }

            MetricsEvent::ConcurrencyConflict => {
                metrics::with_state_mut(|m| {
                    m.ops.concurrency_conflicts = m.ops.concurrency_conflicts.saturating_add(1);
                });
            }

            MetricsEvent::ValuesPropagated { count } => {
                metrics::with_state_mut(|m| {
                    m.ops.values_propagated = m.ops.values_propagated.saturating_add(count);
                });
            }
        }
    }
}

pub(crate) const GLOBAL_METRICS_SINK: GlobalMetricsSink = GlobalMetricsSink;

pub(crate) fn record(event: MetricsEvent) {
    let override_ptr = SINK_OVERRIDE.with(|cell| *cell.borrow());
    if let Some(ptr) = override_ptr {
        // SAFETY:
        // Preconditions:
        // - `ptr` was produced from a valid `&dyn MetricsSink` in `with_metrics_sink`.
        // - `with_metrics_sink` always restores the previous pointer before returning,
        //   including unwind paths via `Guard::drop`.
        // - `record` is synchronous and never stores `ptr` beyond this call.
        //
        // Aliasing:
        // - We materialize only a shared reference (`&dyn MetricsSink`), matching the
        //   original shared borrow used to install the override.
        // - No mutable alias to the same sink is created here.
        //
        // What would break this:
        // - If `with_metrics_sink` failed to restore on all exits (normal + panic),
        //   `ptr` could outlive the borrowed sink and become dangling.
        // - If `record` were changed to store or dispatch asynchronously using `ptr`,
        //   lifetime assumptions would no longer hold.
        unsafe { (&*ptr).record(event) };
    } else {
        GLOBAL_METRICS_SINK.record(event);
    }
}

/// Snapshot the current metrics state for endpoint/test plumbing.
#[must_use]
pub fn metrics_report() -> metrics::EventState {
    metrics::report()
}

/// Reset all metrics state.
pub fn metrics_reset_all() {
    metrics::reset_all();
}

/// Run a closure with a temporary metrics sink override.
pub(crate) fn with_metrics_sink<T>(sink: &dyn MetricsSink, f: impl FnOnce() -> T) -> T {
    struct Guard(Option<*const dyn MetricsSink>);

    impl Drop for Guard {
        fn drop(&mut self) {
            SINK_OVERRIDE.with(|cell| {
                *cell.borrow_mut() = self.0;
            });
        }
    }

    // SAFETY:
    // Preconditions:
    // - `sink_ptr` is installed only for this dynamic scope.
    // - `Guard` always restores the previous slot on all exits, including panic.
    // - `record` only dereferences synchronously and never persists `sink_ptr`.
    //
    // Aliasing:
    // - We erase lifetime to a raw pointer, but still only expose shared access.
    // - No mutable alias to the same sink is introduced by this conversion.
    //
    // What would break this:
    // - Any async/deferred use of `sink_ptr` beyond this scope.
    // - Any path that bypasses Guard restoration.
    let sink_ptr = unsafe { std::mem::transmute::<&dyn MetricsSink, *const dyn MetricsSink>(sink) };
    let prev = SINK_OVERRIDE.with(|cell| {
        let mut slot = cell.borrow_mut();
        slot.replace(sink_ptr)
    });
    let _guard = Guard(prev);

    f()
}
