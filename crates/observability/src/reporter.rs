//! Operation reporting.
//!
//! The marketplace service receives a reporter at construction instead of
//! touching process-wide counters. Exporters (Prometheus, StatsD, ...) live
//! outside this workspace and implement [`OperationReporter`].

use std::sync::Arc;
use std::time::Duration;

/// Observer of marketplace operations.
///
/// All methods default to no-ops so implementations only override what they
/// export. Implementations must be cheap: they are called on the request path,
/// after the transaction has finished.
pub trait OperationReporter: Send + Sync {
    /// A new item was listed.
    fn item_listed(&self) {}

    /// An order committed with `lines` purchased lines.
    fn purchases_recorded(&self, _lines: usize) {}

    /// Wall time an operation spent inside its transaction scope (including
    /// waiting for the scope to be granted).
    fn transaction_latency(&self, _operation: &'static str, _elapsed: Duration) {}

    /// An operation failed with the given error kind.
    fn operation_failed(&self, _operation: &'static str, _kind: &'static str) {}
}

impl<R> OperationReporter for Arc<R>
where
    R: OperationReporter + ?Sized,
{
    fn item_listed(&self) {
        (**self).item_listed()
    }

    fn purchases_recorded(&self, lines: usize) {
        (**self).purchases_recorded(lines)
    }

    fn transaction_latency(&self, operation: &'static str, elapsed: Duration) {
        (**self).transaction_latency(operation, elapsed)
    }

    fn operation_failed(&self, operation: &'static str, kind: &'static str) {
        (**self).operation_failed(operation, kind)
    }
}

/// Reporter that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl OperationReporter for NoopReporter {}

/// Reporter that emits structured tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl OperationReporter for TracingReporter {
    fn item_listed(&self) {
        ::tracing::info!(metric = "items_listed", "item listed");
    }

    fn purchases_recorded(&self, lines: usize) {
        ::tracing::info!(metric = "purchases", lines, "order committed");
    }

    fn transaction_latency(&self, operation: &'static str, elapsed: Duration) {
        ::tracing::debug!(
            metric = "transaction_latency_seconds",
            operation,
            seconds = elapsed.as_secs_f64(),
            "transaction finished"
        );
    }

    fn operation_failed(&self, operation: &'static str, kind: &'static str) {
        ::tracing::warn!(metric = "operation_failures", operation, kind, "operation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counting {
        purchases: Mutex<usize>,
    }

    impl OperationReporter for Counting {
        fn purchases_recorded(&self, lines: usize) {
            *self.purchases.lock().unwrap() += lines;
        }
    }

    #[test]
    fn arc_forwards_to_inner_reporter() {
        let inner = Arc::new(Counting::default());
        let shared: Arc<dyn OperationReporter> = inner.clone();
        shared.purchases_recorded(2);
        shared.purchases_recorded(3);
        shared.item_listed();
        assert_eq!(*inner.purchases.lock().unwrap(), 5);
    }
}
