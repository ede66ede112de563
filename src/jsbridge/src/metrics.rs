/*!
This module contains the definitions and implementations of the metrics emitted by execution contexts
*/

use tracing::{Level, instrument};

// Gauges, active execution contexts
static METRIC_ACTIVE_EXECUTION_CONTEXTS: &str = "active_execution_contexts";

// Counters, total execution contexts created during lifetime of the process
static METRIC_TOTAL_EXECUTION_CONTEXTS: &str = "execution_contexts_total";

// Counters, compilations and executions
pub(crate) static METRIC_SCRIPT_COMPILATIONS: &str = "script_compilations_total";
pub(crate) static METRIC_SCRIPT_EXECUTIONS: &str = "script_executions_total";
pub(crate) static METRIC_CONTEXT_MISMATCHES: &str = "context_mismatches_total";

// Counters, watchdog terminations
pub(crate) static METRIC_WATCHDOG_TERMINATIONS: &str = "watchdog_terminations_total";
pub(crate) static METRIC_LIMIT_TYPE_LABEL: &str = "limit_type";

// Histogram, execution duration
#[cfg(feature = "function_call_metrics")]
static METRIC_SCRIPT_EXECUTION_DURATION: &str = "script_execution_duration_micros";
#[cfg(feature = "function_call_metrics")]
static METRIC_SCRIPT_NAME: &str = "script_name";

/// Tracks the number of live execution contexts.
pub(crate) struct ContextMetricsGuard(());

impl ContextMetricsGuard {
    #[instrument(skip_all, level=Level::DEBUG)]
    pub(crate) fn new() -> Self {
        metrics::gauge!(METRIC_ACTIVE_EXECUTION_CONTEXTS).increment(1);
        metrics::counter!(METRIC_TOTAL_EXECUTION_CONTEXTS).increment(1);
        Self(())
    }
}

impl Drop for ContextMetricsGuard {
    #[instrument(skip_all, level=Level::DEBUG)]
    fn drop(&mut self) {
        metrics::gauge!(METRIC_ACTIVE_EXECUTION_CONTEXTS).decrement(1);
    }
}

#[cfg(feature = "function_call_metrics")]
pub(crate) struct ExecutionMetricGuard<'a> {
    script_name: &'a str,
    start: std::time::Instant,
}

#[cfg(feature = "function_call_metrics")]
impl<'a> ExecutionMetricGuard<'a> {
    #[instrument(skip_all, level=Level::DEBUG)]
    pub(crate) fn new(script_name: &'a str) -> Self {
        metrics::counter!(METRIC_SCRIPT_EXECUTIONS).increment(1);
        Self {
            script_name,
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "function_call_metrics")]
impl Drop for ExecutionMetricGuard<'_> {
    #[instrument(skip_all, level=Level::DEBUG)]
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let script_name = self.script_name.to_string();
        metrics::histogram!(METRIC_SCRIPT_EXECUTION_DURATION, METRIC_SCRIPT_NAME => script_name)
            .record(duration.as_micros() as f64);
    }
}

#[cfg(not(feature = "function_call_metrics"))]
pub(crate) struct ExecutionMetricGuard;

#[cfg(not(feature = "function_call_metrics"))]
impl ExecutionMetricGuard {
    pub(crate) fn new(_script_name: &str) -> Self {
        metrics::counter!(METRIC_SCRIPT_EXECUTIONS).increment(1);
        Self
    }
}

#[cfg(test)]
mod tests {
    use crate::{ContextBuilder, ExecuteOptions, ExecutionContext};

    #[test]
    #[ignore = "Needs to run separately to not get influenced by other tests"]
    fn test_metrics() {
        let recorder = metrics_util::debugging::DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder.install().unwrap();

        let snapshot = {
            let context = ContextBuilder::new().build().unwrap();
            let other = ExecutionContext::builder().build().unwrap();

            let script = context.compile("1 + 1", Some("add")).unwrap();
            let result = context.execute(&script, ExecuteOptions::default());
            assert!(result.is_ok());

            // a foreign script is a mismatch, not an error
            let result = other.execute(&script, ExecuteOptions::default());
            assert!(result.is_ok());

            snapshotter.snapshot()
        };
        let snapshot = snapshot.into_vec();
        println!("Metrics snapshot: {:#?}", snapshot);
        if cfg!(feature = "function_call_metrics") {
            assert_eq!(snapshot.len(), 6);
        } else {
            assert_eq!(snapshot.len(), 5);
        }
    }
}
