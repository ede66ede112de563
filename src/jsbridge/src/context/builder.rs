use std::sync::Arc;
use std::time::Duration;

use tracing::{Level, instrument};

use super::{ConstructOptions, ContextSettings, ExecutionContext};
use crate::error::Result;
use crate::host_object::HostObject;
use crate::snapshot::SnapshotBlob;
use crate::value::HostValue;
use crate::watchdog::Watchdog;

/// A builder for a constructed [`ExecutionContext`]
pub struct ContextBuilder {
    settings: ContextSettings,
    host: Option<Arc<dyn HostObject>>,
    options: ConstructOptions,
}

const MIN_STACK_SIZE: usize = 256 * 1024;

impl ContextBuilder {
    /// Create a new ContextBuilder
    pub fn new() -> Self {
        Self {
            settings: ContextSettings::default(),
            host: None,
            options: ConstructOptions::default(),
        }
    }

    /// Set the global name of the exported object
    pub fn with_object_name(mut self, name: impl Into<String>) -> Self {
        self.options.object_name = Some(name.into());
        self
    }

    /// Set the host object whose properties and methods are exported to the guest
    pub fn with_host_object(mut self, object: Arc<dyn HostObject>) -> Self {
        self.host = Some(object);
        self
    }

    /// Add a read-only variable to the exported object
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.options.variables.push((name.into(), value.into()));
        self
    }

    /// Seed the engine from a snapshot
    pub fn with_snapshot(mut self, snapshot: SnapshotBlob) -> Self {
        self.options.snapshot = Some(snapshot);
        self
    }

    /// Set the default wall-clock limit of every execution
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.settings.time_limit = limit;
        self
    }

    /// Set the default heap limit of every execution, in bytes
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.settings.memory_limit = bytes;
        self
    }

    /// Set the bytes charged to external memory for every host wrapper the guest holds
    pub fn with_average_object_size(mut self, bytes: usize) -> Self {
        self.settings.average_object_size = bytes;
        self
    }

    /// Set the longest string accepted in either direction.
    /// Values above the engine's own limit are clamped to it.
    pub fn with_max_string_length(mut self, len: usize) -> Self {
        self.settings.max_string_length = len;
        self
    }

    /// Set the engine stack limit.
    /// Deep recursion in guest code fails with a `RangeError` once the limit is reached.
    /// Values below 256KiB are ignored.
    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        if bytes >= MIN_STACK_SIZE {
            self.settings.max_stack_size = bytes;
        }
        self
    }

    /// Enforce limits with `watchdog` instead of the process-wide one
    pub fn with_watchdog(mut self, watchdog: Arc<Watchdog>) -> Self {
        self.settings.watchdog = Some(watchdog);
        self
    }

    /// Set the function receiving guest `print` and `console.log` output
    pub fn with_print_fn(mut self, print: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.settings.print = Some(Arc::new(print));
        self
    }

    /// Set the function resolving module identifiers
    pub fn with_module_normaliser(
        mut self,
        normaliser: impl Fn(&str, &str) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.settings.module_normaliser = Some(Arc::new(normaliser));
        self
    }

    /// Set the function loading module source
    pub fn with_module_loader(
        mut self,
        loader: impl Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.settings.module_loader = Some(Arc::new(loader));
        self
    }

    /// Get the current settings
    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Build and construct the ExecutionContext
    #[instrument(err(Debug), skip_all, level = Level::INFO)]
    pub fn build(self) -> Result<ExecutionContext> {
        let context = ExecutionContext::new(self.host, self.settings);
        context.construct(self.options)?;
        Ok(context)
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_stacks_are_ignored() {
        let builder = ContextBuilder::new().with_max_stack_size(1024);
        assert_eq!(
            builder.settings().max_stack_size,
            ContextSettings::default().max_stack_size
        );
        let builder = builder.with_max_stack_size(4 * 1024 * 1024);
        assert_eq!(builder.settings().max_stack_size, 4 * 1024 * 1024);
    }

    #[test]
    fn limits_are_recorded() {
        let builder = ContextBuilder::new()
            .with_time_limit(Duration::from_millis(20))
            .with_memory_limit(1 << 20)
            .with_average_object_size(64);
        assert_eq!(builder.settings().time_limit, Duration::from_millis(20));
        assert_eq!(builder.settings().memory_limit, 1 << 20);
        assert_eq!(builder.settings().average_object_size, 64);
    }
}
