use std::sync::{Arc, Weak};

use rquickjs::object::Property;
use rquickjs::{Context, Ctx, Object, Runtime, Value};
use tracing::{Level, instrument};

use super::globals::{self, stdout_print};
use super::modules::HostModuleLoader;
use super::{
    ConstructOptions, ContextInner, ContextSettings, ContextShared, ContextStatistics,
    DEFAULT_OBJECT_NAME, ExecutionFlags, TeardownReport, VariableSlot,
};
use crate::bridge::convert::{check_string, validate};
use crate::bridge::{Bridge, CacheSizes};
use crate::error::{Error, Result};
use crate::host_object::HostObject;
use crate::script::ScriptResource;
use crate::snapshot::{self, SnapshotBlob};
use crate::value::{HostFunction, HostValue};
use crate::watchdog::Limits;
use crate::watchdog::signals::CountingAllocator;

/// The engine instance of a context and the bridge state tied to it.
///
/// Fields are released in a fixed order by [`Engine::teardown`]: bridge caches, then the
/// context, then the runtime, then the snapshot.
pub(crate) struct Engine {
    context: Option<Context>,
    runtime: Option<Runtime>,
    bridge: Bridge,
    object_name: String,
    max_stack_size: usize,
    snapshot: Option<SnapshotBlob>,
    torn_down: bool,
}

// SAFETY: the engine and the `Rc` based bridge state are only reached through the context's
// engine mutex, so at most one thread touches them at a time. Nothing engine side escapes the
// lock: host callbacks get a borrowed `CallScope`, and handles held outside the lock only queue
// releases through a thread safe queue.
unsafe impl Send for Engine {}

impl Engine {
    #[instrument(err(Debug), skip_all, level = Level::DEBUG)]
    pub(crate) fn create(
        shared: Arc<ContextShared>,
        owner: Weak<ContextInner>,
        host: Option<Arc<dyn HostObject>>,
        settings: &ContextSettings,
        options: ConstructOptions,
    ) -> Result<Self> {
        let max = shared.max_string_length();
        let object_name = options
            .object_name
            .unwrap_or_else(|| DEFAULT_OBJECT_NAME.to_string());
        check_string(&object_name, max, "Exported object name")?;
        let snapshot = match options.snapshot {
            Some(blob) => {
                let image = snapshot::decode(&blob, max)?;
                Some((blob, image))
            }
            None => None,
        };
        for (name, value) in &options.variables {
            check_string(name, max, "Variable name")?;
            validate(value, max, shared.id)?;
        }

        let runtime = Runtime::new_with_alloc(CountingAllocator::new(shared.signals.clone()))?;
        runtime.set_max_stack_size(settings.max_stack_size);
        let signals = shared.signals.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || signals.should_interrupt())));
        let loader = HostModuleLoader::new(shared.clone());
        runtime.set_loader(loader.clone(), loader);
        let context = Context::full(&runtime)?;

        let mut engine = Self {
            context: Some(context),
            runtime: Some(runtime),
            bridge: Bridge::new(shared, owner),
            object_name,
            max_stack_size: settings.max_stack_size,
            snapshot: None,
            torn_down: false,
        };

        let bridge = engine.bridge.clone();
        let print = settings.print.clone().unwrap_or_else(stdout_print);
        let object_name = engine.object_name.clone();
        let image = snapshot.as_ref().map(|(_, image)| image);
        engine.context()?.with(|ctx| -> Result<()> {
            bridge.install(&ctx)?;
            if let Some(image) = image {
                snapshot::replay(&ctx, image)?;
            }
            globals::setup(&ctx, &bridge, print)?;

            let root = match host {
                Some(object) => bridge.create_wrapper(&ctx, object, true, None)?,
                None => Object::new(ctx.clone())?,
            };
            for (name, value) in options.variables {
                let slot = VariableSlot::new(value);
                bridge.define_variable(&ctx, &root, &name, slot.clone())?;
                bridge.track_accessor(&name, slot);
            }
            ctx.globals().prop(
                object_name.as_str(),
                Property::from(root).configurable().enumerable(),
            )?;
            Ok(())
        })?;
        engine.snapshot = snapshot.map(|(blob, _)| blob);

        tracing::debug!(
            context = %engine.bridge.shared.id,
            object = engine.object_name,
            "Constructed execution context"
        );
        Ok(engine)
    }

    fn context(&self) -> Result<&Context> {
        self.context.as_ref().ok_or(Error::Disposed)
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or(Error::Disposed)
    }

    // The engine measures stack use from the thread that set the limit, re-anchor it to the
    // calling thread before every entry.
    fn anchor_stack(&self) -> Result<()> {
        self.runtime()?.set_max_stack_size(self.max_stack_size);
        Ok(())
    }

    pub(crate) fn compile(&self, source: &str, identifier: &str) -> Result<ScriptResource> {
        self.anchor_stack()?;
        let bridge = self.bridge.clone();
        self.context()?
            .with(|ctx| bridge.compile(&ctx, source, identifier))
    }

    /// Run one top level execution under `limits`.
    pub(crate) fn run<F>(&self, flags: ExecutionFlags, limits: Limits, run: F) -> Result<HostValue>
    where
        F: for<'js> FnOnce(&Ctx<'js>, &Bridge) -> Result<Value<'js>>,
    {
        let shared = self.bridge.shared.clone();
        let registration = shared
            .watchdog
            .register(shared.id, shared.signals.clone(), limits);
        self.anchor_stack()?;

        let bridge = self.bridge.clone();
        let outcome = self
            .context()?
            .with(|ctx| bridge.run_in_scope(&ctx, flags, |ctx| run(ctx, &bridge)));

        drop(registration);
        shared.signals.reset();
        outcome.into_result()
    }

    pub(crate) fn register_function(&self, name: &str, function: &HostFunction) -> Result<()> {
        check_string(name, self.bridge.shared.max_string_length(), "Function name")?;
        let bridge = self.bridge.clone();
        self.context()?
            .with(|ctx| bridge.register_function(&ctx, name, function))
    }

    pub(crate) fn variable(&self, name: &str) -> Option<VariableSlot> {
        self.bridge.variable(name)
    }

    pub(crate) fn collect_garbage(&self) -> Result<()> {
        self.runtime()?.run_gc();
        let bridge = self.bridge.clone();
        let released = self.context()?.with(|_| bridge.drain_releases());
        tracing::debug!(released, "Collected garbage");
        Ok(())
    }

    pub(crate) fn statistics(&self) -> Result<ContextStatistics> {
        let bridge = self.bridge.clone();
        self.context()?.with(|_| bridge.drain_releases());
        let sizes = self.bridge.cache_sizes();
        let shared = &self.bridge.shared;
        Ok(ContextStatistics {
            heap_used: shared.signals.heap_used(),
            external_memory: shared.external_memory(),
            call_wrappers: sizes.calls,
            method_wrappers: sizes.methods,
            templates: sizes.templates,
            exported_objects: sizes.objects,
            exported_closures: sizes.closures,
            scripts: sizes.scripts,
            guest_objects: sizes.guests,
            modules: sizes.modules,
        })
    }

    /// Release everything in dependency order. Runs once, later calls return an empty report.
    pub(crate) fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.torn_down {
            return report;
        }
        self.torn_down = true;
        let id = self.bridge.shared.id;

        match &self.context {
            Some(context) => {
                let bridge = self.bridge.clone();
                let name = self.object_name.clone();
                let (released, issue) = context.with(|ctx| {
                    bridge.drain_releases();
                    let issue = match bridge.remove_global(&ctx, &name) {
                        Ok(true) => None,
                        Ok(false) => Some(format!("exported object '{name}' could not be detached")),
                        Err(e) => Some(format!("detaching exported object '{name}': {e}")),
                    };
                    (bridge.release_all(), issue)
                });
                report.released = released;
                report.issues.extend(issue);
            }
            None => report.issues.push("engine context was already released".to_string()),
        }

        // entries named by queued releases are gone
        self.bridge.shared.releases.take();
        drop(self.context.take());
        drop(self.runtime.take());
        // finalizers of wrappers collected with the engine
        self.bridge.shared.releases.take();

        if self.bridge.cache_sizes() != CacheSizes::default() {
            report
                .issues
                .push(format!("bridge caches not empty after teardown: {:?}", self.bridge.cache_sizes()));
        }
        if let Some(snapshot) = self.snapshot.take() {
            tracing::debug!(bytes = snapshot.len(), "Released snapshot");
        }

        for issue in &report.issues {
            tracing::error!(context = %id, "Teardown issue: {issue}");
        }
        tracing::debug!(context = %id, released = report.released.total(), "Tore down execution context");
        report
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}
