/*!
The execution context: one embedded engine instance, the exported host object, and the limits
the watchdog enforces on its executions.
*/

pub(crate) mod builder;
mod engine;
pub(crate) mod globals;
pub(crate) mod modules;
mod scope;

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Level, instrument};

pub use self::scope::CallScope;
use self::builder::ContextBuilder;
use self::engine::Engine;
use self::globals::PrintFn;
use self::modules::{ModuleHooks, ModuleLoaderFn, ModuleNormaliserFn};
use crate::error::{Error, Result};
use crate::guest_object::{GuestObject, GuestOp};
use crate::handle_cache::ReleaseQueue;
use crate::host_object::HostObject;
use crate::metrics::{ContextMetricsGuard, ExecutionMetricGuard, METRIC_CONTEXT_MISMATCHES};
use crate::script::ScriptResource;
use crate::snapshot::{self, SnapshotBlob};
use crate::value::{HostFunction, HostValue};
use crate::watchdog::signals::EngineSignals;
use crate::watchdog::{Limits, Watchdog};

/// The longest string the engine can hold, and the default string ceiling of a context.
pub const MAX_STRING_LENGTH: usize = (1 << 30) - 1;

/// The identifier scripts are compiled under when none is given.
pub const DEFAULT_SCRIPT_IDENTIFIER: &str = "<script>";

/// The global name of the exported object when none is given.
pub const DEFAULT_OBJECT_NAME: &str = "Host";

const DEFAULT_AVERAGE_OBJECT_SIZE: usize = 1024;
const DEFAULT_MAX_STACK_SIZE: usize = 1024 * 1024;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an execution context for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value of the identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context-{}", self.0)
    }
}

/// Flags controlling a single execution. Flags combine with `|`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ExecutionFlags(u8);

impl ExecutionFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Return guest objects as host arrays of their values instead of maps.
    pub const FORCE_ARRAY: Self = Self(1);
    /// Errors raised by host callbacks unwind to the host caller instead of becoming guest
    /// exceptions that guest code can catch.
    pub const PROPAGATE_HOST_EXCEPTIONS: Self = Self(1 << 1);

    /// Returns true if every flag in `other` is set.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The raw bits.
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Flags from raw bits, ignoring unknown bits.
    pub fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & (Self::FORCE_ARRAY.0 | Self::PROPAGATE_HOST_EXCEPTIONS.0))
    }
}

impl BitOr for ExecutionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Options for a single top level execution.
///
/// Explicit nonzero limits replace the context defaults for this execution only.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecuteOptions {
    /// Execution flags.
    pub flags: ExecutionFlags,
    /// Wall-clock limit for this execution.
    pub time_limit: Option<Duration>,
    /// Heap limit in bytes for this execution. Negative values are rejected.
    pub memory_limit: Option<i64>,
}

impl ExecuteOptions {
    /// Set the execution flags.
    pub fn with_flags(mut self, flags: ExecutionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the time limit for this execution.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Set the memory limit for this execution.
    pub fn with_memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }
}

/// A host owned value published to the guest as a read-only property of the exported object.
///
/// Setting the slot from the host is observed by the guest on its next read.
#[derive(Clone, Default)]
pub struct VariableSlot(Arc<Mutex<HostValue>>);

impl VariableSlot {
    pub(crate) fn new(value: HostValue) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    /// The current value.
    pub fn get(&self) -> HostValue {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the value.
    pub fn set(&self, value: impl Into<HostValue>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = value.into();
    }
}

impl fmt::Debug for VariableSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VariableSlot").field(&self.get()).finish()
    }
}

/// Settings fixed when a context is created.
#[derive(Clone)]
pub struct ContextSettings {
    /// The longest string, in bytes, accepted in either direction.
    pub max_string_length: usize,
    /// The engine stack limit in bytes.
    pub max_stack_size: usize,
    /// Default wall-clock limit per execution. Zero disables it.
    pub time_limit: Duration,
    /// Default heap limit per execution in bytes. Zero disables it.
    pub memory_limit: u64,
    /// Bytes charged to external memory for every host wrapper the guest holds.
    pub average_object_size: usize,
    /// The watchdog enforcing limits, the process-wide one if unset.
    pub watchdog: Option<Arc<Watchdog>>,
    /// Where guest `print` and `console.log` output goes, stdout if unset.
    pub print: Option<Arc<PrintFn>>,
    /// Resolves module identifiers, [`default_normalise`](modules::default_normalise) if unset.
    pub module_normaliser: Option<Arc<ModuleNormaliserFn>>,
    /// Loads module source by resolved identifier.
    pub module_loader: Option<Arc<ModuleLoaderFn>>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_string_length: MAX_STRING_LENGTH,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            time_limit: Duration::ZERO,
            memory_limit: 0,
            average_object_size: DEFAULT_AVERAGE_OBJECT_SIZE,
            watchdog: None,
            print: None,
            module_normaliser: None,
            module_loader: None,
        }
    }
}

impl fmt::Debug for ContextSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSettings")
            .field("max_string_length", &self.max_string_length)
            .field("max_stack_size", &self.max_stack_size)
            .field("time_limit", &self.time_limit)
            .field("memory_limit", &self.memory_limit)
            .field("average_object_size", &self.average_object_size)
            .field("watchdog", &self.watchdog)
            .finish_non_exhaustive()
    }
}

/// What [`ExecutionContext::construct`] installs.
#[derive(Clone, Debug, Default)]
pub struct ConstructOptions {
    /// Global name of the exported object, [`DEFAULT_OBJECT_NAME`] if unset.
    pub object_name: Option<String>,
    /// Read-only properties of the exported object.
    pub variables: Vec<(String, HostValue)>,
    /// A snapshot replayed before anything else is installed.
    pub snapshot: Option<SnapshotBlob>,
}

/// Engine and cache usage of a context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextStatistics {
    /// Bytes currently allocated by the engine.
    pub heap_used: usize,
    /// Bytes charged for host wrappers the guest holds.
    pub external_memory: usize,
    /// Registered global functions.
    pub call_wrappers: usize,
    /// Cached method functions.
    pub method_wrappers: usize,
    /// Cached per class templates.
    pub templates: usize,
    /// Live host object wrappers.
    pub exported_objects: usize,
    /// Live host closure wrappers.
    pub exported_closures: usize,
    /// Compiled scripts.
    pub scripts: usize,
    /// Guest objects held by host handles.
    pub guest_objects: usize,
    /// Loaded modules.
    pub modules: usize,
}

/// Number of entries released per cache during teardown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseCounts {
    /// Variable accessor slots.
    pub accessors: usize,
    /// Registered global functions.
    pub call_wrappers: usize,
    /// Method functions.
    pub method_wrappers: usize,
    /// Per class templates.
    pub templates: usize,
    /// Host object wrappers.
    pub exported_objects: usize,
    /// Host closure wrappers.
    pub exported_closures: usize,
    /// Compiled scripts.
    pub scripts: usize,
    /// Guest objects held by host handles.
    pub guest_objects: usize,
    /// Loaded modules.
    pub modules: usize,
}

impl ReleaseCounts {
    /// Total entries released.
    pub fn total(&self) -> usize {
        self.accessors
            + self.call_wrappers
            + self.method_wrappers
            + self.templates
            + self.exported_objects
            + self.exported_closures
            + self.scripts
            + self.guest_objects
            + self.modules
    }
}

/// The result of tearing down a context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// What was released.
    pub released: ReleaseCounts,
    /// Problems found during teardown. Every step runs regardless.
    pub issues: Vec<String>,
}

impl TeardownReport {
    /// Returns true if teardown found no problems.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

fn non_zero(limit: Duration) -> Option<Duration> {
    Some(limit).filter(|limit| !limit.is_zero())
}

fn check_memory_limit(bytes: i64) -> Result<u64> {
    u64::try_from(bytes).map_err(|_| {
        Error::InvalidArgument(format!("memory limit must not be negative, got {bytes}"))
    })
}

/// State shared between a context, its engine, and the host callbacks the engine calls.
///
/// Everything in here can be read and updated without holding the engine lock.
pub(crate) struct ContextShared {
    pub(crate) id: ContextId,
    pub(crate) signals: Arc<EngineSignals>,
    pub(crate) watchdog: Arc<Watchdog>,
    pub(crate) releases: ReleaseQueue,
    hooks: RwLock<ModuleHooks>,
    max_string_length: usize,
    time_limit_ns: AtomicU64,
    memory_limit: AtomicU64,
    average_object_size: AtomicUsize,
    external_memory: AtomicUsize,
    depth: AtomicUsize,
}

/// Marks one execution level of a context as running.
pub(crate) struct DepthGuard<'a>(&'a AtomicUsize);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ContextShared {
    fn new(settings: &ContextSettings) -> Self {
        let hooks = ModuleHooks {
            normaliser: settings.module_normaliser.clone(),
            loader: settings.module_loader.clone(),
        };
        Self {
            id: ContextId::next(),
            signals: EngineSignals::new(),
            watchdog: settings.watchdog.clone().unwrap_or_else(Watchdog::global),
            releases: ReleaseQueue::default(),
            hooks: RwLock::new(hooks),
            max_string_length: settings.max_string_length.min(MAX_STRING_LENGTH),
            time_limit_ns: AtomicU64::new(duration_ns(settings.time_limit)),
            memory_limit: AtomicU64::new(settings.memory_limit),
            average_object_size: AtomicUsize::new(settings.average_object_size),
            external_memory: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    pub(crate) fn max_string_length(&self) -> usize {
        self.max_string_length
    }

    /// Number of execution levels currently running.
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub(crate) fn in_execution(&self) -> bool {
        self.depth() > 0
    }

    pub(crate) fn enter(&self) -> DepthGuard<'_> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        DepthGuard(&self.depth)
    }

    /// Charge one wrapper to external memory, returning the bytes charged.
    pub(crate) fn charge_external(&self) -> usize {
        let charge = self.average_object_size.load(Ordering::Relaxed);
        self.external_memory.fetch_add(charge, Ordering::Relaxed);
        charge
    }

    pub(crate) fn uncharge_external(&self, bytes: usize) {
        let _ = self
            .external_memory
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub(crate) fn external_memory(&self) -> usize {
        self.external_memory.load(Ordering::Relaxed)
    }

    pub(crate) fn time_limit(&self) -> Duration {
        Duration::from_nanos(self.time_limit_ns.load(Ordering::Relaxed))
    }

    pub(crate) fn memory_limit(&self) -> u64 {
        self.memory_limit.load(Ordering::Relaxed)
    }

    /// Update the default time limit and the limit of the live execution, if there is one.
    pub(crate) fn set_time_limit(&self, limit: Duration) {
        self.time_limit_ns
            .store(duration_ns(limit), Ordering::Relaxed);
        let limit = non_zero(limit);
        if self.watchdog.update_time_limit(self.id, limit) && limit.is_some() {
            self.watchdog.ensure_running();
        }
    }

    /// Update the default memory limit and the limit of the live execution, if there is one.
    pub(crate) fn set_memory_limit(&self, bytes: i64) -> Result<()> {
        let bytes = check_memory_limit(bytes)?;
        self.memory_limit.store(bytes, Ordering::Relaxed);
        let limit = Some(bytes).filter(|bytes| *bytes > 0);
        if self.watchdog.update_memory_limit(self.id, limit) && limit.is_some() {
            self.watchdog.ensure_running();
        }
        Ok(())
    }

    pub(crate) fn set_average_object_size(&self, bytes: usize) {
        self.average_object_size.store(bytes, Ordering::Relaxed);
    }

    /// The limits of a top level execution: explicit nonzero limits win over the defaults.
    pub(crate) fn limits_for(&self, time: Option<Duration>, memory: Option<u64>) -> Limits {
        Limits {
            time: time
                .and_then(non_zero)
                .or_else(|| non_zero(self.time_limit())),
            memory: memory
                .filter(|bytes| *bytes > 0)
                .or_else(|| Some(self.memory_limit()).filter(|bytes| *bytes > 0)),
        }
    }

    pub(crate) fn module_hooks(&self) -> ModuleHooks {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_hooks(&self, update: impl FnOnce(&mut ModuleHooks)) {
        update(&mut self.hooks.write().unwrap_or_else(PoisonError::into_inner));
    }
}

fn duration_ns(limit: Duration) -> u64 {
    u64::try_from(limit.as_nanos()).unwrap_or(u64::MAX)
}

/// Executing a script that belongs to another context is not an error: it is reported and
/// answered with `false`.
pub(crate) fn context_mismatch(script: &ScriptResource, context: ContextId) -> HostValue {
    metrics::counter!(METRIC_CONTEXT_MISMATCHES).increment(1);
    tracing::warn!(
        script = script.identifier(),
        owner = ?script.owner(),
        %context,
        "Script resource belongs to a different execution context, ignoring"
    );
    HostValue::Bool(false)
}

enum EngineSlot {
    Unconstructed,
    Live(Box<Engine>),
    Disposed,
}

// Records which thread holds the engine lock, so re-entry from that thread fails instead of
// deadlocking.
struct HolderGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for HolderGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// Fields drop in order: the holder is cleared while the engine is still locked, so it never
// overwrites the next holder.
struct EngineLock<'a> {
    _holder: HolderGuard<'a>,
    slot: MutexGuard<'a, EngineSlot>,
}

impl EngineLock<'_> {
    fn engine(&mut self) -> Result<&mut Engine> {
        match &mut *self.slot {
            EngineSlot::Live(engine) => Ok(engine),
            EngineSlot::Unconstructed => Err(Error::NotConstructed),
            EngineSlot::Disposed => Err(Error::Disposed),
        }
    }
}

pub(crate) struct ContextInner {
    shared: Arc<ContextShared>,
    settings: ContextSettings,
    host: Option<Arc<dyn HostObject>>,
    engine: Mutex<EngineSlot>,
    holder: Mutex<Option<ThreadId>>,
    self_ref: Weak<ContextInner>,
    _metric_guard: ContextMetricsGuard,
}

impl ContextInner {
    fn lock(&self) -> Result<EngineLock<'_>> {
        let me = std::thread::current().id();
        if *self.holder.lock().unwrap_or_else(PoisonError::into_inner) == Some(me) {
            return Err(Error::Reentrant);
        }
        let slot = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = Some(me);
        Ok(EngineLock {
            _holder: HolderGuard(&self.holder),
            slot,
        })
    }

    fn with_engine<T>(&self, f: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        let mut lock = self.lock()?;
        f(lock.engine()?)
    }

    pub(crate) fn run_guest_op(&self, guest: &GuestObject, op: GuestOp<'_>) -> Result<HostValue> {
        if guest.context_id() != self.shared.id {
            return Err(Error::ContextMismatch);
        }
        let limits = self.shared.limits_for(None, None);
        self.with_engine(|engine| {
            engine.run(ExecutionFlags::NONE, limits, |ctx, bridge| {
                bridge.guest_op(ctx, guest, op)
            })
        })
    }
}

/// An embedded engine instance, with the host object it exports and the scripts it compiled.
///
/// A context is created with [`ExecutionContext::new`] (or a [`ContextBuilder`]) and becomes
/// usable once [`construct`](ExecutionContext::construct) has run. Calls from different threads
/// are serialized on the engine lock; limit updates do not take the lock and can be made from
/// any thread, including from host callbacks while an execution is running.
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Create a builder for a constructed context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Create an unconstructed context exporting `host` once constructed.
    pub fn new(host: Option<Arc<dyn HostObject>>, settings: ContextSettings) -> Self {
        let shared = Arc::new(ContextShared::new(&settings));
        let inner = Arc::new_cyclic(|self_ref| ContextInner {
            shared,
            settings,
            host,
            engine: Mutex::new(EngineSlot::Unconstructed),
            holder: Mutex::new(None),
            self_ref: self_ref.clone(),
            _metric_guard: ContextMetricsGuard::new(),
        });
        Self { inner }
    }

    /// The identifier of this context.
    pub fn id(&self) -> ContextId {
        self.inner.shared.id
    }

    /// The watchdog enforcing this context's limits.
    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.inner.shared.watchdog
    }

    /// Create the engine and install the exported object. Constructing twice is a no-op.
    #[instrument(err(Debug), skip_all, level = Level::INFO, fields(context = %self.id()))]
    pub fn construct(&self, options: ConstructOptions) -> Result<()> {
        let mut lock = self.inner.lock()?;
        match &*lock.slot {
            EngineSlot::Live(_) => {
                tracing::debug!("Execution context is already constructed");
                return Ok(());
            }
            EngineSlot::Disposed => return Err(Error::Disposed),
            EngineSlot::Unconstructed => {}
        }
        let engine = Engine::create(
            self.inner.shared.clone(),
            self.inner.self_ref.clone(),
            self.inner.host.clone(),
            &self.inner.settings,
            options,
        )?;
        *lock.slot = EngineSlot::Live(Box::new(engine));
        Ok(())
    }

    /// Returns true once the engine exists and until the context is disposed.
    pub fn is_constructed(&self) -> bool {
        match self.inner.lock() {
            Ok(lock) => matches!(&*lock.slot, EngineSlot::Live(_)),
            // the calling thread is executing in this context, so it is constructed
            Err(_) => true,
        }
    }

    /// Returns true while an execution of this context is running.
    pub fn in_execution(&self) -> bool {
        self.inner.shared.in_execution()
    }

    /// Compile `source` without running it.
    #[instrument(err(Debug), skip(self, source), level = Level::DEBUG)]
    pub fn compile(&self, source: &str, identifier: Option<&str>) -> Result<ScriptResource> {
        let identifier = identifier.unwrap_or(DEFAULT_SCRIPT_IDENTIFIER);
        self.inner
            .with_engine(|engine| engine.compile(source, identifier))
    }

    /// Run a compiled script and convert its completion value.
    ///
    /// A script compiled by another context is not run: the call logs a warning and returns
    /// `HostValue::Bool(false)`.
    #[instrument(err(Debug), skip_all, level = Level::INFO, fields(script = script.identifier()))]
    pub fn execute(&self, script: &ScriptResource, options: ExecuteOptions) -> Result<HostValue> {
        let memory_limit = options.memory_limit.map(check_memory_limit).transpose()?;
        if !script.is_owned_by(self.id()) {
            return Ok(context_mismatch(script, self.id()));
        }
        let _metric_guard = ExecutionMetricGuard::new(script.identifier());
        let limits = self.inner.shared.limits_for(options.time_limit, memory_limit);
        let id = script.id();
        self.inner.with_engine(|engine| {
            engine.run(options.flags, limits, |ctx, bridge| bridge.run_script(ctx, id))
        })
    }

    /// Compile and run `source`, releasing the compiled script afterwards.
    pub fn execute_string(
        &self,
        source: &str,
        identifier: Option<&str>,
        options: ExecuteOptions,
    ) -> Result<HostValue> {
        let script = self.compile(source, identifier)?;
        let result = self.execute(&script, options);
        script.dispose();
        result
    }

    /// Install `function` as a global guest function. Registering the same closure again
    /// installs the same guest function.
    #[instrument(err(Debug), skip(self, function), level = Level::DEBUG)]
    pub fn register_function(&self, name: &str, function: HostFunction) -> Result<()> {
        self.inner
            .with_engine(|engine| engine.register_function(name, &function))
    }

    /// The host handle to the variable `name` installed at construction.
    pub fn variable(&self, name: &str) -> Option<VariableSlot> {
        self.inner
            .with_engine(|engine| Ok(engine.variable(name)))
            .ok()
            .flatten()
    }

    /// Set the default time limit. Zero disables it.
    ///
    /// During an execution the running execution's deadline restarts from now.
    pub fn set_time_limit(&self, limit: Duration) {
        self.inner.shared.set_time_limit(limit);
    }

    /// The default time limit.
    pub fn time_limit(&self) -> Duration {
        self.inner.shared.time_limit()
    }

    /// Set the default memory limit in bytes. Zero disables it, negative values are rejected.
    pub fn set_memory_limit(&self, bytes: i64) -> Result<()> {
        self.inner.shared.set_memory_limit(bytes)
    }

    /// The default memory limit in bytes.
    pub fn memory_limit(&self) -> u64 {
        self.inner.shared.memory_limit()
    }

    /// Set the bytes charged to external memory per host wrapper.
    pub fn set_average_object_size(&self, bytes: usize) {
        self.inner.shared.set_average_object_size(bytes);
    }

    /// Set the function resolving module identifiers against the requiring module.
    pub fn set_module_normaliser(
        &self,
        normaliser: impl Fn(&str, &str) -> anyhow::Result<String> + Send + Sync + 'static,
    ) {
        let normaliser: Arc<ModuleNormaliserFn> = Arc::new(normaliser);
        self.inner
            .shared
            .update_hooks(|hooks| hooks.normaliser = Some(normaliser));
    }

    /// Set the function loading module source by resolved identifier.
    pub fn set_module_loader(
        &self,
        loader: impl Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    ) {
        let loader: Arc<ModuleLoaderFn> = Arc::new(loader);
        self.inner
            .shared
            .update_hooks(|hooks| hooks.loader = Some(loader));
    }

    /// Run the engine's collector and apply pending releases.
    pub fn collect_garbage(&self) -> Result<()> {
        self.inner.with_engine(|engine| engine.collect_garbage())
    }

    /// Engine and cache usage.
    pub fn statistics(&self) -> Result<ContextStatistics> {
        self.inner.with_engine(|engine| engine.statistics())
    }

    /// Tear the context down, releasing every guest reference and the engine.
    ///
    /// Later calls return an empty report. Fails with [`Error::Reentrant`] when called from
    /// inside an execution of this context.
    #[instrument(err(Debug), skip_all, level = Level::INFO, fields(context = %self.id()))]
    pub fn dispose(&self) -> Result<TeardownReport> {
        let mut lock = self.inner.lock()?;
        let slot = std::mem::replace(&mut *lock.slot, EngineSlot::Disposed);
        Ok(match slot {
            EngineSlot::Live(mut engine) => engine.teardown(),
            EngineSlot::Unconstructed | EngineSlot::Disposed => TeardownReport::default(),
        })
    }

    /// Run `source` in a throwaway engine and capture the result as a snapshot blob.
    ///
    /// Returns `None`, after logging a warning, if `source` is empty or fails to run.
    pub fn create_snapshot(source: &str) -> Option<SnapshotBlob> {
        snapshot::create(source)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id())
            .field("in_execution", &self.in_execution())
            .finish_non_exhaustive()
    }
}

impl Serialize for ExecutionContext {
    fn serialize<S: serde::Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom(Error::UnsupportedOperation(
            "execution contexts cannot be serialized".to_string(),
        )))
    }
}

impl<'de> Deserialize<'de> for ExecutionContext {
    fn deserialize<D: serde::Deserializer<'de>>(
        _deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Err(serde::de::Error::custom(Error::UnsupportedOperation(
            "execution contexts cannot be deserialized".to_string(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let flags = ExecutionFlags::FORCE_ARRAY | ExecutionFlags::PROPAGATE_HOST_EXCEPTIONS;
        assert!(flags.contains(ExecutionFlags::FORCE_ARRAY));
        assert!(flags.contains(ExecutionFlags::PROPAGATE_HOST_EXCEPTIONS));
        assert!(!ExecutionFlags::NONE.contains(ExecutionFlags::FORCE_ARRAY));
        assert_eq!(ExecutionFlags::from_bits_truncate(0xff), flags);
        assert_eq!(flags.bits(), 3);
    }

    #[test]
    fn explicit_limits_win() {
        let settings = ContextSettings {
            time_limit: Duration::from_millis(100),
            memory_limit: 1 << 20,
            ..Default::default()
        };
        let shared = ContextShared::new(&settings);
        let limits = shared.limits_for(None, None);
        assert_eq!(limits.time, Some(Duration::from_millis(100)));
        assert_eq!(limits.memory, Some(1 << 20));

        let limits = shared.limits_for(Some(Duration::from_millis(5)), Some(0));
        assert_eq!(limits.time, Some(Duration::from_millis(5)));
        assert_eq!(limits.memory, Some(1 << 20));

        shared.set_time_limit(Duration::ZERO);
        shared.set_memory_limit(0).unwrap();
        assert!(shared.limits_for(None, None).is_unlimited());
    }

    #[test]
    fn negative_memory_limits_are_rejected() {
        let context = ExecutionContext::new(None, ContextSettings::default());
        assert!(matches!(
            context.set_memory_limit(-1),
            Err(Error::InvalidArgument(_))
        ));
        context.set_memory_limit(4096).unwrap();
        assert_eq!(context.memory_limit(), 4096);
    }

    #[test]
    fn external_memory_saturates() {
        let shared = ContextShared::new(&ContextSettings::default());
        assert_eq!(shared.charge_external(), DEFAULT_AVERAGE_OBJECT_SIZE);
        shared.uncharge_external(DEFAULT_AVERAGE_OBJECT_SIZE * 2);
        assert_eq!(shared.external_memory(), 0);
    }

    #[test]
    fn unconstructed_contexts() {
        let context = ExecutionContext::new(None, ContextSettings::default());
        assert!(!context.is_constructed());
        assert!(matches!(
            context.compile("1", None),
            Err(Error::NotConstructed)
        ));
        assert_eq!(context.dispose().unwrap(), TeardownReport::default());
        assert!(matches!(
            context.construct(ConstructOptions::default()),
            Err(Error::Disposed)
        ));
    }

    #[test]
    fn contexts_do_not_serialize() {
        let context = ExecutionContext::new(None, ContextSettings::default());
        let err = serde_json::to_string(&context).unwrap_err();
        assert!(err.to_string().contains("cannot be serialized"));
    }

    #[test]
    fn context_ids_are_unique() {
        assert_ne!(ContextId::next(), ContextId::next());
        let id = ContextId::next();
        assert_eq!(id.to_string(), format!("context-{}", id.as_u64()));
    }
}
