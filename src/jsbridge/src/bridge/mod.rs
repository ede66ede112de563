/*!
The value and exception bridge between the host and one engine instance.

A [`Bridge`] is owned by the engine of one context and cloned into every host callback it
installs. Its state holds every long-lived guest reference the host keeps: the caches of
wrappers, compiled scripts, guest object handles and loaded modules. All of it is only touched
while the context's engine lock is held, and all of it is released by [`Bridge::release_all`]
before the engine is disposed.
*/

pub(crate) mod convert;
pub(crate) mod exception;
pub(crate) mod wrapper;

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use rquickjs::prelude::{Rest, This};
use rquickjs::promise::MaybePromise;
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};

use self::convert::check_string;
use self::exception::{CatchJsErrorExt, throw_uncatchable};
use self::wrapper::ClassKey;
use crate::context::{ContextInner, ContextShared, ExecutionFlags, ReleaseCounts, VariableSlot};
use crate::error::{Error, LimitKind, Result};
use crate::guest_object::{GuestObject, GuestOp};
use crate::handle_cache::{HandleCache, Release, WeakEntry};
use crate::host_object::HostObject;
use crate::metrics::METRIC_SCRIPT_COMPILATIONS;
use crate::script::{ScriptInner, ScriptResource};
use crate::value::{HostFunction, HostValue};

// Built-ins captured before any guest code runs, so later changes to the globals made by the
// guest can't interfere with the bridge.
const HELPERS: &str = r#"(() => {
    const marker = Symbol("host function");
    const apply = Reflect.apply;
    const defineProperty = Object.defineProperty;
    const setPrototypeOf = Object.setPrototypeOf;
    const hasOwn = Object.hasOwn;
    const WeakRefCtor = WeakRef;
    const deref = WeakRef.prototype.deref;
    return {
        mark(fn, key) { defineProperty(fn, marker, { value: key }); },
        markOf(fn) { return hasOwn(fn, marker) ? fn[marker] : undefined; },
        weak(target) { return new WeakRefCtor(target); },
        deref(ref) { return apply(deref, ref, []); },
        accessor(target, name, get, set) {
            defineProperty(target, name, { get, set, enumerable: true, configurable: true });
        },
        setPrototype(target, proto) { setPrototypeOf(target, proto); },
        remove(target, name) { return delete target[name]; },
    };
})()"#;

/// The outcome of one execution.
pub(crate) enum Outcome {
    Value(HostValue),
    Recoverable(Error),
    /// The watchdog terminated the execution, this wins over anything the guest did afterwards.
    FatalAbort(LimitKind),
}

impl Outcome {
    pub(crate) fn into_result(self) -> Result<HostValue> {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Recoverable(e) => Err(e),
            Outcome::FatalAbort(kind) => Err(Error::ResourceLimitExceeded(kind)),
        }
    }
}

pub(crate) struct BridgeState {
    helpers: Option<Persistent<Object<'static>>>,
    accessors: Vec<(String, VariableSlot)>,
    /// Registered global functions, held strongly.
    calls: HandleCache<usize, (Persistent<Function<'static>>, HostFunction)>,
    /// Method functions, per (class, method name).
    methods: HandleCache<(ClassKey, String), Persistent<Function<'static>>>,
    /// Per class prototypes holding the method functions.
    templates: HandleCache<ClassKey, Persistent<Object<'static>>>,
    objects: HandleCache<usize, WeakEntry<Arc<dyn HostObject>>>,
    closures: HandleCache<usize, WeakEntry<HostFunction>>,
    scripts: HashMap<u64, Persistent<Value<'static>>>,
    live_scripts: Vec<Weak<ScriptInner>>,
    guests: HashMap<u64, Persistent<Value<'static>>>,
    modules: HashMap<String, Persistent<Object<'static>>>,
    flags: Vec<ExecutionFlags>,
    pending_host_error: Option<(usize, anyhow::Error)>,
    next_serial: u64,
}

impl BridgeState {
    fn new() -> Self {
        Self {
            helpers: None,
            accessors: Vec::new(),
            calls: HandleCache::new("compiled-call"),
            methods: HandleCache::new("type-method"),
            templates: HandleCache::new("symbol-template"),
            objects: HandleCache::new("exported-object"),
            closures: HandleCache::new("exported-closure"),
            scripts: HashMap::new(),
            live_scripts: Vec::new(),
            guests: HashMap::new(),
            modules: HashMap::new(),
            flags: Vec::new(),
            pending_host_error: None,
            next_serial: 0,
        }
    }
}

/// Sizes of the bridge caches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CacheSizes {
    pub(crate) calls: usize,
    pub(crate) methods: usize,
    pub(crate) templates: usize,
    pub(crate) objects: usize,
    pub(crate) closures: usize,
    pub(crate) scripts: usize,
    pub(crate) guests: usize,
    pub(crate) modules: usize,
}

#[derive(Clone)]
pub(crate) struct Bridge {
    state: Rc<RefCell<BridgeState>>,
    pub(crate) shared: Arc<ContextShared>,
    owner: Weak<ContextInner>,
}

// Pops the flags of an execution level when it ends.
struct FlagsGuard<'a>(&'a Bridge);

impl Drop for FlagsGuard<'_> {
    fn drop(&mut self) {
        self.0.state_mut().flags.pop();
    }
}

impl Bridge {
    pub(crate) fn new(shared: Arc<ContextShared>, owner: Weak<ContextInner>) -> Self {
        Self {
            state: Rc::new(RefCell::new(BridgeState::new())),
            shared,
            owner,
        }
    }

    fn state(&self) -> Ref<'_, BridgeState> {
        self.state.borrow()
    }

    fn state_mut(&self) -> RefMut<'_, BridgeState> {
        self.state.borrow_mut()
    }

    fn next_serial(&self) -> u64 {
        let mut state = self.state_mut();
        state.next_serial += 1;
        state.next_serial
    }

    /// Install the helper functions. Must run before any guest code.
    pub(crate) fn install(&self, ctx: &Ctx<'_>) -> Result<()> {
        let helpers: Object = ctx
            .eval(HELPERS)
            .catch_guest(ctx, Error::Runtime)?;
        self.state_mut().helpers = Some(Persistent::save(ctx, helpers));
        Ok(())
    }

    fn helper<'js>(&self, ctx: &Ctx<'js>, name: &str) -> Result<Function<'js>> {
        let helpers = self.state().helpers.clone().ok_or(Error::Disposed)?;
        Ok(helpers.restore(ctx)?.get(name)?)
    }

    /// Delete the global `name`, returning whether the guest allowed it.
    pub(crate) fn remove_global(&self, ctx: &Ctx<'_>, name: &str) -> Result<bool> {
        Ok(self
            .helper(ctx, "remove")?
            .call((ctx.globals(), name))?)
    }

    /// Keep `slot` alive for as long as the context, its accessor reads it.
    pub(crate) fn track_accessor(&self, name: &str, slot: VariableSlot) {
        self.state_mut().accessors.push((name.to_string(), slot));
    }

    pub(crate) fn variable(&self, name: &str) -> Option<VariableSlot> {
        self.state()
            .accessors
            .iter()
            .find(|(accessor, _)| accessor == name)
            .map(|(_, slot)| slot.clone())
    }

    pub(crate) fn cache_sizes(&self) -> CacheSizes {
        let state = self.state();
        CacheSizes {
            calls: state.calls.len(),
            methods: state.methods.len(),
            templates: state.templates.len(),
            objects: state.objects.len(),
            closures: state.closures.len(),
            scripts: state.scripts.len(),
            guests: state.guests.len(),
            modules: state.modules.len(),
        }
    }

    /// Apply every queued release. Returns how many cache entries were dropped.
    pub(crate) fn drain_releases(&self) -> usize {
        let releases = self.shared.releases.take();
        if releases.is_empty() {
            return 0;
        }
        let mut released = 0;
        let mut charges = 0;
        {
            let mut state = self.state_mut();
            for release in releases {
                match release {
                    Release::HostObject { key, serial } => {
                        if let Some(entry) =
                            state.objects.remove_if(&key, |entry| entry.serial == serial)
                        {
                            charges += entry.charge;
                            released += 1;
                        }
                    }
                    Release::Closure { key, serial } => {
                        if let Some(entry) =
                            state.closures.remove_if(&key, |entry| entry.serial == serial)
                        {
                            charges += entry.charge;
                            released += 1;
                        }
                    }
                    Release::Script(id) => {
                        if state.scripts.remove(&id).is_some() {
                            released += 1;
                        }
                    }
                    Release::Guest(id) => {
                        if state.guests.remove(&id).is_some() {
                            released += 1;
                        }
                    }
                }
            }
            state
                .live_scripts
                .retain(|script| script.strong_count() > 0);
        }
        self.shared.uncharge_external(charges);
        tracing::trace!(released, "Drained pending releases");
        released
    }

    /// Compile `source` into a script resource owned by this context.
    pub(crate) fn compile(
        &self,
        ctx: &Ctx<'_>,
        source: &str,
        identifier: &str,
    ) -> Result<ScriptResource> {
        let max = self.shared.max_string_length();
        check_string(source, max, "Script source")?;
        check_string(identifier, max, "Script identifier")?;
        if source.contains('\0') || identifier.contains('\0') {
            return Err(Error::InvalidArgument(
                "script source and identifier must not contain NUL".to_string(),
            ));
        }
        self.drain_releases();

        let compiled =
            crate::script::compile(ctx, source, identifier).catch_guest(ctx, Error::Compile)?;
        metrics::counter!(METRIC_SCRIPT_COMPILATIONS).increment(1);
        let resource = ScriptResource::new(identifier, self.shared.id, self.shared.releases.clone());
        self.store_script(ctx, resource.id(), resource.downgrade(), compiled);
        tracing::trace!(script = identifier, "Compiled script");
        Ok(resource)
    }

    fn store_script<'js>(
        &self,
        ctx: &Ctx<'js>,
        id: u64,
        script: Weak<ScriptInner>,
        compiled: Value<'js>,
    ) {
        let mut state = self.state_mut();
        state.scripts.insert(id, Persistent::save(ctx, compiled));
        state.live_scripts.push(script);
    }

    pub(crate) fn run_script<'js>(&self, ctx: &Ctx<'js>, id: u64) -> Result<Value<'js>> {
        let compiled = self
            .state()
            .scripts
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument("script resource has been disposed".to_string()))?;
        let compiled = compiled.restore(ctx)?;
        Ok(crate::script::run(ctx, &compiled)?)
    }

    /// Hold `value` for a host side [`GuestObject`].
    pub(crate) fn store_guest<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: Value<'js>,
        function: bool,
    ) -> GuestObject {
        let guest = GuestObject::new(
            self.shared.id,
            self.owner.clone(),
            self.shared.releases.clone(),
            function,
        );
        self.state_mut()
            .guests
            .insert(guest.id(), Persistent::save(ctx, value));
        guest
    }

    pub(crate) fn restore_guest<'js>(
        &self,
        ctx: &Ctx<'js>,
        guest: &GuestObject,
    ) -> Result<Value<'js>> {
        if guest.context_id() != self.shared.id {
            return Err(Error::ContextMismatch);
        }
        let stored = self.state().guests.get(&guest.id()).cloned();
        Ok(stored.ok_or(Error::Disposed)?.restore(ctx)?)
    }

    pub(crate) fn guest_op<'js>(
        &self,
        ctx: &Ctx<'js>,
        guest: &GuestObject,
        op: GuestOp<'_>,
    ) -> Result<Value<'js>> {
        let target = self.restore_guest(ctx, guest)?;
        let not_an_object =
            || Error::InvalidArgument("guest value is not an object".to_string());
        let value = match op {
            GuestOp::Get(name) => target.as_object().ok_or_else(not_an_object)?.get(name)?,
            GuestOp::Set(name, value) => {
                let value = self.to_guest(ctx, value)?;
                target.as_object().ok_or_else(not_an_object)?.set(name, value)?;
                Value::new_undefined(ctx.clone())
            }
            GuestOp::Delete(name) => self.helper(ctx, "remove")?.call((target, name))?,
            GuestOp::Call(args) => {
                let function = target.as_function().ok_or_else(|| {
                    Error::InvalidArgument("guest value is not a function".to_string())
                })?;
                let args = self.guest_args(ctx, args)?;
                function.call((This(Value::new_undefined(ctx.clone())), Rest(args)))?
            }
            GuestOp::CallMethod(name, args) => {
                let object = target.as_object().ok_or_else(not_an_object)?;
                let method: Function = object.get(name)?;
                let args = self.guest_args(ctx, args)?;
                method.call((This(object.clone()), Rest(args)))?
            }
        };
        Ok(value)
    }

    fn guest_args<'js>(&self, ctx: &Ctx<'js>, args: &[HostValue]) -> Result<Vec<Value<'js>>> {
        args.iter().map(|arg| self.to_guest(ctx, arg)).collect()
    }

    /// Convert the arguments of a host callback, throwing on failure.
    pub(crate) fn args_from_guest<'js>(
        &self,
        ctx: &Ctx<'js>,
        args: Rest<Value<'js>>,
    ) -> rquickjs::Result<Vec<HostValue>> {
        args.into_inner()
            .into_iter()
            .map(|arg| self.from_guest(ctx, arg, ExecutionFlags::NONE))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| self.throw(ctx, e))
    }

    /// Hand the result of a host callback back to the guest.
    pub(crate) fn complete_host_call<'js>(
        &self,
        ctx: &Ctx<'js>,
        result: anyhow::Result<HostValue>,
    ) -> rquickjs::Result<Value<'js>> {
        match result {
            Ok(value) => self.to_guest(ctx, &value).map_err(|e| self.throw(ctx, e)),
            Err(e) => Err(self.throw_host_error(ctx, e)),
        }
    }

    /// Throw a bridge error into the guest.
    pub(crate) fn throw(&self, ctx: &Ctx<'_>, error: Error) -> rquickjs::Error {
        match error {
            Error::Engine(e) => e,
            Error::InvalidArgument(message) => Exception::throw_range(ctx, &message),
            Error::ContextMismatch | Error::UnsupportedOperation(_) => {
                Exception::throw_type(ctx, &error.to_string())
            }
            Error::ResourceLimitExceeded(_) => throw_uncatchable(ctx, &error.to_string()),
            Error::Host(e) => self.throw_host_error(ctx, e),
            Error::Compile(exception) | Error::Runtime(exception) => {
                Exception::throw_message(ctx, &exception.to_string())
            }
            other => Exception::throw_message(ctx, &other.to_string()),
        }
    }

    /// Throw a host callback error into the guest, or store it and unwind the execution past
    /// every guest handler when host exceptions propagate.
    pub(crate) fn throw_host_error(&self, ctx: &Ctx<'_>, error: anyhow::Error) -> rquickjs::Error {
        let error = match error.downcast::<rquickjs::Error>() {
            Ok(e) => return e,
            Err(error) => error,
        };
        let error = match error.downcast::<Error>() {
            Ok(Error::Host(inner)) => inner,
            Ok(Error::Engine(e)) => return e,
            Ok(fatal @ Error::ResourceLimitExceeded(_)) => {
                return throw_uncatchable(ctx, &fatal.to_string());
            }
            Ok(other) => anyhow::Error::new(other),
            Err(error) => error,
        };

        let message = format!("{error:#}");
        if self.propagating() {
            let depth = self.shared.depth();
            tracing::debug!(depth, "Propagating host callback error: {message}");
            self.state_mut().pending_host_error = Some((depth, error));
            self.shared.signals.request_unwind();
            return throw_uncatchable(ctx, &message);
        }
        Exception::throw_message(ctx, &message)
    }

    fn propagating(&self) -> bool {
        self.state()
            .flags
            .last()
            .is_some_and(|flags| flags.contains(ExecutionFlags::PROPAGATE_HOST_EXCEPTIONS))
    }

    /// Run one execution level: `run` produces the guest value, which is settled and converted.
    pub(crate) fn run_in_scope<'js, F>(
        &self,
        ctx: &Ctx<'js>,
        flags: ExecutionFlags,
        run: F,
    ) -> Outcome
    where
        F: FnOnce(&Ctx<'js>) -> Result<Value<'js>>,
    {
        let _depth = self.shared.enter();
        self.state_mut().flags.push(flags);
        let _flags = FlagsGuard(self);
        self.drain_releases();

        let result = run(ctx)
            .and_then(|value| Ok(value.get::<MaybePromise>()?.finish::<Value>()?))
            .and_then(|value| self.from_guest(ctx, value, flags))
            .catch_guest(ctx, Error::Runtime);

        let depth = self.shared.depth();
        let pending = {
            let mut state = self.state_mut();
            match &state.pending_host_error {
                Some((at, _)) if *at >= depth => state.pending_host_error.take(),
                _ => None,
            }
        };

        let outcome = match (pending, result) {
            (Some((_, error)), _) => {
                self.shared.signals.clear_unwind();
                Outcome::Recoverable(Error::Host(error))
            }
            (None, Ok(value)) => Outcome::Value(value),
            (None, Err(e)) => Outcome::Recoverable(e),
        };
        self.drain_releases();

        match self.shared.signals.fatal_abort() {
            Some(kind) => Outcome::FatalAbort(kind),
            None => outcome,
        }
    }

    pub(crate) fn cached_module<'js>(&self, ctx: &Ctx<'js>, id: &str) -> Result<Option<Object<'js>>> {
        let cached = self.state().modules.get(id).cloned();
        Ok(cached.map(|module| module.restore(ctx)).transpose()?)
    }

    pub(crate) fn cache_module<'js>(&self, ctx: &Ctx<'js>, id: &str, module: &Object<'js>) {
        self.state_mut()
            .modules
            .insert(id.to_string(), Persistent::save(ctx, module.clone()));
    }

    pub(crate) fn forget_module(&self, id: &str) {
        self.state_mut().modules.remove(id);
    }

    /// Release every guest reference held by the bridge, in dependency order.
    ///
    /// Must run before the engine is disposed.
    pub(crate) fn release_all(&self) -> ReleaseCounts {
        let mut counts = ReleaseCounts::default();
        let mut charges = 0;
        {
            let mut state = self.state_mut();
            counts.accessors = std::mem::take(&mut state.accessors).len();

            counts.call_wrappers = release_cache(&mut state.calls).len();
            counts.method_wrappers = release_cache(&mut state.methods).len();
            counts.templates = release_cache(&mut state.templates).len();

            for entry in release_cache(&mut state.objects) {
                charges += entry.charge;
                counts.exported_objects += 1;
            }
            for entry in release_cache(&mut state.closures) {
                charges += entry.charge;
                counts.exported_closures += 1;
            }

            for script in state.live_scripts.drain(..) {
                if let Some(script) = script.upgrade() {
                    script.invalidate();
                }
            }
            counts.scripts = state.scripts.drain().count();
            counts.guest_objects = state.guests.drain().count();
            counts.modules = state.modules.drain().count();

            state.helpers = None;
            state.flags.clear();
            state.pending_host_error = None;
        }
        self.shared.uncharge_external(charges);
        counts
    }
}

fn release_cache<K: Hash + Eq, V>(cache: &mut HandleCache<K, V>) -> Vec<V> {
    let released = cache.release_all();
    tracing::debug!(cache = cache.name(), released = released.len(), "Released cache");
    released
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_fatal_abort_is_an_error() {
        assert!(matches!(
            Outcome::FatalAbort(LimitKind::Time).into_result(),
            Err(Error::ResourceLimitExceeded(LimitKind::Time))
        ));
        assert_eq!(
            Outcome::Value(HostValue::Int(1)).into_result().unwrap(),
            HostValue::Int(1)
        );
    }
}
