/*!
Guest wrappers for host objects and host closures.

A host object is exported as an instance of [`HostObjectHandle`] whose prototype is a per class
template holding the method functions. A class is the implementing type together with its
reported class name, so types sharing a name never share a template. Properties are accessor pairs defined on each wrapper that
call back into the host object on every access. Wrappers and closures exported by value are only
held weakly: when the guest collects one, the [`ReleaseGuard`] it owns queues the release of its
cache entry.
*/

use std::any::{Any, TypeId};
use std::sync::Arc;

use rquickjs::class::Trace;
use rquickjs::prelude::{Rest, This};
use rquickjs::{Class, Ctx, Exception, Function, IntoJs, JsLifetime, Object, Persistent, Value};

use super::Bridge;
use crate::context::{CallScope, VariableSlot};
use crate::error::{Error, Result};
use crate::handle_cache::{Release, ReleaseGuard, WeakEntry};
use crate::host_object::{HostObject, is_exportable_member};
use crate::value::HostFunction;

/// A host class: the implementing type and the class name it reports.
pub(crate) type ClassKey = (TypeId, String);

/// The guest side instance of an exported host object.
#[rquickjs::class]
#[derive(Trace, JsLifetime)]
pub(crate) struct HostObjectHandle {
    #[qjs(skip_trace)]
    object: Arc<dyn HostObject>,
    #[qjs(skip_trace)]
    _release: Option<ReleaseGuard>,
}

impl HostObjectHandle {
    pub(crate) fn object(&self) -> Arc<dyn HostObject> {
        self.object.clone()
    }
}

/// Rust can't infer that the returned `Value<'js>` shares the lifetime of the `Ctx<'js>`
/// argument of a closure, see https://github.com/rust-lang/rust/issues/97362.
/// Passing the closure through this function pins the signature.
pub(crate) fn coerce_fn_signature<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, This<Value<'js>>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

fn host_object_of<'js>(this: &Value<'js>) -> Option<Arc<dyn HostObject>> {
    let class = this.get::<Class<'js, HostObjectHandle>>().ok()?;
    let object = class.borrow().object();
    Some(object)
}

// Identity of an exported host object.
fn object_key(object: &Arc<dyn HostObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

// A host closure exported to the guest. Calls go through a method so the closure captures the
// whole target, release guard included.
struct ClosureTarget {
    bridge: Bridge,
    function: HostFunction,
    _release: Option<ReleaseGuard>,
}

impl ClosureTarget {
    fn call<'js>(&self, ctx: &Ctx<'js>, args: Rest<Value<'js>>) -> rquickjs::Result<Value<'js>> {
        let args = self.bridge.args_from_guest(ctx, args)?;
        let result = {
            let scope = CallScope::new(ctx, &self.bridge);
            self.function.call(&scope, args)
        };
        self.bridge.complete_host_call(ctx, result)
    }
}

impl Bridge {
    /// Wrap `object` for the guest, reusing its wrapper while the guest still holds it.
    pub(crate) fn export_object<'js>(
        &self,
        ctx: &Ctx<'js>,
        object: &Arc<dyn HostObject>,
    ) -> Result<Value<'js>> {
        let key = object_key(object);
        let weak = self.state().objects.get(&key).map(|entry| entry.weak.clone());
        if let Some(weak) = weak
            && let Some(wrapper) = self.deref_weak(ctx, weak)?
        {
            return Ok(wrapper);
        }

        let serial = self.next_serial();
        let release = ReleaseGuard::new(
            self.shared.releases.clone(),
            Release::HostObject { key, serial },
        );
        let wrapper = self.create_wrapper(ctx, object.clone(), false, Some(release))?;
        let weak = self.weak_ref(ctx, wrapper.as_value())?;
        let charge = self.shared.charge_external();
        let stale = self.state_mut().objects.insert(
            key,
            WeakEntry {
                weak,
                target: object.clone(),
                serial,
                charge,
            },
        );
        if let Some(stale) = stale {
            self.shared.uncharge_external(stale.charge);
        }
        tracing::trace!(class = object.class_name(), serial, "Exported host object");
        Ok(wrapper.into_value())
    }

    /// Create a wrapper for `object`. Read-only wrappers throw `TypeError` on property writes.
    pub(crate) fn create_wrapper<'js>(
        &self,
        ctx: &Ctx<'js>,
        object: Arc<dyn HostObject>,
        read_only: bool,
        release: Option<ReleaseGuard>,
    ) -> Result<Object<'js>> {
        let template = self.template(ctx, object.as_ref())?;
        let handle = HostObjectHandle {
            object: object.clone(),
            _release: release,
        };
        let wrapper = Class::instance(ctx.clone(), handle)?
            .into_js(ctx)?
            .into_object()
            .ok_or_else(|| Error::UnsupportedOperation("host object wrapper".to_string()))?;
        self.helper(ctx, "setPrototype")?
            .call::<_, ()>((wrapper.clone(), template))?;

        for name in object
            .property_names()
            .into_iter()
            .filter(|name| is_exportable_member(name))
        {
            let getter = self.property_getter(ctx, object.clone(), &name)?;
            let setter = if read_only {
                read_only_setter(ctx, &name)?
            } else {
                self.property_setter(ctx, object.clone(), &name)?
            };
            self.define_accessor(ctx, &wrapper, &name, getter, setter)?;
        }
        Ok(wrapper)
    }

    /// Define a read-only accessor on `target` reading the current value of `slot`.
    pub(crate) fn define_variable<'js>(
        &self,
        ctx: &Ctx<'js>,
        target: &Object<'js>,
        name: &str,
        slot: VariableSlot,
    ) -> Result<()> {
        let bridge = self.clone();
        let getter = coerce_fn_signature(move |ctx, _this, _args| {
            let value = slot.get();
            bridge.to_guest(&ctx, &value).map_err(|e| bridge.throw(&ctx, e))
        });
        let getter = Function::new(ctx.clone(), getter)?.with_name(format!("get {name}"))?;
        let setter = read_only_setter(ctx, name)?;
        self.define_accessor(ctx, target, name, getter, setter)
    }

    fn define_accessor<'js>(
        &self,
        ctx: &Ctx<'js>,
        target: &Object<'js>,
        name: &str,
        getter: Function<'js>,
        setter: Function<'js>,
    ) -> Result<()> {
        self.helper(ctx, "accessor")?
            .call::<_, ()>((target.clone(), name, getter, setter))?;
        Ok(())
    }

    fn property_getter<'js>(
        &self,
        ctx: &Ctx<'js>,
        object: Arc<dyn HostObject>,
        name: &str,
    ) -> Result<Function<'js>> {
        let bridge = self.clone();
        let property = name.to_string();
        let getter = coerce_fn_signature(move |ctx, _this, _args| {
            let value = object.get_property(&property).unwrap_or_default();
            bridge.to_guest(&ctx, &value).map_err(|e| bridge.throw(&ctx, e))
        });
        Ok(Function::new(ctx.clone(), getter)?.with_name(format!("get {name}"))?)
    }

    fn property_setter<'js>(
        &self,
        ctx: &Ctx<'js>,
        object: Arc<dyn HostObject>,
        name: &str,
    ) -> Result<Function<'js>> {
        let bridge = self.clone();
        let property = name.to_string();
        let setter = coerce_fn_signature(move |ctx, _this, args| {
            let value = match args.0.into_iter().next() {
                Some(value) => bridge
                    .from_guest(&ctx, value, Default::default())
                    .map_err(|e| bridge.throw(&ctx, e))?,
                None => Default::default(),
            };
            let result = object.set_property(&property, value);
            bridge.complete_host_call(&ctx, result.map(|()| Default::default()))
        });
        Ok(Function::new(ctx.clone(), setter)?.with_name(format!("set {name}"))?)
    }

    // The prototype shared by every wrapper of one host class.
    fn template<'js>(&self, ctx: &Ctx<'js>, object: &dyn HostObject) -> Result<Object<'js>> {
        let any: &dyn Any = object;
        let class: ClassKey = (any.type_id(), object.class_name().to_string());
        let cached = self.state().templates.get(&class).cloned();
        if let Some(template) = cached {
            return Ok(template.restore(ctx)?);
        }

        let template = Object::new(ctx.clone())?;
        for method in object
            .method_names()
            .into_iter()
            .filter(|method| is_exportable_member(method))
        {
            let function = self.method(ctx, &class, &method)?;
            template.set(method.as_str(), function)?;
        }
        tracing::debug!(class = class.1, "Created host class template");
        self.state_mut()
            .templates
            .insert(class, Persistent::save(ctx, template.clone()));
        Ok(template)
    }

    fn method<'js>(&self, ctx: &Ctx<'js>, class: &ClassKey, method: &str) -> Result<Function<'js>> {
        let key = (class.clone(), method.to_string());
        let cached = self.state().methods.get(&key).cloned();
        if let Some(function) = cached {
            return Ok(function.restore(ctx)?);
        }

        let bridge = self.clone();
        let name = method.to_string();
        let function = coerce_fn_signature(move |ctx, this, args| {
            let Some(object) = host_object_of(&this.0) else {
                return Err(Exception::throw_type(
                    &ctx,
                    &format!("{name} called on an object that is not a host object"),
                ));
            };
            let args = bridge.args_from_guest(&ctx, args)?;
            let result = {
                let scope = CallScope::new(&ctx, &bridge);
                object.call_method(&scope, &name, args)
            };
            bridge.complete_host_call(&ctx, result)
        });
        let function = Function::new(ctx.clone(), function)?.with_name(method)?;
        self.state_mut()
            .methods
            .insert(key, Persistent::save(ctx, function.clone()));
        Ok(function)
    }

    /// Wrap `function` for the guest, reusing a registered or still live wrapper.
    pub(crate) fn export_function<'js>(
        &self,
        ctx: &Ctx<'js>,
        function: &HostFunction,
    ) -> Result<Value<'js>> {
        let key = function.identity();
        let registered = self.state().calls.get(&key).map(|(wrapper, _)| wrapper.clone());
        if let Some(registered) = registered {
            return Ok(registered.restore(ctx)?.into_value());
        }
        let weak = self.state().closures.get(&key).map(|entry| entry.weak.clone());
        if let Some(weak) = weak
            && let Some(wrapper) = self.deref_weak(ctx, weak)?
        {
            return Ok(wrapper);
        }

        let serial = self.next_serial();
        let release = ReleaseGuard::new(
            self.shared.releases.clone(),
            Release::Closure { key, serial },
        );
        let wrapper = self.create_closure(ctx, function.clone(), Some(release))?;
        let weak = self.weak_ref(ctx, wrapper.as_value())?;
        let charge = self.shared.charge_external();
        let stale = self.state_mut().closures.insert(
            key,
            WeakEntry {
                weak,
                target: function.clone(),
                serial,
                charge,
            },
        );
        if let Some(stale) = stale {
            self.shared.uncharge_external(stale.charge);
        }
        Ok(wrapper.into_value())
    }

    /// Install `function` as the global `name`, held strongly for the life of the context.
    pub(crate) fn register_function<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        function: &HostFunction,
    ) -> Result<()> {
        let key = function.identity();
        let cached = self.state().calls.get(&key).map(|(wrapper, _)| wrapper.clone());
        let wrapper = match cached {
            Some(wrapper) => wrapper.restore(ctx)?,
            None => {
                let wrapper = self.create_closure(ctx, function.clone(), None)?;
                self.state_mut().calls.insert(
                    key,
                    (Persistent::save(ctx, wrapper.clone()), function.clone()),
                );
                wrapper
            }
        };
        ctx.globals().set(name, wrapper)?;
        Ok(())
    }

    fn create_closure<'js>(
        &self,
        ctx: &Ctx<'js>,
        function: HostFunction,
        release: Option<ReleaseGuard>,
    ) -> Result<Function<'js>> {
        let name = function.name().to_string();
        let key = function.identity();
        let target = ClosureTarget {
            bridge: self.clone(),
            function,
            _release: release,
        };
        let closure = coerce_fn_signature(move |ctx, _this, args| target.call(&ctx, args));
        let wrapper = Function::new(ctx.clone(), closure)?.with_name(name)?;
        // identities are addresses, which fit in a double
        self.helper(ctx, "mark")?
            .call::<_, ()>((wrapper.clone(), key as f64))?;
        Ok(wrapper)
    }

    /// The host function identity a guest function was marked with, if it wraps one.
    pub(crate) fn host_function_key<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: &Value<'js>,
    ) -> Result<Option<usize>> {
        let key: Option<f64> = self.helper(ctx, "markOf")?.call((value.clone(),))?;
        Ok(key.map(|key| key as usize))
    }

    /// The host function registered or exported under `key`.
    pub(crate) fn host_function(&self, key: usize) -> Option<HostFunction> {
        let state = self.state();
        if let Some(entry) = state.closures.get(&key) {
            return Some(entry.target.clone());
        }
        state.calls.get(&key).map(|(_, function)| function.clone())
    }

    fn weak_ref<'js>(
        &self,
        ctx: &Ctx<'js>,
        target: &Value<'js>,
    ) -> Result<Persistent<Object<'static>>> {
        let weak: Object = self.helper(ctx, "weak")?.call((target.clone(),))?;
        Ok(Persistent::save(ctx, weak))
    }

    fn deref_weak<'js>(
        &self,
        ctx: &Ctx<'js>,
        weak: Persistent<Object<'static>>,
    ) -> Result<Option<Value<'js>>> {
        let weak = weak.restore(ctx)?;
        let target: Value = self.helper(ctx, "deref")?.call((weak,))?;
        Ok(Some(target).filter(|target| !target.is_undefined()))
    }
}

fn read_only_setter<'js>(ctx: &Ctx<'js>, name: &str) -> Result<Function<'js>> {
    let property = name.to_string();
    let setter = coerce_fn_signature(move |ctx, _this, _args| {
        Err(Exception::throw_type(
            &ctx,
            &format!("Cannot assign to read only property '{property}'"),
        ))
    });
    Ok(Function::new(ctx.clone(), setter)?.with_name(format!("set {name}"))?)
}
