use std::time::Duration;

use rquickjs::Ctx;

use super::{ContextId, DEFAULT_SCRIPT_IDENTIFIER, ExecutionFlags, VariableSlot, context_mismatch};
use crate::bridge::Bridge;
use crate::error::Result;
use crate::guest_object::{GuestObject, GuestOp};
use crate::metrics::ExecutionMetricGuard;
use crate::script::ScriptResource;
use crate::value::HostValue;

/// The context a host callback was called from.
///
/// Host callbacks run while their context's engine is locked, so they can't use the
/// [`ExecutionContext`](super::ExecutionContext) or [`GuestObject`] methods of the same context.
/// A `CallScope` re-enters the running engine instead: executions started through it are nested
/// in the current one, inherit its limits and are not registered with the watchdog again.
pub struct CallScope<'a, 'js> {
    ctx: &'a Ctx<'js>,
    bridge: &'a Bridge,
}

impl<'a, 'js> CallScope<'a, 'js> {
    pub(crate) fn new(ctx: &'a Ctx<'js>, bridge: &'a Bridge) -> Self {
        Self { ctx, bridge }
    }

    /// The context this callback runs in.
    pub fn context_id(&self) -> ContextId {
        self.bridge.shared.id
    }

    /// Number of execution levels running, at least one inside a callback.
    pub fn depth(&self) -> usize {
        self.bridge.shared.depth()
    }

    /// Compile `source` in the running context.
    pub fn compile(&self, source: &str, identifier: Option<&str>) -> Result<ScriptResource> {
        let identifier = identifier.unwrap_or(DEFAULT_SCRIPT_IDENTIFIER);
        self.bridge.compile(self.ctx, source, identifier)
    }

    /// Run a compiled script as a nested execution.
    pub fn execute(&self, script: &ScriptResource, flags: ExecutionFlags) -> Result<HostValue> {
        if !script.is_owned_by(self.context_id()) {
            return Ok(context_mismatch(script, self.context_id()));
        }
        let _metric_guard = ExecutionMetricGuard::new(script.identifier());
        let id = script.id();
        self.bridge
            .run_in_scope(self.ctx, flags, |ctx| self.bridge.run_script(ctx, id))
            .into_result()
    }

    /// Compile and run `source` as a nested execution.
    pub fn execute_string(
        &self,
        source: &str,
        identifier: Option<&str>,
        flags: ExecutionFlags,
    ) -> Result<HostValue> {
        let script = self.compile(source, identifier)?;
        let result = self.execute(&script, flags);
        script.dispose();
        result
    }

    fn guest_op(&self, guest: &GuestObject, op: GuestOp<'_>) -> Result<HostValue> {
        self.bridge
            .run_in_scope(self.ctx, ExecutionFlags::NONE, |ctx| {
                self.bridge.guest_op(ctx, guest, op)
            })
            .into_result()
    }

    /// Read the property `name` of a guest object.
    pub fn get(&self, object: &GuestObject, name: &str) -> Result<HostValue> {
        self.guest_op(object, GuestOp::Get(name))
    }

    /// Set the property `name` of a guest object.
    pub fn set(&self, object: &GuestObject, name: &str, value: &HostValue) -> Result<()> {
        self.guest_op(object, GuestOp::Set(name, value)).map(drop)
    }

    /// Call a guest function with `undefined` as `this`.
    pub fn call(&self, function: &GuestObject, args: &[HostValue]) -> Result<HostValue> {
        self.guest_op(function, GuestOp::Call(args))
    }

    /// Call the method `name` of a guest object.
    pub fn call_method(
        &self,
        object: &GuestObject,
        name: &str,
        args: &[HostValue],
    ) -> Result<HostValue> {
        self.guest_op(object, GuestOp::CallMethod(name, args))
    }

    /// The host handle to an initial variable of the running context.
    pub fn variable(&self, name: &str) -> Option<VariableSlot> {
        self.bridge.variable(name)
    }

    /// Set the default time limit and restart the running execution's deadline from now.
    pub fn set_time_limit(&self, limit: Duration) {
        self.bridge.shared.set_time_limit(limit);
    }

    /// Set the default memory limit and apply it to the running execution.
    pub fn set_memory_limit(&self, bytes: i64) -> Result<()> {
        self.bridge.shared.set_memory_limit(bytes)
    }
}
