/*!
Compiled scripts, and the raw engine calls that compile a script without running it and run
previously compiled bytecode.
*/

use std::ffi::CString;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use rquickjs::{Ctx, Exception, Type, Value, qjs};
use serde::{Deserialize, Serialize};

use crate::context::ContextId;
use crate::handle_cache::{Release, ReleaseQueue};

static NEXT_SCRIPT_ID: AtomicU64 = AtomicU64::new(1);

/// A compiled script bound to the context that compiled it.
///
/// Clones share the same compiled bytecode. The bytecode is released once the resource is
/// disposed or the last clone is dropped, and is invalidated when its context is torn down.
/// Executing a resource with any other context is rejected.
#[derive(Clone)]
pub struct ScriptResource {
    inner: Arc<ScriptInner>,
}

pub(crate) struct ScriptInner {
    id: u64,
    identifier: String,
    owner: Mutex<Option<ScriptOwner>>,
}

struct ScriptOwner {
    context: ContextId,
    releases: ReleaseQueue,
}

impl ScriptResource {
    pub(crate) fn new(identifier: &str, context: ContextId, releases: ReleaseQueue) -> Self {
        Self {
            inner: Arc::new(ScriptInner {
                id: NEXT_SCRIPT_ID.fetch_add(1, Ordering::Relaxed),
                identifier: identifier.to_string(),
                owner: Mutex::new(Some(ScriptOwner { context, releases })),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn downgrade(&self) -> Weak<ScriptInner> {
        Arc::downgrade(&self.inner)
    }

    /// The identifier the script was compiled under, used as its file name in stack traces.
    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// The context this script belongs to, or `None` once it has been disposed or its context
    /// torn down.
    pub fn owner(&self) -> Option<ContextId> {
        self.inner.lock().as_ref().map(|owner| owner.context)
    }

    /// Returns true while the script can still be executed by its context.
    pub fn is_valid(&self) -> bool {
        self.owner().is_some()
    }

    pub(crate) fn is_owned_by(&self, context: ContextId) -> bool {
        self.owner() == Some(context)
    }

    /// Release the compiled bytecode now instead of when the last clone is dropped.
    pub fn dispose(&self) {
        self.inner.release();
    }
}

impl ScriptInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ScriptOwner>> {
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        if let Some(owner) = self.lock().take() {
            owner.releases.push(Release::Script(self.id));
        }
    }

    /// Detach from the owning context without queueing a release, the context is going away.
    pub(crate) fn invalidate(&self) {
        self.lock().take();
    }
}

impl Drop for ScriptInner {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ScriptResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptResource")
            .field("identifier", &self.inner.identifier)
            .field("owner", &self.owner())
            .finish()
    }
}

impl PartialEq for ScriptResource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Serialize for ScriptResource {
    fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom(crate::Error::UnsupportedOperation(
            "script resources cannot be serialized".to_string(),
        )))
    }
}

impl<'de> Deserialize<'de> for ScriptResource {
    fn deserialize<D: serde::Deserializer<'de>>(_deserializer: D) -> Result<Self, D::Error> {
        Err(serde::de::Error::custom(crate::Error::UnsupportedOperation(
            "script resources cannot be deserialized".to_string(),
        )))
    }
}

// An exception value carries no reference count, wrapping it is only a tag check.
fn check_exception<'js>(ctx: &Ctx<'js>, raw: qjs::JSValue) -> rquickjs::Result<Value<'js>> {
    // SAFETY: `raw` was just returned by the engine for `ctx` and its reference is owned here
    let value = unsafe { Value::from_raw(ctx.clone(), raw) };
    if value.type_of() == Type::Exception {
        return Err(rquickjs::Error::Exception);
    }
    Ok(value)
}

/// Compile `source` as a global script without running it.
pub(crate) fn compile<'js>(
    ctx: &Ctx<'js>,
    source: &str,
    identifier: &str,
) -> rquickjs::Result<Value<'js>> {
    let Ok(csource) = CString::new(source) else {
        return Err(Exception::throw_syntax(ctx, "script source contains a NUL byte"));
    };
    let Ok(cidentifier) = CString::new(identifier) else {
        return Err(Exception::throw_syntax(ctx, "script identifier contains a NUL byte"));
    };
    let flags = (qjs::JS_EVAL_TYPE_GLOBAL | qjs::JS_EVAL_FLAG_COMPILE_ONLY) as i32;
    // SAFETY: `ctx` is live for the duration of the call and both strings are NUL terminated
    let raw = unsafe {
        qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            csource.as_ptr(),
            csource.as_bytes().len() as _,
            cidentifier.as_ptr(),
            flags,
        )
    };
    check_exception(ctx, raw)
}

/// Run bytecode produced by [`compile`], returning the completion value of the script.
pub(crate) fn run<'js>(ctx: &Ctx<'js>, compiled: &Value<'js>) -> rquickjs::Result<Value<'js>> {
    let ptr = ctx.as_raw().as_ptr();
    // SAFETY: the evaluation consumes one reference to the bytecode, so a fresh one is passed
    // and `compiled` stays valid for later runs
    let raw = unsafe { qjs::JS_EvalFunction(ptr, qjs::JS_DupValue(ptr, compiled.as_raw())) };
    check_exception(ctx, raw)
}
