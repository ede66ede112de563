//! Host side handles to guest objects.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::context::{ContextId, ContextInner};
use crate::error::{Error, Result};
use crate::handle_cache::{Release, ReleaseQueue};
use crate::value::HostValue;

static NEXT_GUEST_ID: AtomicU64 = AtomicU64::new(1);

/// An operation on a guest object.
#[derive(Clone, Copy)]
pub(crate) enum GuestOp<'a> {
    Get(&'a str),
    Set(&'a str, &'a HostValue),
    Delete(&'a str),
    Call(&'a [HostValue]),
    CallMethod(&'a str, &'a [HostValue]),
}

/// A handle to a guest object, typically a guest function returned to the host.
///
/// The guest object stays alive while any clone of the handle exists. Operations on the handle
/// run as executions of the owning context, under its default limits. From inside a host
/// callback use the equivalent [`CallScope`](crate::CallScope) methods instead, the context is
/// already locked by the running execution.
#[derive(Clone)]
pub struct GuestObject {
    inner: Arc<GuestInner>,
}

struct GuestInner {
    id: u64,
    context: ContextId,
    owner: Weak<ContextInner>,
    releases: ReleaseQueue,
    function: bool,
}

impl GuestObject {
    pub(crate) fn new(
        context: ContextId,
        owner: Weak<ContextInner>,
        releases: ReleaseQueue,
        function: bool,
    ) -> Self {
        Self {
            inner: Arc::new(GuestInner {
                id: NEXT_GUEST_ID.fetch_add(1, Ordering::Relaxed),
                context,
                owner,
                releases,
                function,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// The context this object lives in.
    pub fn context_id(&self) -> ContextId {
        self.inner.context
    }

    /// Returns true if the guest object is callable.
    pub fn is_function(&self) -> bool {
        self.inner.function
    }

    /// Read a property.
    pub fn get(&self, name: &str) -> Result<HostValue> {
        self.dispatch(GuestOp::Get(name))
    }

    /// Write a property.
    pub fn set(&self, name: &str, value: HostValue) -> Result<()> {
        self.dispatch(GuestOp::Set(name, &value)).map(|_| ())
    }

    /// Delete a property, returning whether the guest allowed the deletion.
    pub fn delete(&self, name: &str) -> Result<bool> {
        self.dispatch(GuestOp::Delete(name))
            .map(|deleted| deleted.as_bool().unwrap_or(false))
    }

    /// Call the object as a function with an undefined receiver.
    pub fn call(&self, args: Vec<HostValue>) -> Result<HostValue> {
        self.dispatch(GuestOp::Call(&args))
    }

    /// Call the method `name` with this object as the receiver.
    pub fn call_method(&self, name: &str, args: Vec<HostValue>) -> Result<HostValue> {
        self.dispatch(GuestOp::CallMethod(name, &args))
    }

    fn dispatch(&self, op: GuestOp<'_>) -> Result<HostValue> {
        let owner = self.inner.owner.upgrade().ok_or(Error::Disposed)?;
        owner.run_guest_op(self, op)
    }
}

impl Drop for GuestInner {
    fn drop(&mut self) {
        self.releases.push(Release::Guest(self.id));
    }
}

impl fmt::Debug for GuestObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestObject")
            .field("id", &self.inner.id)
            .field("context", &self.inner.context)
            .field("function", &self.inner.function)
            .finish()
    }
}

impl PartialEq for GuestObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Serialize for GuestObject {
    fn serialize<S: serde::Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom(Error::UnsupportedOperation(
            "guest objects cannot be serialized".to_string(),
        )))
    }
}

impl<'de> Deserialize<'de> for GuestObject {
    fn deserialize<D: serde::Deserializer<'de>>(
        _deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Err(serde::de::Error::custom(Error::UnsupportedOperation(
            "guest objects cannot be deserialized".to_string(),
        )))
    }
}
