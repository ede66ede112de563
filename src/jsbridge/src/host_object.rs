//! The trait through which host objects expose members to guest code.

use std::any::Any;

use crate::context::CallScope;
use crate::value::HostValue;

/// Member names that are never published to the guest, even when a host object reports them.
///
/// These cover construction, destruction, cloning, serialization hooks and magic accessors.
pub const EXCLUDED_MEMBERS: &[&str] = &[
    "new",
    "constructor",
    "drop",
    "clone",
    "serialize",
    "deserialize",
    "__get",
    "__set",
    "__unset",
    "__isset",
    "__call",
    "__invoke",
    "__toString",
    "__sleep",
    "__wakeup",
];

/// Returns true if `name` may be published to the guest.
pub fn is_exportable_member(name: &str) -> bool {
    !name.is_empty() && !EXCLUDED_MEMBERS.contains(&name)
}

/// A host object that can be exported to guest code by reference.
///
/// Guest property reads call [`get_property`](HostObject::get_property) on every access and
/// guest writes call [`set_property`](HostObject::set_property), so the guest always observes the
/// current host state. Methods are looked up once per implementing type and
/// [`class_name`](HostObject::class_name), so every instance of a type reporting the same class
/// name must report the same method names.
pub trait HostObject: Any + Send + Sync {
    /// The class name, used with the implementing type as the key for method caching.
    fn class_name(&self) -> &str {
        "Object"
    }

    /// Names of the properties visible to the guest.
    fn property_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Read a property. `None` reads as `undefined`.
    fn get_property(&self, _name: &str) -> Option<HostValue> {
        None
    }

    /// Write a property from the guest. Properties are read-only unless this is overridden.
    fn set_property(&self, name: &str, _value: HostValue) -> anyhow::Result<()> {
        anyhow::bail!("Cannot assign to read only property '{name}'")
    }

    /// Names of the methods visible to the guest.
    fn method_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invoke a method from the guest.
    fn call_method(
        &self,
        _scope: &CallScope<'_, '_>,
        name: &str,
        _args: Vec<HostValue>,
    ) -> anyhow::Result<HostValue> {
        anyhow::bail!("{}.{name} is not a function", self.class_name())
    }
}
