//! Host side representation of values crossing the bridge.

use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::context::CallScope;
use crate::guest_object::GuestObject;
use crate::host_object::HostObject;

/// A value on the host side of the bridge.
///
/// Scalars, arrays and maps are copied across the boundary. Host objects, host functions and
/// guest handles are passed by reference, and keep their identity on both sides.
#[derive(Clone, Default)]
pub enum HostValue {
    /// `undefined`
    #[default]
    Undefined,
    /// `null`
    Null,
    /// A boolean
    Bool(bool),
    /// An integer
    Int(i64),
    /// A floating point number, including NaN and infinities
    Float(f64),
    /// A string
    String(String),
    /// An ordered sequence
    Array(Vec<HostValue>),
    /// A map with insertion ordered keys
    Map(IndexMap<String, HostValue>),
    /// A host object, exported to the guest by reference
    Object(Arc<dyn HostObject>),
    /// A host closure, exported to the guest by reference
    Function(HostFunction),
    /// A handle to a guest object
    Guest(GuestObject),
}

impl HostValue {
    /// Returns true for `undefined` and `null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    /// The value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The value as an integer, accepting integral floats.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            HostValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    /// The value as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// The value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a guest handle, if it is one.
    pub fn as_guest(&self) -> Option<&GuestObject> {
        match self {
            HostValue::Guest(g) => Some(g),
            _ => None,
        }
    }

    /// A short name for the variant, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) | HostValue::Float(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Array(_) => "array",
            HostValue::Map(_) => "map",
            HostValue::Object(_) => "host object",
            HostValue::Function(_) => "host function",
            HostValue::Guest(_) => "guest object",
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => f.write_str("Undefined"),
            HostValue::Null => f.write_str("Null"),
            HostValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            HostValue::Int(i) => f.debug_tuple("Int").field(i).finish(),
            HostValue::Float(x) => f.debug_tuple("Float").field(x).finish(),
            HostValue::String(s) => f.debug_tuple("String").field(s).finish(),
            HostValue::Array(a) => f.debug_tuple("Array").field(a).finish(),
            HostValue::Map(m) => f.debug_tuple("Map").field(m).finish(),
            HostValue::Object(o) => f.debug_tuple("Object").field(&o.class_name()).finish(),
            HostValue::Function(func) => f.debug_tuple("Function").field(&func.name()).finish(),
            HostValue::Guest(g) => f.debug_tuple("Guest").field(g).finish(),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::Float(a), HostValue::Float(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Array(a), HostValue::Array(b)) => a == b,
            (HostValue::Map(a), HostValue::Map(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => Arc::ptr_eq(a, b),
            (HostValue::Function(a), HostValue::Function(b)) => a.identity() == b.identity(),
            (HostValue::Guest(a), HostValue::Guest(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Int(value.into())
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        HostValue::Int(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Float(value)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(value: Vec<HostValue>) -> Self {
        HostValue::Array(value)
    }
}

impl From<IndexMap<String, HostValue>> for HostValue {
    fn from(value: IndexMap<String, HostValue>) -> Self {
        HostValue::Map(value)
    }
}

impl From<HostFunction> for HostValue {
    fn from(value: HostFunction) -> Self {
        HostValue::Function(value)
    }
}

impl From<GuestObject> for HostValue {
    fn from(value: GuestObject) -> Self {
        HostValue::Guest(value)
    }
}

impl<T: HostObject> From<Arc<T>> for HostValue {
    fn from(value: Arc<T>) -> Self {
        HostValue::Object(value)
    }
}

// References cannot be represented in JSON, so serialization of them fails
impl Serialize for HostValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error;
        match self {
            HostValue::Undefined | HostValue::Null => serializer.serialize_none(),
            HostValue::Bool(b) => serializer.serialize_bool(*b),
            HostValue::Int(i) => serializer.serialize_i64(*i),
            HostValue::Float(f) => serializer.serialize_f64(*f),
            HostValue::String(s) => serializer.serialize_str(s),
            HostValue::Array(arr) => arr.serialize(serializer),
            HostValue::Map(map) => map.serialize(serializer),
            other => Err(Error::custom(format!(
                "a {} is passed by reference and cannot be serialized",
                other.type_name()
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for HostValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct HostValueVisitor;

        impl<'de> Visitor<'de> for HostValueVisitor {
            type Value = HostValue;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, a boolean, a number, a string, an array or a map")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
                Ok(HostValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
                Ok(HostValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                match i64::try_from(value) {
                    Ok(value) => Ok(HostValue::Int(value)),
                    Err(_) => Ok(HostValue::Float(value as f64)),
                }
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
                Ok(HostValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
                Ok(HostValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
                Ok(HostValue::String(value))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(HostValue::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(HostValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(HostValue::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(HostValue::Map(obj))
            }
        }

        deserializer.deserialize_any(HostValueVisitor)
    }
}

/// The signature of a host callback invoked from guest code.
pub type HostCallback =
    dyn Fn(&CallScope<'_, '_>, Vec<HostValue>) -> anyhow::Result<HostValue> + Send + Sync;

/// A host function that can be called from guest code.
///
/// Cloning is cheap and preserves identity: every clone maps to the same guest function.
#[derive(Clone)]
pub struct HostFunction {
    name: Arc<str>,
    func: Arc<HostCallback>,
}

impl HostFunction {
    /// Create a new `HostFunction` from a closure working on [`HostValue`]s directly.
    ///
    /// The closure receives a [`CallScope`] that can be used to re-enter the context.
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&CallScope<'_, '_>, Vec<HostValue>) -> anyhow::Result<HostValue>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        let name: String = name.into();
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Create a new `HostFunction` from a closure that takes and returns any type that can be
    /// (de)serialized by `serde`.
    ///
    /// The guest arguments are deserialized as a tuple, so a closure taking `(String, i32)` is
    /// called as `f("a", 1)` from the guest.
    pub fn typed<Args: DeserializeOwned, Output: Serialize>(
        name: impl Into<String>,
        func: impl fn_traits::Fn<Args, Output = anyhow::Result<Output>> + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            name,
            move |_scope: &CallScope<'_, '_>, args: Vec<HostValue>| -> anyhow::Result<HostValue> {
                let args = serde_json::to_value(HostValue::Array(args))
                    .context("Serializing host function arguments")?;
                let args: Args = serde_json::from_value(args)
                    .context("Deserializing arguments for host function")?;
                let output: Output = func.call(args)?;
                let output = serde_json::to_value(&output)
                    .context("Serializing output of host function")?;
                serde_json::from_value(output).context("Converting output of host function")
            },
        )
    }

    /// The name the function is exposed under in the guest.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identity of the underlying closure, shared by all clones.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.func) as *const () as usize
    }

    pub(crate) fn call(
        &self,
        scope: &CallScope<'_, '_>,
        args: Vec<HostValue>,
    ) -> anyhow::Result<HostValue> {
        (self.func)(scope, args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
