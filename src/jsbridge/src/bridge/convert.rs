//! Conversion of values between the host and the guest.

use indexmap::IndexMap;
use rquickjs::{Array, Class, Ctx, Object, Value};

use super::Bridge;
use super::wrapper::HostObjectHandle;
use crate::context::{ContextId, ExecutionFlags};
use crate::error::{Error, Result};
use crate::value::HostValue;

/// Values nested deeper than this are rejected, which also stops cycles.
pub(crate) const MAX_DEPTH: usize = 100;

/// Reject strings longer than `max` bytes.
pub(crate) fn check_string(value: &str, max: usize, what: &str) -> Result<()> {
    if value.len() > max {
        return Err(Error::InvalidArgument(format!(
            "{what} exceeds the maximum string length of {max} bytes"
        )));
    }
    Ok(())
}

fn too_deep() -> Error {
    Error::InvalidArgument(format!(
        "value is nested more than {MAX_DEPTH} levels deep or is cyclic"
    ))
}

/// Check a whole host value tree before any of it is handed to the guest.
pub(crate) fn validate(value: &HostValue, max: usize, context: ContextId) -> Result<()> {
    validate_at(value, max, context, 0)
}

fn validate_at(value: &HostValue, max: usize, context: ContextId, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }
    match value {
        HostValue::String(s) => check_string(s, max, "String"),
        HostValue::Array(items) => items
            .iter()
            .try_for_each(|item| validate_at(item, max, context, depth + 1)),
        HostValue::Map(map) => map.iter().try_for_each(|(key, item)| {
            check_string(key, max, "Property name")?;
            validate_at(item, max, context, depth + 1)
        }),
        HostValue::Guest(guest) if guest.context_id() != context => Err(Error::ContextMismatch),
        _ => Ok(()),
    }
}

impl Bridge {
    /// Convert a host value for the guest.
    pub(crate) fn to_guest<'js>(&self, ctx: &Ctx<'js>, value: &HostValue) -> Result<Value<'js>> {
        validate(value, self.shared.max_string_length(), self.shared.id)?;
        self.to_guest_unchecked(ctx, value)
    }

    fn to_guest_unchecked<'js>(&self, ctx: &Ctx<'js>, value: &HostValue) -> Result<Value<'js>> {
        let value = match value {
            HostValue::Undefined => Value::new_undefined(ctx.clone()),
            HostValue::Null => Value::new_null(ctx.clone()),
            HostValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
            HostValue::Int(i) => match i32::try_from(*i) {
                Ok(i) => Value::new_int(ctx.clone(), i),
                Err(_) => Value::new_float(ctx.clone(), *i as f64),
            },
            HostValue::Float(f) => Value::new_float(ctx.clone(), *f),
            HostValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
            HostValue::Array(items) => {
                let array = Array::new(ctx.clone())?;
                for (index, item) in items.iter().enumerate() {
                    array.set(index, self.to_guest_unchecked(ctx, item)?)?;
                }
                array.into_value()
            }
            HostValue::Map(map) => {
                let object = Object::new(ctx.clone())?;
                for (key, item) in map {
                    object.set(key.as_str(), self.to_guest_unchecked(ctx, item)?)?;
                }
                object.into_value()
            }
            HostValue::Object(object) => self.export_object(ctx, object)?,
            HostValue::Function(function) => self.export_function(ctx, function)?,
            HostValue::Guest(guest) => self.restore_guest(ctx, guest)?,
        };
        Ok(value)
    }

    /// Convert a guest value for the host.
    pub(crate) fn from_guest<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: Value<'js>,
        flags: ExecutionFlags,
    ) -> Result<HostValue> {
        self.from_guest_at(ctx, value, flags, 0)
    }

    fn from_guest_at<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: Value<'js>,
        flags: ExecutionFlags,
        depth: usize,
    ) -> Result<HostValue> {
        if depth > MAX_DEPTH {
            return Err(too_deep());
        }
        let max = self.shared.max_string_length();

        if value.is_undefined() {
            return Ok(HostValue::Undefined);
        }
        if value.is_null() {
            return Ok(HostValue::Null);
        }
        if let Some(b) = value.as_bool() {
            return Ok(HostValue::Bool(b));
        }
        if let Some(i) = value.as_int() {
            return Ok(HostValue::Int(i.into()));
        }
        if let Some(f) = value.as_float() {
            return Ok(HostValue::Float(f));
        }
        if let Some(s) = value.as_string() {
            let s = s.to_string()?;
            check_string(&s, max, "String")?;
            return Ok(HostValue::String(s));
        }
        if let Some(array) = value.as_array() {
            let mut items = Vec::with_capacity(array.len());
            for item in array.iter::<Value>() {
                items.push(self.from_guest_at(ctx, item?, flags, depth + 1)?);
            }
            return Ok(HostValue::Array(items));
        }
        if value.is_function() {
            return self.function_from_guest(ctx, value);
        }
        if let Ok(handle) = value.get::<Class<'js, HostObjectHandle>>() {
            return Ok(HostValue::Object(handle.borrow().object()));
        }
        if let Some(object) = value.as_object() {
            if flags.contains(ExecutionFlags::FORCE_ARRAY) {
                let mut items = Vec::new();
                for prop in object.props::<String, Value>() {
                    let (key, item) = prop?;
                    check_string(&key, max, "Property name")?;
                    items.push(self.from_guest_at(ctx, item, flags, depth + 1)?);
                }
                return Ok(HostValue::Array(items));
            }
            let mut map = IndexMap::new();
            for prop in object.props::<String, Value>() {
                let (key, item) = prop?;
                check_string(&key, max, "Property name")?;
                let item = self.from_guest_at(ctx, item, flags, depth + 1)?;
                map.insert(key, item);
            }
            return Ok(HostValue::Map(map));
        }
        if let Some(big) = value.as_big_int() {
            return Ok(HostValue::Int(big.clone().to_i64()?));
        }
        Err(Error::UnsupportedOperation(format!(
            "guest values of type {:?} cannot be passed to the host",
            value.type_of()
        )))
    }

    fn function_from_guest<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> Result<HostValue> {
        if let Some(key) = self.host_function_key(ctx, &value)?
            && let Some(function) = self.host_function(key)
        {
            return Ok(HostValue::Function(function));
        }
        Ok(HostValue::Guest(self.store_guest(ctx, value, true)))
    }
}
