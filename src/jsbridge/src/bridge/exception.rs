//! Translation of guest exceptions into host errors.

use rquickjs::{CaughtError, Coerced, Ctx, Exception, Object, Value, qjs};

use crate::error::{Error, GuestException, Result};

/// Converts a failed engine call into a host error, taking the pending guest exception.
///
/// `into` decides whether a guest exception is reported as a compile or a runtime error.
pub(crate) trait CatchJsErrorExt {
    type Ok;
    fn catch_guest(self, ctx: &Ctx<'_>, into: fn(GuestException) -> Error) -> Result<Self::Ok>;
}

impl<T> CatchJsErrorExt for rquickjs::Result<T> {
    type Ok = T;
    fn catch_guest(self, ctx: &Ctx<'_>, into: fn(GuestException) -> Error) -> Result<T> {
        match rquickjs::CatchResultExt::catch(self, ctx) {
            Ok(value) => Ok(value),
            Err(caught) => Err(caught_to_error(caught, into)),
        }
    }
}

impl<T> CatchJsErrorExt for Result<T> {
    type Ok = T;
    fn catch_guest(self, ctx: &Ctx<'_>, into: fn(GuestException) -> Error) -> Result<T> {
        match self {
            Err(Error::Engine(e)) => Err::<T, _>(e).catch_guest(ctx, into),
            other => other,
        }
    }
}

/// Throw an error that skips every guest `catch` and `finally` block and promise handler, the
/// same way the engine unwinds an interrupted execution.
pub(crate) fn throw_uncatchable(ctx: &Ctx<'_>, message: &str) -> rquickjs::Error {
    let error = match Exception::from_message(ctx.clone(), message) {
        Ok(exception) => exception.into_object().into_value(),
        Err(e) => return e,
    };
    // SAFETY: `error` is a live error object owned by this context.
    unsafe { qjs::JS_SetUncatchableError(ctx.as_raw().as_ptr(), error.as_raw()) };
    ctx.throw(error)
}

fn caught_to_error(caught: CaughtError<'_>, into: fn(GuestException) -> Error) -> Error {
    match caught {
        CaughtError::Error(e) => Error::Engine(e),
        CaughtError::Exception(e) => into(exception_from_object(e.as_object())),
        CaughtError::Value(value) => into(GuestException::new(stringify(&value))),
    }
}

// Non-error throws (`throw 42`, `throw {}`) report their string conversion.
fn stringify(value: &Value<'_>) -> String {
    match value.get::<Coerced<String>>() {
        Ok(s) => s.0,
        Err(_) => {
            // a symbol cannot be converted, drop the conversion exception
            let _ = value.ctx().catch();
            format!("uncaught {:?} value", value.type_of())
        }
    }
}

/// Read the standard error properties off a guest exception object.
pub(crate) fn exception_from_object(object: &Object<'_>) -> GuestException {
    let string = |key: &str| {
        object
            .get::<_, Option<Coerced<String>>>(key)
            .ok()
            .flatten()
            .map(|s| s.0)
    };
    let number = |key: &str| {
        object
            .get::<_, Option<f64>>(key)
            .ok()
            .flatten()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n as u32)
    };

    let mut exception = GuestException {
        name: string("name"),
        message: string("message").unwrap_or_default(),
        stack: string("stack").filter(|s| !s.is_empty()),
        file: string("fileName"),
        line: number("lineNumber"),
        column: number("columnNumber"),
    };

    if exception.line.is_none()
        && let Some((file, line, column)) =
            exception.stack.as_deref().and_then(parse_stack_location)
    {
        exception.file.get_or_insert(file);
        exception.line = Some(line);
        exception.column = column;
    }
    exception
}

/// The location of the first frame of a guest stack trace that has one.
///
/// Frames look like `    at fn (file.js:3:7)` or `    at file.js:3`.
pub(crate) fn parse_stack_location(stack: &str) -> Option<(String, u32, Option<u32>)> {
    stack
        .lines()
        .map(str::trim)
        .filter_map(|frame| frame.strip_prefix("at "))
        .find_map(|frame| {
            let location = match (frame.rfind('('), frame.rfind(')')) {
                (Some(open), Some(close)) if open < close => &frame[open + 1..close],
                _ => frame.trim(),
            };
            parse_location(location)
        })
}

fn parse_location(location: &str) -> Option<(String, u32, Option<u32>)> {
    let (rest, last) = location.rsplit_once(':')?;
    let last: u32 = last.parse().ok()?;
    match rest.rsplit_once(':') {
        Some((file, line)) if !file.is_empty() => match line.parse::<u32>() {
            Ok(line) => Some((file.to_string(), line, Some(last))),
            Err(_) => Some((rest.to_string(), last, None)),
        },
        _ if !rest.is_empty() => Some((rest.to_string(), last, None)),
        _ => None,
    }
}
