//! This crate embeds a QuickJS engine in a Rust host and bridges host objects and guest values,
//! with watchdog enforced time and memory limits.
#![deny(dead_code, missing_docs, unused_mut)]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(any(test, debug_assertions), allow(clippy::disallowed_macros))]

mod bridge;
mod context;
mod error;
mod guest_object;
mod handle_cache;
mod host_object;
mod metrics;
mod script;
mod snapshot;
mod value;

/// The watchdog thread that enforces time and memory limits.
pub mod watchdog;

/// Per call information handed to host callbacks, used to re-enter the context.
pub use context::CallScope;
/// A builder for creating a constructed `ExecutionContext`.
pub use context::builder::ContextBuilder;
/// Module resolution hooks and the default path normaliser.
pub use context::modules::{ModuleLoaderFn, ModuleNormaliserFn, default_normalise};
/// The function guest `print` and `console.log` output is routed to.
pub use context::globals::PrintFn;
/// An embedded engine instance and everything it owns.
pub use context::{
    ConstructOptions, ContextId, ContextSettings, ContextStatistics, DEFAULT_OBJECT_NAME,
    DEFAULT_SCRIPT_IDENTIFIER, ExecuteOptions, ExecutionContext, ExecutionFlags,
    MAX_STRING_LENGTH, ReleaseCounts, TeardownReport, VariableSlot,
};
/// The error types of this crate.
pub use error::{Error, GuestException, LimitKind, Result};
/// A host side handle to a guest object.
pub use guest_object::GuestObject;
/// Host objects exported to guest code by reference.
pub use host_object::{EXCLUDED_MEMBERS, HostObject, is_exportable_member};
/// A compiled script bound to the context that compiled it.
pub use script::ScriptResource;
/// An opaque image used to pre-populate new contexts.
pub use snapshot::SnapshotBlob;
/// Values crossing the bridge.
pub use value::{HostCallback, HostFunction, HostValue};
/// The watchdog service.
pub use watchdog::Watchdog;
