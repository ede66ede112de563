//! Watchdog enforced time and memory limits.

#![allow(clippy::disallowed_macros)]

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use common::register_tally;
use jsbridge::{
    CallScope, ContextBuilder, Error, ExecuteOptions, ExecutionFlags, HostFunction, HostValue,
    LimitKind, Watchdog,
};

const SPIN: &str = "while (true) {}";
const ALLOCATE: &str =
    "(function () { const a = []; while (true) { a.push(new Array(1000).fill(1)); } })()";

#[test]
fn time_limit_aborts_infinite_loops() {
    let context = ContextBuilder::new()
        .with_time_limit(Duration::from_millis(50))
        .build()
        .unwrap();

    let start = Instant::now();
    let err = context
        .execute_string(SPIN, None, ExecuteOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::ResourceLimitExceeded(LimitKind::Time)));
    assert!(err.is_fatal());
    assert!(start.elapsed() < Duration::from_secs(5));

    // the context recovers for the next execution
    let result = context
        .execute_string("1 + 1", None, ExecuteOptions::default())
        .unwrap();
    assert_eq!(result, HostValue::Int(2));
}

#[test]
fn guest_code_cannot_catch_a_termination() {
    let context = ContextBuilder::new()
        .with_time_limit(Duration::from_millis(30))
        .build()
        .unwrap();
    let err = context
        .execute_string(
            "while (true) { try { while (true) {} } catch (e) {} }",
            None,
            ExecuteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::ResourceLimitExceeded(LimitKind::Time)));
}

#[test]
fn explicit_limits_win_over_defaults() {
    let context = ContextBuilder::new()
        .with_time_limit(Duration::from_secs(60))
        .build()
        .unwrap();
    let options = ExecuteOptions::default().with_time_limit(Duration::from_millis(30));
    let start = Instant::now();
    let err = context.execute_string(SPIN, None, options).unwrap_err();
    assert!(matches!(err, Error::ResourceLimitExceeded(LimitKind::Time)));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn memory_limit_aborts_runaway_allocation() {
    let watchdog = Arc::new(Watchdog::with_poll_interval(Duration::from_millis(2)));
    let context = ContextBuilder::new()
        .with_watchdog(watchdog.clone())
        .with_memory_limit(16 * 1024 * 1024)
        .build()
        .unwrap();

    let err = context
        .execute_string(ALLOCATE, None, ExecuteOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::ResourceLimitExceeded(LimitKind::Memory)));
    assert!(watchdog.is_running());
    assert_eq!(watchdog.active_executions(), 0);

    context.collect_garbage().unwrap();
    let result = context
        .execute_string("'still ' + 'alive'", None, ExecuteOptions::default())
        .unwrap();
    assert_eq!(result, HostValue::from("still alive"));
}

#[test]
fn unlimited_executions_do_not_start_a_watchdog() {
    let watchdog = Arc::new(Watchdog::new());
    let context = ContextBuilder::new()
        .with_watchdog(watchdog.clone())
        .build()
        .unwrap();
    context
        .execute_string("1", None, ExecuteOptions::default())
        .unwrap();
    assert!(!watchdog.is_running());
}

#[test]
fn limits_set_from_a_callback_apply_to_the_running_execution() {
    let watchdog = Arc::new(Watchdog::new());
    let context = ContextBuilder::new()
        .with_watchdog(watchdog.clone())
        .build()
        .unwrap();
    context
        .register_function(
            "limit",
            HostFunction::new("limit", |scope: &CallScope<'_, '_>, _args| {
                scope.set_time_limit(Duration::from_millis(30));
                Ok(HostValue::Undefined)
            }),
        )
        .unwrap();

    let err = context
        .execute_string(&format!("limit(); {SPIN}"), None, ExecuteOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::ResourceLimitExceeded(LimitKind::Time)));
    assert!(watchdog.is_running());
    assert_eq!(context.time_limit(), Duration::from_millis(30));
}

#[test]
fn limits_set_from_another_thread_apply_to_the_running_execution() {
    let context = Arc::new(ContextBuilder::new().build().unwrap());
    let setter = context.clone();
    let handle = thread::spawn(move || {
        while !setter.in_execution() {
            thread::sleep(Duration::from_millis(1));
        }
        setter.set_time_limit(Duration::from_millis(20));
    });

    let err = context
        .execute_string(SPIN, None, ExecuteOptions::default())
        .unwrap_err();
    handle.join().unwrap();
    assert!(matches!(err, Error::ResourceLimitExceeded(LimitKind::Time)));
    assert!(!context.in_execution());
}

#[test]
fn terminations_unwind_nested_executions() {
    let context = ContextBuilder::new()
        .with_time_limit(Duration::from_millis(50))
        .build()
        .unwrap();
    context
        .register_function(
            "spin",
            HostFunction::new("spin", |scope: &CallScope<'_, '_>, _args| {
                Ok(scope.execute_string(SPIN, None, ExecutionFlags::NONE)?)
            }),
        )
        .unwrap();

    let handled = register_tally(&context, "note");

    let err = context
        .execute_string(
            "try { spin() } catch (e) { note(String(e)) } finally { note('finally') }",
            None,
            ExecuteOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::ResourceLimitExceeded(LimitKind::Time)));
    // the outer frame was unwound without running its handlers
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[test]
fn each_context_is_checked_on_its_own() {
    let watchdog = Arc::new(Watchdog::new());
    let limited = Arc::new(
        ContextBuilder::new()
            .with_watchdog(watchdog.clone())
            .with_time_limit(Duration::from_millis(30))
            .build()
            .unwrap(),
    );
    let unlimited = ContextBuilder::new()
        .with_watchdog(watchdog)
        .build()
        .unwrap();

    let handle = thread::spawn(move || {
        limited
            .execute_string(SPIN, None, ExecuteOptions::default())
            .unwrap_err()
    });
    let result = unlimited
        .execute_string(
            "let n = 0; for (let i = 0; i < 1000; i++) n += i; n",
            None,
            ExecuteOptions::default(),
        )
        .unwrap();
    assert_eq!(result, HostValue::Int(499500));
    let err = handle.join().unwrap();
    assert!(matches!(err, Error::ResourceLimitExceeded(LimitKind::Time)));
}
