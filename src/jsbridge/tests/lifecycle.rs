//! Snapshots, disposal and teardown.

#![allow(clippy::disallowed_macros)]

mod common;

use std::sync::Arc;
use std::thread;

use common::Counter;
use jsbridge::{
    ContextBuilder, Error, ExecuteOptions, ExecutionContext, HostFunction, HostValue,
    SnapshotBlob,
};

fn run(context: &ExecutionContext, source: &str) -> jsbridge::Result<HostValue> {
    context.execute_string(source, None, ExecuteOptions::default())
}

#[test]
fn snapshots_seed_new_contexts() {
    let blob = ExecutionContext::create_snapshot(
        "var greeting = 'hi'; function twice(x) { return x * 2; }",
    )
    .unwrap();
    let mut globals = blob.globals().unwrap();
    globals.sort();
    assert_eq!(globals, vec!["greeting", "twice"]);

    let context = ContextBuilder::new()
        .with_snapshot(blob.clone())
        .build()
        .unwrap();
    assert_eq!(run(&context, "twice(21)").unwrap(), HostValue::Int(42));
    assert_eq!(run(&context, "greeting").unwrap(), HostValue::from("hi"));

    // blobs survive a trip through bytes
    let copy = SnapshotBlob::from_bytes(blob.as_bytes().to_vec());
    let context = ContextBuilder::new().with_snapshot(copy).build().unwrap();
    assert_eq!(run(&context, "twice(2)").unwrap(), HostValue::Int(4));
}

#[test]
fn bad_snapshots_are_rejected() {
    assert!(ExecutionContext::create_snapshot("").is_none());
    assert!(ExecutionContext::create_snapshot("throw new Error('seed')").is_none());

    let garbage = SnapshotBlob::from_bytes(b"\x00\x01".to_vec());
    let err = ContextBuilder::new()
        .with_snapshot(garbage)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let blob = ExecutionContext::create_snapshot("var a = 1;").unwrap();
    let err = ContextBuilder::new()
        .with_max_string_length(8)
        .with_snapshot(blob)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn dispose_releases_everything() {
    let counter = Arc::new(Counter::new(0));
    let context = ContextBuilder::new()
        .with_object_name("App")
        .with_host_object(counter.clone())
        .with_variable("mode", "test")
        .build()
        .unwrap();
    let exported = counter.clone();
    context
        .register_function(
            "getCounter",
            HostFunction::new("getCounter", move |_scope, _args| {
                Ok(HostValue::Object(exported.clone()))
            }),
        )
        .unwrap();

    let script = context.compile("App.increment()", Some("inc.js")).unwrap();
    context.execute(&script, ExecuteOptions::default()).unwrap();
    let guest = run(&context, "globalThis.kept = getCounter(); (x) => x").unwrap();
    let guest = guest.as_guest().unwrap().clone();

    let report = context.dispose().unwrap();
    assert!(report.is_clean(), "{:?}", report.issues);
    assert_eq!(report.released.accessors, 1);
    assert_eq!(report.released.call_wrappers, 1);
    assert_eq!(report.released.templates, 1);
    assert_eq!(report.released.method_wrappers, 3);
    assert_eq!(report.released.exported_objects, 1);
    assert_eq!(report.released.scripts, 1);
    assert_eq!(report.released.guest_objects, 1);

    // everything that referred to the context is now inert
    assert!(!script.is_valid());
    assert!(!context.is_constructed());
    assert!(matches!(guest.call(vec![]), Err(Error::Disposed)));
    assert!(matches!(run(&context, "1"), Err(Error::Disposed)));
    assert!(matches!(context.statistics(), Err(Error::Disposed)));

    // disposal happens once
    let again = context.dispose().unwrap();
    assert_eq!(again.released.total(), 0);
    assert!(again.is_clean());
    drop(context);
    assert_eq!(Arc::strong_count(&counter), 1);
}

#[test]
fn guest_handles_outliving_their_context() {
    let context = ContextBuilder::new().build().unwrap();
    let f = run(&context, "(function () { return 1; })").unwrap();
    drop(context);
    assert!(matches!(
        f.as_guest().unwrap().call(vec![]),
        Err(Error::Disposed)
    ));
}

#[test]
fn dispose_from_inside_an_execution_is_refused() {
    let context = Arc::new(ContextBuilder::new().build().unwrap());
    let weak = Arc::downgrade(&context);
    context
        .register_function(
            "dispose",
            HostFunction::new("dispose", move |_scope, _args| {
                let context = weak.upgrade().ok_or_else(|| anyhow::anyhow!("gone"))?;
                match context.dispose() {
                    Err(Error::Reentrant) => Ok(HostValue::from("refused")),
                    other => Ok(HostValue::from(format!("{other:?}"))),
                }
            }),
        )
        .unwrap();

    assert_eq!(run(&context, "dispose()").unwrap(), HostValue::from("refused"));
    assert!(context.is_constructed());
    assert_eq!(run(&context, "1").unwrap(), HostValue::Int(1));
}

#[test]
fn reentry_is_refused_while_another_thread_contends() {
    let context = Arc::new(ContextBuilder::new().build().unwrap());
    let weak = Arc::downgrade(&context);
    context
        .register_function(
            "reenter",
            HostFunction::new("reenter", move |_scope, _args| {
                let context = weak.upgrade().ok_or_else(|| anyhow::anyhow!("gone"))?;
                match context.execute_string("1", None, ExecuteOptions::default()) {
                    Err(Error::Reentrant) => Ok(HostValue::Bool(true)),
                    other => Ok(HostValue::from(format!("{other:?}"))),
                }
            }),
        )
        .unwrap();

    // the other thread keeps taking the engine lock as soon as this one releases it
    let contender = context.clone();
    let handle = thread::spawn(move || {
        for _ in 0..500 {
            run(&contender, "1").unwrap();
        }
    });
    for _ in 0..500 {
        assert_eq!(run(&context, "reenter()").unwrap(), HostValue::Bool(true));
    }
    handle.join().unwrap();
}

#[test]
fn script_resources_do_not_serialize() {
    let context = ContextBuilder::new().build().unwrap();
    let script = context.compile("1", None).unwrap();
    assert!(serde_json::to_string(&script).is_err());
    assert!(serde_json::from_str::<jsbridge::ScriptResource>("{}").is_err());
}
