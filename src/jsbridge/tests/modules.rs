//! Guest `require()` and dynamic `import()` through the host module hooks.

#![allow(clippy::disallowed_macros)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use jsbridge::{ContextBuilder, ExecuteOptions, ExecutionContext, HostValue};

fn modules() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        (
            "lib/math.js",
            "const util = require('./util.js'); exports.add = (a, b) => util.check(a) + b;",
        ),
        ("lib/util.js", "exports.check = (x) => x;"),
        ("lib/path.js", "module.exports = [__filename, __dirname];"),
        (
            "a.js",
            "exports.name = 'a'; const b = require('./b.js'); exports.fromB = b.name; exports.bSawA = b.sawA;",
        ),
        (
            "b.js",
            "const a = require('./a.js'); exports.name = 'b'; exports.sawA = a.name;",
        ),
        ("broken.js", "throw new Error('broken module');"),
        ("esm.js", "export const value = 42;"),
    ])
}

fn context_with_loader(loads: Arc<AtomicUsize>) -> ExecutionContext {
    let modules = modules();
    ContextBuilder::new()
        .with_module_loader(move |id| {
            loads.fetch_add(1, Ordering::SeqCst);
            modules
                .get(id)
                .map(|source| source.to_string())
                .ok_or_else(|| anyhow!("module '{id}' not found"))
        })
        .build()
        .unwrap()
}

fn run(context: &ExecutionContext, source: &str) -> HostValue {
    context
        .execute_string(source, None, ExecuteOptions::default())
        .unwrap()
}

#[test]
fn require_loads_and_caches_modules() {
    let loads = Arc::new(AtomicUsize::new(0));
    let context = context_with_loader(loads.clone());

    assert_eq!(
        run(&context, "require('./lib/math.js').add(2, 3)"),
        HostValue::Int(5)
    );
    assert_eq!(loads.load(Ordering::SeqCst), 2);

    assert_eq!(
        run(&context, "require('lib/math.js') === require('./lib/../lib/math.js')"),
        HostValue::Bool(true)
    );
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert_eq!(context.statistics().unwrap().modules, 2);
}

#[test]
fn modules_see_their_location() {
    let context = context_with_loader(Arc::default());
    assert_eq!(
        run(&context, "require('./lib/path.js')"),
        HostValue::Array(vec![HostValue::from("lib/path.js"), HostValue::from("lib")])
    );
}

#[test]
fn cyclic_requires_see_partial_exports() {
    let context = context_with_loader(Arc::default());
    let result = run(
        &context,
        "const a = require('./a.js'); [a.name, a.fromB, a.bSawA]",
    );
    assert_eq!(
        result,
        HostValue::Array(vec![
            HostValue::from("a"),
            HostValue::from("b"),
            HostValue::from("a"),
        ])
    );
}

#[test]
fn failed_modules_are_not_cached() {
    let loads = Arc::new(AtomicUsize::new(0));
    let context = context_with_loader(loads.clone());
    let source = "try { require('./broken.js') } catch (e) { e.message }";
    assert_eq!(run(&context, source), HostValue::from("broken module"));
    assert_eq!(run(&context, source), HostValue::from("broken module"));
    assert_eq!(loads.load(Ordering::SeqCst), 2);

    assert_eq!(
        run(&context, "try { require('./missing.js') } catch (e) { e.message }"),
        HostValue::from("module 'missing.js' not found")
    );
}

#[test]
fn require_without_a_loader_throws() {
    let context = ContextBuilder::new().build().unwrap();
    let message = run(&context, "try { require('./x.js') } catch (e) { e.message }");
    assert!(message.as_str().unwrap().contains("no module loader"));
}

#[test]
fn custom_normalisers_are_used() {
    let context = context_with_loader(Arc::default());
    context.set_module_normaliser(|_base, name| Ok(format!("lib/{name}.js")));
    assert_eq!(run(&context, "require('util').check(9)"), HostValue::Int(9));
}

#[test]
fn dynamic_import_uses_the_same_hooks() {
    let context = context_with_loader(Arc::default());
    assert_eq!(
        run(&context, "import('./esm.js').then((m) => m.value)"),
        HostValue::Int(42)
    );
}
