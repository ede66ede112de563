//! Host objects shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use jsbridge::{CallScope, ExecutionContext, HostFunction, HostObject, HostValue};

/// Register a global function `name` that counts how often the guest calls it.
pub fn register_tally(context: &ExecutionContext, name: &str) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    context
        .register_function(
            name,
            HostFunction::new(name, move |_scope, _args| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(HostValue::Undefined)
            }),
        )
        .unwrap();
    calls
}

/// A host object with one writable property and a few methods.
pub struct Counter {
    count: Mutex<i64>,
}

impl Counter {
    pub fn new(count: i64) -> Self {
        Self {
            count: Mutex::new(count),
        }
    }

    pub fn count(&self) -> i64 {
        *self.count.lock().unwrap()
    }

    pub fn set(&self, count: i64) {
        *self.count.lock().unwrap() = count;
    }
}

impl HostObject for Counter {
    fn class_name(&self) -> &str {
        "Counter"
    }

    fn property_names(&self) -> Vec<String> {
        vec!["count".to_string()]
    }

    fn get_property(&self, name: &str) -> Option<HostValue> {
        (name == "count").then(|| HostValue::Int(self.count()))
    }

    fn set_property(&self, name: &str, value: HostValue) -> Result<()> {
        match (name, value.as_i64()) {
            ("count", Some(count)) => {
                self.set(count);
                Ok(())
            }
            ("count", None) => bail!("count must be an integer, got {}", value.type_name()),
            _ => bail!("unknown property '{name}'"),
        }
    }

    fn method_names(&self) -> Vec<String> {
        ["increment", "add", "fail", "constructor"]
            .map(String::from)
            .to_vec()
    }

    fn call_method(
        &self,
        _scope: &CallScope<'_, '_>,
        name: &str,
        args: Vec<HostValue>,
    ) -> Result<HostValue> {
        let mut count = self.count.lock().unwrap();
        match name {
            "increment" => {
                *count += 1;
                Ok(HostValue::Int(*count))
            }
            "add" => {
                let Some(amount) = args.first().and_then(HostValue::as_i64) else {
                    bail!("add expects an integer");
                };
                *count += amount;
                Ok(HostValue::Int(*count))
            }
            "fail" => bail!("counter is broken"),
            _ => bail!("unknown method '{name}'"),
        }
    }
}
