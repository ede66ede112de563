use std::io::Write;
use std::sync::Arc;

use rquickjs::object::Property;
use rquickjs::prelude::Rest;
use rquickjs::{Coerced, Ctx, Function, Object};

use super::modules::require_function;
use crate::bridge::Bridge;
use crate::error::Result;

/// Receives the text of guest `print` and `console.log` calls.
pub type PrintFn = dyn Fn(&str) + Send + Sync;

pub(crate) fn stdout_print() -> Arc<PrintFn> {
    Arc::new(|txt: &str| {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(txt.as_bytes());
        let _ = out.flush();
    })
}

fn join(txt: Rest<Coerced<String>>) -> String {
    let mut txt = txt
        .into_inner()
        .into_iter()
        .map(|mut c| {
            c.0.push(' ');
            c.0
        })
        .collect::<String>();
    txt.pop(); // remove the last space
    txt
}

/// Install `print`, `console` and `require` on the global object.
pub(crate) fn setup(ctx: &Ctx<'_>, bridge: &Bridge, print: Arc<PrintFn>) -> Result<()> {
    let globals = ctx.globals();

    let out = print.clone();
    let print_fn = Function::new(ctx.clone(), move |txt: Rest<Coerced<String>>| {
        out(&join(txt));
    })?
    .with_name("print")?;
    globals.prop("print", Property::from(print_fn))?;

    let console = Object::new(ctx.clone())?;
    let log = Function::new(ctx.clone(), move |txt: Rest<Coerced<String>>| {
        let mut txt = join(txt);
        txt.push('\n');
        print(&txt);
    })?
    .with_name("log")?;
    console.set("log", log)?;
    globals.prop("console", Property::from(console))?;

    let require = require_function(ctx, bridge, String::new())?;
    globals.prop("require", Property::from(require))?;
    Ok(())
}
