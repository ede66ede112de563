/*!
Module resolution for guest `require()` and dynamic `import()`.

Both go through the same pair of host hooks: a normaliser turning a requested identifier into a
resolved one, and a loader returning the source for a resolved identifier. Modules loaded with
`require` are evaluated as CommonJS modules and cached per context by resolved identifier.
*/

use std::sync::Arc;

use anyhow::anyhow;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::prelude::This;
use rquickjs::{Ctx, Exception, Function, Module, Object, Value};

use super::ContextShared;
use crate::bridge::Bridge;
use crate::bridge::convert::check_string;
use crate::bridge::wrapper::coerce_fn_signature;
use crate::error::{Error, Result};
use crate::script;

/// Resolves the identifier requested by a module against the identifier of the requiring module.
pub type ModuleNormaliserFn = dyn Fn(&str, &str) -> anyhow::Result<String> + Send + Sync;

/// Returns the source of the module with the given resolved identifier.
pub type ModuleLoaderFn = dyn Fn(&str) -> anyhow::Result<String> + Send + Sync;

#[derive(Clone, Default)]
pub(crate) struct ModuleHooks {
    pub(crate) normaliser: Option<Arc<ModuleNormaliserFn>>,
    pub(crate) loader: Option<Arc<ModuleLoaderFn>>,
}

impl ModuleHooks {
    pub(crate) fn normalise(&self, base: &str, name: &str) -> anyhow::Result<String> {
        match &self.normaliser {
            Some(normaliser) => normaliser(base, name),
            None => Ok(default_normalise(base, name)),
        }
    }

    pub(crate) fn load(&self, id: &str) -> anyhow::Result<String> {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| anyhow!("no module loader is set, cannot load '{id}'"))?;
        loader(id)
    }
}

/// Resolve `name` against the directory `base`.
///
/// Names starting with `./` or `../` are joined to `base`; anything else is taken as is. `.` and
/// `..` segments are folded, `..` never climbs above the root of the identifier.
///
/// ```
/// use jsbridge::default_normalise;
///
/// assert_eq!(default_normalise("lib/util", "../main.js"), "lib/main.js");
/// assert_eq!(default_normalise("lib", "./a/./b.js"), "lib/a/b.js");
/// assert_eq!(default_normalise("lib", "/abs/c.js"), "/abs/c.js");
/// ```
pub fn default_normalise(base: &str, name: &str) -> String {
    let name = name.replace('\\', "/");
    let relative = name.starts_with("./") || name.starts_with("../");
    let joined = if relative && !base.is_empty() {
        format!("{}/{name}", base.replace('\\', "/"))
    } else {
        name
    };

    let absolute = joined.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }
    let path = segments.join("/");
    if absolute { format!("/{path}") } else { path }
}

// The directory part of a resolved identifier.
fn dirname(id: &str) -> &str {
    id.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Load, evaluate and cache the CommonJS module `name` required from the directory `base`.
pub(crate) fn require_module<'js>(
    ctx: &Ctx<'js>,
    bridge: &Bridge,
    base: &str,
    name: &str,
) -> Result<Value<'js>> {
    let hooks = bridge.shared.module_hooks();
    let id = hooks.normalise(base, name).map_err(Error::Host)?;
    if let Some(module) = bridge.cached_module(ctx, &id)? {
        return Ok(module.get("exports")?);
    }

    let source = hooks.load(&id).map_err(Error::Host)?;
    check_string(&source, bridge.shared.max_string_length(), "Module source")?;

    let module = Object::new(ctx.clone())?;
    let exports = Object::new(ctx.clone())?;
    module.set("exports", exports.clone())?;
    module.set("id", id.as_str())?;
    // cached before evaluation so cyclic requires see the partial exports
    bridge.cache_module(ctx, &id, &module);

    if let Err(e) = evaluate(ctx, bridge, &id, &source, &module, exports) {
        bridge.forget_module(&id);
        return Err(e);
    }
    tracing::debug!(module = id, "Loaded module");
    Ok(module.get("exports")?)
}

fn evaluate<'js>(
    ctx: &Ctx<'js>,
    bridge: &Bridge,
    id: &str,
    source: &str,
    module: &Object<'js>,
    exports: Object<'js>,
) -> Result<()> {
    let wrapped =
        format!("(function (exports, require, module, __filename, __dirname) {{{source}\n}})");
    let compiled = script::compile(ctx, &wrapped, id)?;
    let factory: Function = script::run(ctx, &compiled)?.get()?;
    let dir = dirname(id);
    let require = require_function(ctx, bridge, dir.to_string())?;
    factory.call::<_, ()>((
        This(exports.clone()),
        exports,
        require,
        module.clone(),
        id,
        dir,
    ))?;
    Ok(())
}

/// The guest `require` function for modules in the directory `base`.
pub(crate) fn require_function<'js>(
    ctx: &Ctx<'js>,
    bridge: &Bridge,
    base: String,
) -> Result<Function<'js>> {
    let bridge = bridge.clone();
    let require = coerce_fn_signature(move |ctx, _this, args| {
        let name = match args.0.first().and_then(Value::as_string) {
            Some(name) => name.to_string()?,
            None => {
                return Err(Exception::throw_type(
                    &ctx,
                    "require expects a module identifier string",
                ));
            }
        };
        require_module(&ctx, &bridge, &base, &name).map_err(|e| bridge.throw(&ctx, e))
    });
    Ok(Function::new(ctx.clone(), require)?.with_name("require")?)
}

// Serves dynamic `import()` from the same hooks as `require`.
#[derive(Clone)]
pub(crate) struct HostModuleLoader {
    shared: Arc<ContextShared>,
}

impl HostModuleLoader {
    pub(crate) fn new(shared: Arc<ContextShared>) -> Self {
        Self { shared }
    }
}

impl Resolver for HostModuleLoader {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        // the engine passes the importing module's identifier, not its directory
        self.shared
            .module_hooks()
            .normalise(dirname(base), name)
            .map_err(|err| {
                tracing::debug!("Failed to resolve module '{name}' from '{base}': {err:#}");
                rquickjs::Error::new_resolving(base, name)
            })
    }
}

impl Loader for HostModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js>> {
        let source = self.shared.module_hooks().load(name).map_err(|err| {
            tracing::debug!("Failed to load module '{name}': {err:#}");
            rquickjs::Error::new_loading(name)
        })?;
        Module::declare(ctx.clone(), name, source)
    }
}
