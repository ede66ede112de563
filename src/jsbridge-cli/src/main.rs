use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use jsbridge::{ContextBuilder, ExecuteOptions, ExecutionFlags, HostValue};
use tracing::instrument;
use tracing_subscriber::EnvFilter;

const EXAMPLES: &str = "\u{001b}[1;4mExamples:\u{001b}[0m
  Run a script located at ./index.js that requires a module next to it:
    $ cat ./index.js
    const math = require('./math.js');
    console.log(JSON.stringify(Host.event));
    math.add(Host.event.a, 41)

    $ cat ./math.js
    exports.add = (a, b) => a + b;

    $ jsbridge ./index.js --var 'event={\"a\":1}'
    {\"a\":1}
    Result: 42

  Seed the context with the globals defined by another script:
    $ jsbridge ./index.js --snapshot ./seed.js --time-limit-ms 100
";

/// Run a JavaScript file in a jsbridge execution context and print its completion value as JSON.
///
/// Modules passed to `require()` or `import()` are resolved relative to the script's directory
/// and loaded from disk.
#[derive(clap::Parser)]
#[command(version, about)]
#[clap(after_help = EXAMPLES)]
struct Cli {
    /// The path to the JavaScript file to run.
    file: PathBuf,

    /// Abort the script after this many milliseconds.
    #[arg(long, value_name = "MS")]
    time_limit_ms: Option<u64>,

    /// Abort the script once the guest heap exceeds this many bytes.
    #[arg(long, value_name = "BYTES")]
    memory_limit: Option<u64>,

    /// Name of the global object holding the variables.
    #[arg(long, value_name = "NAME")]
    object_name: Option<String>,

    /// A variable exposed on the global object, as NAME=JSON.
    #[arg(long = "var", value_name = "NAME=JSON", value_parser = parse_variable)]
    variables: Vec<(String, HostValue)>,

    /// A script whose globals seed the context before the file runs.
    #[arg(long, value_name = "SEED.js")]
    snapshot: Option<PathBuf>,

    /// Convert objects in the result to arrays of their values.
    #[arg(long)]
    force_array: bool,
}

fn parse_variable(arg: &str) -> Result<(String, HostValue)> {
    let Some((name, json)) = arg.split_once('=') else {
        bail!("expected NAME=JSON, got {arg:?}");
    };
    if name.is_empty() {
        bail!("variable name is empty in {arg:?}");
    }
    let value = serde_json::from_str(json)
        .with_context(|| format!("Parsing the value of variable {name:?} as JSON"))?;
    Ok((name.to_string(), value))
}

fn module_loader(root: PathBuf) -> impl Fn(&str) -> Result<String> + Send + Sync + 'static {
    move |id: &str| {
        let path = root.join(id);
        fs::read_to_string(&path).with_context(|| format!("Loading module {id:?} from {path:?}"))
    }
}

#[instrument(skip_all, level = "info")]
fn run(cli: Cli) -> Result<HostValue> {
    let source = fs::read_to_string(&cli.file)
        .with_context(|| format!("Reading script from {:?}", cli.file))?;
    let root = cli
        .file
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let identifier = cli
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let mut builder = ContextBuilder::new().with_module_loader(module_loader(root));
    if let Some(ms) = cli.time_limit_ms {
        builder = builder.with_time_limit(Duration::from_millis(ms));
    }
    if let Some(bytes) = cli.memory_limit {
        builder = builder.with_memory_limit(bytes);
    }
    if let Some(name) = cli.object_name {
        builder = builder.with_object_name(name);
    }
    for (name, value) in cli.variables {
        builder = builder.with_variable(name, value);
    }
    if let Some(seed) = &cli.snapshot {
        let seed_source = fs::read_to_string(seed)
            .with_context(|| format!("Reading snapshot seed from {seed:?}"))?;
        let Some(blob) = jsbridge::ExecutionContext::create_snapshot(&seed_source) else {
            bail!("Snapshot seed {seed:?} is empty or failed to run");
        };
        builder = builder.with_snapshot(blob);
    }

    let context = builder.build().context("Creating the execution context")?;
    let flags = if cli.force_array {
        ExecutionFlags::FORCE_ARRAY
    } else {
        ExecutionFlags::NONE
    };
    let result = context
        .execute_string(
            &source,
            identifier.as_deref(),
            ExecuteOptions::default().with_flags(flags),
        )
        .with_context(|| format!("Running {:?}", cli.file))?;

    let report = context.dispose()?;
    if !report.is_clean() {
        tracing::warn!(issues = ?report.issues, "Context teardown reported issues");
    }
    Ok(result)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let result = run(Cli::parse())?;
    let json = serde_json::to_string(&result).context("Converting the result to JSON")?;
    println!("Result: {json}");
    Ok(())
}
