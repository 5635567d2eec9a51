use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::instrument;

use sandrun::{
    CodeObject, InvocationRequest, RuntimeBuilder, Tags, Version, WasmReturnType,
};

const EXAMPLES: &str = "\u{001b}[1;4mExamples:\u{001b}[0m
  Run a JS handler with two JSON-encoded arguments:
    $ cat ./handler.js
    function Handler(a, b) { return a + b; }

    $ sandrun-cli ./handler.js Handler 1 2
    Handler result: 3

  Run a WASM handler exporting `add(i32,i32)->i32`:
    $ sandrun-cli ./handler.wasm add 1 2 --wasm-return-type u32
    Handler result: 3
";

/// Load one handler file and invoke it once, outside the long-lived
/// multi-process runtime.
#[derive(clap::Parser)]
#[command(version, about)]
#[clap(after_help = EXAMPLES)]
struct Cli {
    /// Path to the handler file. A `.wasm` extension loads it as
    /// WebAssembly; anything else is loaded as JavaScript source.
    file: PathBuf,

    /// Name of the exported handler function to invoke.
    handler: String,

    /// JSON-encoded arguments, passed to the handler in order.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Expected WASM return shape: `u32`, `string`, or `list_of_string`.
    /// Ignored for JavaScript handlers.
    #[arg(long, default_value = "unknown")]
    wasm_return_type: String,

    /// Per-invocation deadline in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[instrument(skip_all, level = "info")]
fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let is_wasm = cli
        .file
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wasm"));

    let version = Version::new(1).expect("1 is non-zero");
    let code = if is_wasm {
        let bytes = std::fs::read(&cli.file)
            .with_context(|| format!("reading wasm module from {:?}", cli.file))?;
        CodeObject::new(cli.file.display().to_string(), version, "", bytes, Tags::new())
            .context("building code object from wasm module")?
    } else {
        let source = std::fs::read_to_string(&cli.file)
            .with_context(|| format!("reading js handler from {:?}", cli.file))?;
        CodeObject::new(
            cli.file.display().to_string(),
            version,
            source,
            Vec::new(),
            Tags::new(),
        )
        .context("building code object from js source")?
    };

    let config = RuntimeBuilder::new()
        .with_number_of_workers(1)
        .build()
        .context("validating runtime configuration")?;
    let runtime = sandrun::Runtime::init(config).context("starting the sandboxed runtime")?;

    let (load_tx, load_rx) = mpsc::channel();
    runtime
        .load(code, move |response| {
            let _ = load_tx.send(response);
        })
        .context("dispatching the code load")?;
    let load_response = load_rx
        .recv_timeout(Duration::from_secs(30))
        .context("waiting for the code load to complete")?;
    if let Err(e) = load_response.result {
        runtime.stop();
        bail!("loading {:?} failed: {e}", cli.file);
    }

    let mut tags = Tags::new();
    tags.insert("TimeoutMs".to_string(), cli.timeout_ms.to_string());

    let request = InvocationRequest::new(
        "cli-invocation",
        version,
        cli.handler.clone(),
        cli.args,
        WasmReturnType::parse(&cli.wasm_return_type),
        tags,
    )
    .context("building the invocation request")?;

    let (tx, rx) = mpsc::channel();
    runtime
        .execute(request, move |response| {
            let _ = tx.send(response);
        })
        .context("dispatching the invocation")?;
    let response = rx
        .recv_timeout(Duration::from_secs(cli.timeout_ms / 1000 + 30))
        .context("waiting for the invocation to complete")?;

    runtime.stop();

    match response.result {
        Ok(result) => {
            println!("Handler result: {result}");
            Ok(())
        }
        Err(e) => bail!("invoking {} failed: {e}", cli.handler),
    }
}
