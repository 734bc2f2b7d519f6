// Command-line interface for packbench.
//
// Subcommands: `run-sweep` (the experiment driver), `pack` / `unpack`
// (container file utilities), and `config` (build details). Exit code 0
// means the sweep succeeded or partial failure was tolerated; 1 means a
// failed sweep under --require-success or a failed command; 2 means a
// configuration error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};

use crate::adapter::external::PipeSpec;
use crate::adapter::{AdapterConfig, Limits};
use crate::container::{self, Message};
use crate::sweep::{RunLog, SweepConfig, SweepError, run_sweep};

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CONFIG: i32 = 2;

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Two-stage IoT compression bench.
#[derive(Parser, Debug)]
#[command(
    name = "packbench",
    version,
    about = "Container packing and measured re-compression sweeps",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Force overwrite existing output files.
    #[arg(short = 'f', long, global = true)]
    force: bool,

    /// Quiet mode (suppress non-error output).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Output a summary as JSON to stderr.
    #[arg(long = "json", global = true)]
    json_output: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the full {domain x stage1 x stage2} experiment sweep.
    #[command(name = "run-sweep")]
    RunSweep(SweepArgs),
    /// Pack files into a container.
    Pack(PackArgs),
    /// Unpack a container back into files.
    Unpack(UnpackArgs),
    /// Print build/configuration details.
    Config,
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// Data domains, comma-separated (e.g. gps,sensors,logistics).
    #[arg(long, value_delimiter = ',', required = true)]
    domains: Vec<String>,

    /// First-stage algorithm labels, comma-separated (e.g. huff,lzw).
    #[arg(long = "stage1", value_delimiter = ',', required = true)]
    stage1: Vec<String>,

    /// Second-stage algorithms, comma-separated (built-in: store, zlib,
    /// lzma; anything else needs --external).
    #[arg(long = "stage2", value_delimiter = ',', required = true)]
    stage2: Vec<String>,

    /// Root of the message tree (<data-dir>/<domain>/<stage1>/*).
    #[arg(long = "data-dir", value_hint = ValueHint::DirPath, default_value = ".")]
    data_dir: PathBuf,

    /// Per-invocation wall-clock limit in seconds.
    #[arg(long = "time-limit")]
    time_limit: Option<u64>,

    /// Per-invocation peak-RSS ceiling in megabytes.
    #[arg(long = "mem-limit")]
    mem_limit: Option<u64>,

    /// Run log output path.
    #[arg(long = "out", value_hint = ValueHint::FilePath, default_value = "runlog.csv")]
    out: PathBuf,

    /// Fail the sweep (exit non-zero) if any combination fails.
    #[arg(long = "require-success")]
    require_success: bool,

    /// Skip the decompress-decode-compare validation stage.
    #[arg(long = "no-validate")]
    no_validate: bool,

    /// Concurrent combinations (needs the 'parallel' build feature for >1).
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// External compressor spec: 'name=compress cmd|decompress cmd'
    /// (stdin->stdout pipe contract). Repeatable.
    #[arg(long = "external", action = ArgAction::Append)]
    externals: Vec<String>,

    /// Adapter tuning option: 'name.key=value' (e.g. zlib.level=9).
    /// Repeatable.
    #[arg(long = "option", action = ArgAction::Append)]
    options: Vec<String>,
}

#[derive(Args, Debug)]
struct PackArgs {
    /// Output container file.
    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Message files, packed in the given order.
    #[arg(value_hint = ValueHint::FilePath, required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct UnpackArgs {
    /// Input container file.
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Directory to write the extracted messages into.
    #[arg(long = "out-dir", value_hint = ValueHint::DirPath, default_value = ".")]
    out_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = match &cli.command {
        Cmd::RunSweep(args) => cmd_run_sweep(&cli, args),
        Cmd::Pack(args) => cmd_pack(&cli, args),
        Cmd::Unpack(args) => cmd_unpack(&cli, args),
        Cmd::Config => cmd_config(),
    };
    process::exit(code);
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .format_timestamp_millis()
    .try_init();
}

#[cfg(any(test, feature = "fuzzing"))]
pub fn fuzz_try_parse_args(args: &[String]) {
    let argv: Vec<String> = std::iter::once("packbench".to_string())
        .chain(args.iter().cloned())
        .collect();
    let _ = Cli::try_parse_from(argv);
}

// ---------------------------------------------------------------------------
// run-sweep command
// ---------------------------------------------------------------------------

fn cmd_run_sweep(cli: &Cli, args: &SweepArgs) -> i32 {
    let mut externals = BTreeMap::new();
    for raw in &args.externals {
        match PipeSpec::parse(raw) {
            Ok(spec) => {
                externals.insert(spec.name.clone(), spec);
            }
            Err(e) => {
                eprintln!("packbench: --external: {e}");
                return EXIT_CONFIG;
            }
        }
    }

    let adapter_options = match parse_adapter_options(&args.options) {
        Ok(map) => map,
        Err(msg) => {
            eprintln!("packbench: --option: {msg}");
            return EXIT_CONFIG;
        }
    };

    let config = SweepConfig {
        domains: args.domains.clone(),
        stage1_algos: args.stage1.clone(),
        stage2_algos: args.stage2.clone(),
        data_dir: args.data_dir.clone(),
        limits: Limits {
            time_limit: args.time_limit.map(Duration::from_secs),
            memory_ceiling: args.mem_limit.map(|mb| mb * 1024 * 1024),
        },
        validate: !args.no_validate,
        require_success: args.require_success,
        workers: args.workers,
        adapter_options,
        externals,
    };

    if args.out.exists() && !cli.force {
        eprintln!(
            "packbench: run log exists, use -f to overwrite: {}",
            args.out.display()
        );
        return EXIT_CONFIG;
    }
    let log = match RunLog::create(&args.out) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("packbench: run log: {}: {e}", args.out.display());
            return EXIT_CONFIG;
        }
    };

    let summary = match run_sweep(&config, &log) {
        Ok(summary) => summary,
        Err(SweepError::Config(msg)) => {
            eprintln!("packbench: {msg}");
            return EXIT_CONFIG;
        }
        Err(SweepError::Io(e)) => {
            eprintln!("packbench: run log write failed: {e}");
            return EXIT_FAILED;
        }
    };

    if !cli.quiet {
        eprintln!(
            "packbench: {} combinations, {} succeeded, {} failed -> {}",
            summary.total(),
            summary.succeeded(),
            summary.failed,
            args.out.display()
        );
    }

    if cli.json_output {
        let json = serde_json::json!({
            "command": "run-sweep",
            "combinations": summary.total(),
            "succeeded": summary.succeeded(),
            "failed": summary.failed,
            "require_success": summary.require_success,
            "run_log": args.out.display().to_string(),
        });
        eprintln!("{}", serde_json::to_string_pretty(&json).unwrap());
    }

    if summary.sweep_failed() {
        EXIT_FAILED
    } else {
        EXIT_OK
    }
}

/// Parse repeated `name.key=value` adapter options.
fn parse_adapter_options(
    raw: &[String],
) -> Result<BTreeMap<String, AdapterConfig>, String> {
    let mut map: BTreeMap<String, AdapterConfig> = BTreeMap::new();
    for item in raw {
        let (target, value) = item
            .split_once('=')
            .ok_or_else(|| format!("'{item}': expected name.key=value"))?;
        let (name, key) = target
            .split_once('.')
            .ok_or_else(|| format!("'{item}': expected name.key=value"))?;
        if name.is_empty() || key.is_empty() {
            return Err(format!("'{item}': empty adapter name or option key"));
        }
        let config = map.remove(name).unwrap_or_default();
        map.insert(name.to_string(), config.set(key, value));
    }
    Ok(map)
}

// ---------------------------------------------------------------------------
// pack / unpack commands
// ---------------------------------------------------------------------------

fn cmd_pack(cli: &Cli, args: &PackArgs) -> i32 {
    if args.output.exists() && !cli.force {
        eprintln!(
            "packbench: output file exists, use -f to overwrite: {}",
            args.output.display()
        );
        return EXIT_FAILED;
    }

    let mut messages = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("packbench: {}: {e}", path.display());
                return EXIT_FAILED;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match Message::new(name, data) {
            Ok(message) => messages.push(message),
            Err(e) => {
                eprintln!("packbench: {}: {e}", path.display());
                return EXIT_FAILED;
            }
        }
    }

    let written = match container::write_container_file(&args.output, &messages) {
        Ok(written) => written,
        Err(e) => {
            eprintln!("packbench: {}: {e}", args.output.display());
            return EXIT_FAILED;
        }
    };

    if !cli.quiet {
        eprintln!(
            "packbench: packed {} messages into {} ({} bytes)",
            messages.len(),
            args.output.display(),
            written
        );
    }
    if cli.json_output {
        let json = serde_json::json!({
            "command": "pack",
            "messages": messages.len(),
            "container_bytes": written,
        });
        eprintln!("{}", serde_json::to_string_pretty(&json).unwrap());
    }
    EXIT_OK
}

fn cmd_unpack(cli: &Cli, args: &UnpackArgs) -> i32 {
    let messages = match container::read_container_file(&args.input) {
        Ok(messages) => messages,
        Err(e) => {
            eprintln!("packbench: {}: {e}", args.input.display());
            return EXIT_FAILED;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&args.out_dir) {
        eprintln!("packbench: {}: {e}", args.out_dir.display());
        return EXIT_FAILED;
    }

    for message in &messages {
        // Container names come from untrusted files; keep extraction inside
        // out_dir by refusing separators and parent components.
        let name = message.name();
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            eprintln!("packbench: refusing suspicious message name: {name:?}");
            return EXIT_FAILED;
        }
        let path = args.out_dir.join(name);
        if path.exists() && !cli.force {
            eprintln!(
                "packbench: output file exists, use -f to overwrite: {}",
                path.display()
            );
            return EXIT_FAILED;
        }
        if let Err(e) = std::fs::write(&path, message.data()) {
            eprintln!("packbench: {}: {e}", path.display());
            return EXIT_FAILED;
        }
    }

    if !cli.quiet {
        eprintln!(
            "packbench: unpacked {} messages into {}",
            messages.len(),
            args.out_dir.display()
        );
    }
    if cli.json_output {
        let json = serde_json::json!({
            "command": "unpack",
            "messages": messages.len(),
            "out_dir": args.out_dir.display().to_string(),
        });
        eprintln!("{}", serde_json::to_string_pretty(&json).unwrap());
    }
    EXIT_OK
}

// ---------------------------------------------------------------------------
// config command
// ---------------------------------------------------------------------------

fn cmd_config() -> i32 {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("packbench version {version} (Rust)");

    let zlib = cfg!(feature = "zlib-stage2") as u8;
    let lzma = cfg!(feature = "lzma-stage2") as u8;
    let parallel = cfg!(feature = "parallel") as u8;
    let ptr_size = std::mem::size_of::<*const ()>();

    eprintln!("STAGE2_ZLIB={zlib}");
    eprintln!("STAGE2_LZMA={lzma}");
    eprintln!("PARALLEL={parallel}");
    eprintln!(
        "SAMPLE_INTERVAL_MS={}",
        crate::metrics::DEFAULT_SAMPLE_INTERVAL.as_millis()
    );
    eprintln!("MAX_NAME_LEN={}", container::MAX_NAME_LEN);
    eprintln!("sizeof(usize)={ptr_size}");

    EXIT_OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
