#![warn(missing_docs)]

//! funcbox command-line runner
//!
//! Executes wire-format function inputs and validates function sources.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use funcbox_config::FuncboxConfig;
use funcbox_sandbox::audit::TracingAuditLogger;
use funcbox_sandbox::wire::{decode_input, encode_output};
use funcbox_sandbox::{
    FunctionValidator, GuestLogSink, PoolConfig, SandboxConfig, SandboxPool,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "funcbox", version, about = "Run untrusted JavaScript functions in a V8 sandbox")]
struct Cli {
    /// Config file (default: ./funcbox.toml if present).
    #[arg(long, global = true, env = "FUNCBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a wire-format FunctionInput and print the FunctionOutput.
    Run {
        /// JSON input file, `-` for stdin.
        input: PathBuf,
        /// Reject the source if static validation finds errors.
        #[arg(long)]
        validate: bool,
    },
    /// Validate a function source file.
    Validate {
        /// JavaScript source file, `-` for stdin.
        source: PathBuf,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &funcbox_config::SandboxOverrides) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    if let Some(ms) = overrides.timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }
    if let Some(mb) = overrides.memory_limit_mb {
        config.memory_limit = mb * 1024 * 1024;
    }
    if let Some(kb) = overrides.stack_size_kb {
        config.stack_size = kb * 1024;
    }
    if let Some(allow) = overrides.allow_network {
        config.allow_network = allow;
    }
    if let Some(allow) = overrides.allow_file_io {
        config.allow_file_io = allow;
    }
    if let Some(enable) = overrides.enable_interoperability {
        config.enable_interoperability = enable;
    }
    if let Some(ref url) = overrides.service_layer_url {
        config.service_layer_url = url.clone();
    }
    if let Some(ms) = overrides.memory_check_interval_ms {
        config.memory_check_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = overrides.http_timeout_secs {
        config.http_timeout = Duration::from_secs(secs);
    }
    if let Some(mb) = overrides.max_http_response_mb {
        config.max_http_response_size = mb * 1024 * 1024;
    }
    if let Some(ref sink) = overrides.guest_log {
        config.log_sink = match sink.as_str() {
            "silent" => GuestLogSink::Silent,
            _ => GuestLogSink::Tracing,
        };
    }
    config
}

/// Build PoolConfig from config overrides.
fn build_pool_config(overrides: &funcbox_config::PoolOverrides) -> PoolConfig {
    let mut config = PoolConfig::default();
    if let Some(max) = overrides.max_sandboxes {
        config.max_sandboxes = max;
    }
    if let Some(uses) = overrides.max_uses {
        config.max_uses = uses;
    }
    if let Some(secs) = overrides.max_idle_secs {
        config.max_idle_time = Duration::from_secs(secs);
    }
    config
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config` / `FUNCBOX_CONFIG`
/// 2. `./funcbox.toml` in the current directory
/// 3. None (no config file found, not an error)
fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    let cwd = PathBuf::from("funcbox.toml");
    cwd.exists().then_some(cwd)
}

fn load_config(explicit: Option<&Path>) -> Result<FuncboxConfig> {
    match find_config_file(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            FuncboxConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(FuncboxConfig::default())
        }
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn run(config: FuncboxConfig, input: &Path, validate: bool) -> Result<ExitCode> {
    let mut input = decode_input(&read_input(input)?).context("invalid function input")?;
    for (name, value) in &config.secrets {
        input
            .secrets
            .entry(name.clone())
            .or_insert_with(|| value.clone());
    }

    if validate {
        let report = FunctionValidator::new().validate(&input.code);
        if let Err(e) = report.into_result() {
            eprintln!("{e}");
            return Ok(ExitCode::from(2));
        }
    }

    let sandbox_config = build_sandbox_config(&config.sandbox);
    let pool_config = build_pool_config(&config.pool);
    tracing::debug!(?sandbox_config, ?pool_config, "effective configuration");

    let pool = SandboxPool::with_audit_logger(sandbox_config, pool_config, Arc::new(TracingAuditLogger));
    let output = pool.execute(input).await;
    pool.shutdown().await;
    let output = output?;
    println!("{}", encode_output(&output)?);

    Ok(if output.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn validate(source: &Path, json: bool) -> Result<ExitCode> {
    let code = read_input(source)?;
    let report = FunctionValidator::new().validate(&code);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for v in &report.violations {
            if v.line > 0 {
                println!(
                    "{}:{}:{}: {}[{}]: {}",
                    source.display(),
                    v.line,
                    v.column_start,
                    v.severity,
                    v.rule_id,
                    v.message
                );
            } else {
                println!("{}: {}[{}]: {}", source.display(), v.severity, v.rule_id, v.message);
            }
        }
        println!(
            "{} error(s), {} warning(s), {} info",
            report.error_count, report.warning_count, report.info_count
        );
    }

    Ok(if report.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run { input, validate } => {
            let config = load_config(cli.config.as_deref())?;
            run(config, &input, validate).await
        }
        Command::Validate { source, json } => validate(&source, json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_map_onto_sandbox_config() {
        let config = FuncboxConfig::from_toml(
            r#"
            [sandbox]
            timeout_ms = 250
            memory_limit_mb = 32
            stack_size_kb = 2048
            allow_network = true
            enable_interoperability = false
            service_layer_url = "http://svc:9000"
            http_timeout_secs = 2
            max_http_response_mb = 1
            guest_log = "silent"
            "#,
        )
        .unwrap();
        let sc = build_sandbox_config(&config.sandbox);
        assert_eq!(sc.timeout, Duration::from_millis(250));
        assert_eq!(sc.memory_limit, 32 * 1024 * 1024);
        assert_eq!(sc.stack_size, 2 * 1024 * 1024);
        assert!(sc.allow_network);
        assert!(!sc.enable_interoperability);
        assert_eq!(sc.service_layer_url, "http://svc:9000");
        assert_eq!(sc.http_timeout, Duration::from_secs(2));
        assert_eq!(sc.max_http_response_size, 1024 * 1024);
        assert_eq!(sc.log_sink, GuestLogSink::Silent);
    }

    #[test]
    fn empty_overrides_keep_defaults() {
        let sc = build_sandbox_config(&Default::default());
        assert_eq!(sc, SandboxConfig::default());
        assert_eq!(build_pool_config(&Default::default()), PoolConfig::default());
    }

    #[test]
    fn pool_overrides_map() {
        let pc = build_pool_config(&funcbox_config::PoolOverrides {
            max_sandboxes: Some(2),
            max_uses: Some(5),
            max_idle_secs: Some(9),
        });
        assert_eq!(pc.max_sandboxes, 2);
        assert_eq!(pc.max_uses, 5);
        assert_eq!(pc.max_idle_time, Duration::from_secs(9));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["funcbox", "run", "in.json", "--validate"]).unwrap();
        assert!(matches!(cli.command, Command::Run { validate: true, .. }));

        let cli = Cli::try_parse_from(["funcbox", "validate", "-", "--json"]).unwrap();
        match cli.command {
            Command::Validate { source, json } => {
                assert_eq!(source, PathBuf::from("-"));
                assert!(json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn explicit_config_path_wins() {
        let p = PathBuf::from("/etc/funcbox/custom.toml");
        assert_eq!(find_config_file(Some(&p)), Some(p));
    }

    #[test]
    fn cargo_pkg_version_is_030() {
        assert_eq!(env!("CARGO_PKG_VERSION"), "0.3.0");
    }
}
