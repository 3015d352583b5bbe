use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use probe_core::{
    ensure_dir, split_command, DeviceId, HarnessError, OffsetField, PROBE_ENV_BRIDGE_COMMAND,
    PROBE_ENV_LOG,
};
use probe_matrix::{default_table, load_table, table_document, ExpectationTable};
use probe_runner::{
    normalize_device_ids, BridgeInstrumentation, BufferedReportSink, CheckKind,
    CommandDeviceSource, DeviceCheck, DeviceSource, HarnessConfig, HookInstallCheck,
    JsonlReportSink, OffsetLayoutCheck, Orchestrator, PayloadCache, ReportSink, RunFailure,
    RunSummary, StaticDeviceSource,
};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "probe",
    version = "0.3.0",
    about = "Verifies runtime structure offsets and hook installation on attached Android devices"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CheckArg {
    #[value(name = "offsets")]
    Offsets,
    #[value(name = "hooks")]
    Hooks,
    #[value(name = "all")]
    All,
}

impl CheckArg {
    fn kinds(self) -> Vec<CheckKind> {
        match self {
            CheckArg::Offsets => vec![CheckKind::Offsets],
            CheckArg::Hooks => vec![CheckKind::Hooks],
            CheckArg::All => vec![CheckKind::Offsets, CheckKind::Hooks],
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to every device, load the agent, and run the selected checks.
    ///
    /// Each check is its own pass over the devices. A pass stops at its first
    /// failing device; with `--check all` the hooks pass still runs after a
    /// failed offsets pass.
    Run {
        #[arg(long)]
        payload: PathBuf,
        #[arg(long, value_enum, default_value = "all")]
        check: CheckArg,
        #[arg(long)]
        process: Option<String>,
        #[arg(long)]
        expectations: Option<PathBuf>,
        #[arg(long)]
        bridge: Option<String>,
        #[arg(long)]
        devices_command: Option<String>,
        #[arg(long = "device")]
        devices: Vec<String>,
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        device_timeout_ms: Option<u64>,
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        step_timeout_ms: Option<u64>,
        #[arg(long)]
        report_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List attached devices in the order they would be tested.
    Devices {
        #[arg(long)]
        devices_command: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Validate and print an expectation table (the built-in one by default).
    Expectations {
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Schemas {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Default)]
struct CheckRuns {
    passed: Vec<RunSummary>,
    failed: Vec<RunFailure>,
}

/// At least one pass of `probe run` failed.
#[derive(Debug)]
struct ChecksFailed {
    passed: Vec<RunSummary>,
    failures: Vec<RunFailure>,
}

impl fmt::Display for ChecksFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.failures.iter().map(|fail| fail.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ChecksFailed {}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct RunOverrides {
    process: Option<String>,
    bridge: Option<String>,
    devices_command: Option<String>,
    device_timeout_ms: Option<u64>,
    step_timeout_ms: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&error_json(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(PROBE_ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            payload,
            check,
            process,
            expectations,
            bridge,
            devices_command,
            devices,
            device_timeout_ms,
            step_timeout_ms,
            report_dir,
            json,
        } => {
            let config = apply_overrides(
                HarnessConfig::from_env()?,
                &RunOverrides {
                    process,
                    bridge,
                    devices_command,
                    device_timeout_ms,
                    step_timeout_ms,
                },
            );
            let table = match &expectations {
                Some(path) => load_table(path)?,
                None => default_table(),
            };
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let runs = runtime.block_on(run_checks(
                &config,
                &payload,
                check,
                table,
                devices,
                report_dir.as_deref(),
            ))?;
            if !json {
                for summary in &runs.passed {
                    print_summary(summary);
                }
            }
            if !runs.failed.is_empty() {
                return Err(ChecksFailed {
                    passed: runs.passed,
                    failures: runs.failed,
                }
                .into());
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "target_process": config.target_process,
                    "runs": runs.passed,
                })));
            }
        }
        Commands::Devices {
            devices_command,
            json,
        } => {
            let mut config = HarnessConfig::from_env()?;
            if let Some(raw) = devices_command {
                config.devices_command = split_command(&raw);
            }
            let source = CommandDeviceSource::new(config.devices_command.clone());
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let ids = normalize_device_ids(runtime.block_on(source.list_device_ids())?);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "devices",
                    "devices": ids,
                })));
            }
            if ids.is_empty() {
                println!("no devices");
            }
            for id in &ids {
                println!("{}", id);
            }
        }
        Commands::Expectations { file, json } => {
            let table = match &file {
                Some(path) => load_table(path)?,
                None => default_table(),
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "expectations",
                    "source": file.as_ref().map(|p| p.display().to_string()),
                    "table": table_document(&table)?,
                })));
            }
            for line in render_table(&table) {
                println!("{}", line);
            }
        }
        Commands::Schemas { json } => {
            let names = probe_schemas::schema_names();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "schemas",
                    "schemas": names,
                })));
            }
            for name in names {
                println!("{}", name);
            }
        }
    }
    Ok(None)
}

async fn run_checks(
    config: &HarnessConfig,
    payload: &Path,
    check: CheckArg,
    table: ExpectationTable,
    pinned_devices: Vec<String>,
    report_dir: Option<&Path>,
) -> Result<CheckRuns> {
    let bridge_command = config.bridge_command.clone().ok_or_else(|| {
        anyhow!(
            "no instrumentation bridge configured; pass --bridge or set {}",
            PROBE_ENV_BRIDGE_COMMAND
        )
    })?;
    let source: Box<dyn DeviceSource> = if pinned_devices.is_empty() {
        Box::new(CommandDeviceSource::new(config.devices_command.clone()))
    } else {
        Box::new(StaticDeviceSource::new(
            pinned_devices.into_iter().map(DeviceId::new),
        ))
    };
    let payload = PayloadCache::new(payload);
    let mut checks: Vec<Box<dyn DeviceCheck>> = Vec::new();
    for kind in check.kinds() {
        match kind {
            CheckKind::Offsets => checks.push(Box::new(OffsetLayoutCheck::new(table.clone()))),
            CheckKind::Hooks => checks.push(Box::new(HookInstallCheck)),
        }
    }

    let bridge = BridgeInstrumentation::spawn(&bridge_command)?;
    let orchestrator = Orchestrator::new(&bridge, source.as_ref(), &payload, config);
    let mut runs = CheckRuns::default();
    let outcome: Result<()> = async {
        for check in &checks {
            let mut sink = report_sink(report_dir, check.kind())?;
            match orchestrator.run(check.as_ref(), sink.as_mut()).await {
                Ok(summary) => runs.passed.push(summary),
                Err(failure) => {
                    error!(check = %failure.check, "{}", failure);
                    runs.failed.push(failure);
                }
            }
        }
        Ok(())
    }
    .await;
    if let Err(e) = bridge.shutdown().await {
        warn!("bridge shutdown failed: {}", e);
    }
    outcome?;
    Ok(runs)
}

fn apply_overrides(mut config: HarnessConfig, overrides: &RunOverrides) -> HarnessConfig {
    if let Some(process) = &overrides.process {
        config.target_process = process.clone();
    }
    if let Some(raw) = &overrides.bridge {
        config.bridge_command = Some(split_command(raw));
    }
    if let Some(raw) = &overrides.devices_command {
        config.devices_command = split_command(raw);
    }
    if let Some(ms) = overrides.device_timeout_ms {
        config.timeouts.device = Duration::from_millis(ms);
    }
    if let Some(ms) = overrides.step_timeout_ms {
        config.timeouts.step = Duration::from_millis(ms);
    }
    config
}

/// One report directory per check so `--check all` keeps both manifests.
fn report_sink(report_dir: Option<&Path>, kind: CheckKind) -> Result<Box<dyn ReportSink>> {
    match report_dir {
        Some(dir) => {
            let dir = dir.join(kind.to_string());
            ensure_dir(&dir)?;
            Ok(Box::new(JsonlReportSink::new(&dir)?))
        }
        None => Ok(Box::new(BufferedReportSink::default())),
    }
}

fn print_summary(summary: &RunSummary) {
    println!("check: {}", summary.check);
    println!("run_id: {}", summary.run_id);
    for device in &summary.devices {
        match &device.report.descriptor {
            Some(descriptor) => println!(
                "  {} passed (android {}, {}-byte pointers)",
                device.device_id, descriptor.version, descriptor.pointer_size
            ),
            None => println!("  {} passed", device.device_id),
        }
    }
}

fn render_table(table: &ExpectationTable) -> Vec<String> {
    table
        .rows()
        .iter()
        .map(|row| {
            let fields = OffsetField::ALL
                .iter()
                .filter_map(|field| {
                    row.expected
                        .get(field)
                        .map(|value| format!("{}={}", field, value))
                })
                .collect::<Vec<_>>()
                .join(" ");
            format!("{:<6} {}  {}", row.version_prefix, row.pointer_size, fields)
        })
        .collect()
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_json(err: &anyhow::Error) -> Value {
    if let Some(failed) = err.downcast_ref::<ChecksFailed>() {
        if let Some(first) = failed.failures.first() {
            return json_error(
                first.error.code(),
                failed.to_string(),
                json!({
                    "failures": failed.failures.iter().map(RunFailure::to_json).collect::<Vec<_>>(),
                    "passed_runs": failed.passed,
                }),
            );
        }
    }
    if let Some(harness) = err.downcast_ref::<HarnessError>() {
        return json_error(harness.code(), harness.to_string(), harness.details());
    }
    json_error("command_failed", format!("{:#}", err), json!({}))
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Devices { json, .. }
        | Commands::Expectations { json, .. }
        | Commands::Schemas { json } => *json,
    }
}
