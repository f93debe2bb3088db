//! CLI entry point (§6): `master`, `fuzz`, and `run` subcommands over the
//! snapshot loader and master/worker machinery in this crate and
//! `aero-snapshot`. JSON symbol-store/coverage parsing and the crash-dump
//! parser are `aero-snapshot`'s job; this binary only wires paths and flags
//! through to them.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use aero_fuzz::backend::emulator::{EmulatorBackend, ScriptedCpu};
use aero_fuzz::backend::{Backend, BackendOptions, LafMode, TraceType};
use aero_fuzz::master::{self, MasterConfig};
use aero_fuzz::mutate::BitFlipMutator;
use aero_fuzz::worker::{self, NullTarget};
use aero_snapshot::Snapshot;

#[derive(Parser)]
#[command(name = "aero-fuzz", about = "Snapshot-based, coverage-guided fuzzer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for workers and run the scheduling loop (§4.7).
    Master {
        #[arg(long, default_value = "0.0.0.0:4550")]
        address: String,
        /// Total testcases to dispatch across the fleet; 0 = unbounded.
        #[arg(long, default_value_t = 0)]
        runs: u64,
        #[arg(long, default_value_t = 4096)]
        max_len: usize,
        #[arg(long, default_value = "aero-fuzz")]
        name: String,
        #[arg(long)]
        target: PathBuf,
        #[arg(long, default_value = "inputs")]
        inputs: PathBuf,
        #[arg(long, default_value = "outputs")]
        outputs: PathBuf,
        #[arg(long, default_value = "crashes")]
        crashes: PathBuf,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Dial a master and drive testcases against a backend (§4.7, §5).
    Fuzz {
        #[arg(long, default_value = "127.0.0.1:4550")]
        address: String,
        #[arg(long, value_enum, default_value_t = BackendKind::Bxcpu)]
        backend: BackendKind,
        #[arg(long, default_value = "aero-fuzz")]
        name: String,
        #[arg(long)]
        target: PathBuf,
        /// Instruction count (`bxcpu`) or wall-milliseconds (`whv`/`kvm`); 0 = unbounded.
        #[arg(long, default_value_t = 0)]
        limit: u64,
        #[arg(long, default_value_t = false)]
        edges: bool,
        #[arg(long, default_value_t = false)]
        compcov: bool,
        #[arg(long, value_enum, default_value_t = LafArg::Disabled)]
        laf: LafArg,
        #[arg(long, value_delimiter = ',')]
        laf_allowed_ranges: Vec<String>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Run a single testcase once and optionally emit a trace (§6).
    Run {
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        input: PathBuf,
        #[arg(long, value_enum)]
        trace_type: Option<TraceTypeArg>,
        #[arg(long)]
        trace_path: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    Bxcpu,
    Whv,
    Kvm,
}

#[derive(Clone, Copy, ValueEnum)]
enum LafArg {
    Disabled,
    User,
    Kernel,
    KernelUser,
}

impl From<LafArg> for LafMode {
    fn from(value: LafArg) -> Self {
        match value {
            LafArg::Disabled => LafMode::Disabled,
            LafArg::User => LafMode::User,
            LafArg::Kernel => LafMode::Kernel,
            LafArg::KernelUser => LafMode::KernelUser,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TraceTypeArg {
    Rip,
    Cov,
    Tenet,
}

impl From<TraceTypeArg> for TraceType {
    fn from(value: TraceTypeArg) -> Self {
        match value {
            TraceTypeArg::Rip => TraceType::Rip,
            // "cov" is reported through the trace-unique-rip sink: every
            // RIP that *newly* executes, the coverage-oriented trace view.
            TraceTypeArg::Cov => TraceType::UniqueRip,
            TraceTypeArg::Tenet => TraceType::Tenet,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Master { address, runs, max_len, name, target, inputs, outputs, crashes, seed } => {
            run_master(address, runs, max_len, name, target, inputs, outputs, crashes, seed)
        }
        Command::Fuzz {
            address,
            backend,
            name,
            target,
            limit,
            edges,
            compcov,
            laf,
            laf_allowed_ranges,
            seed,
        } => run_fuzz(address, backend, name, target, limit, edges, compcov, laf, laf_allowed_ranges, seed),
        Command::Run { target, input, trace_type, trace_path, limit } => {
            run_once(target, input, trace_type, trace_path, limit)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "aero-fuzz exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn run_master(
    address: String,
    runs: u64,
    max_len: usize,
    name: String,
    target: PathBuf,
    inputs: PathBuf,
    outputs: PathBuf,
    crashes: PathBuf,
    seed: u64,
) -> anyhow::Result<()> {
    let config = MasterConfig { address, runs, max_len, name, target, inputs, outputs, crashes, seed };
    let mutator = Arc::new(BitFlipMutator::new(config.seed));

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(master::run(config, mutator))?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_fuzz(
    address: String,
    backend_kind: BackendKind,
    name: String,
    target: PathBuf,
    limit: u64,
    edges: bool,
    compcov: bool,
    laf: LafArg,
    laf_allowed_ranges: Vec<String>,
    seed: u64,
) -> anyhow::Result<()> {
    tracing::info!(%name, target = %target.display(), "starting worker");
    let mut snapshot = Snapshot::load(&target)?;
    if seed != 0 {
        snapshot.cpu.seed = seed;
    }
    let opts = BackendOptions {
        limit,
        edges,
        compcov,
        laf: laf.into(),
        laf_allowed_ranges: parse_ranges(&laf_allowed_ranges)?,
        trace_path: None,
        trace_type: None,
    };

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async move {
        match backend_kind {
            BackendKind::Bxcpu => {
                let mut backend = EmulatorBackend::new(ScriptedCpu::new(), snapshot.ram);
                drive_worker(&address, &mut backend, &opts, &snapshot.cpu, &snapshot.coverage_sites).await
            }
            #[cfg(target_os = "linux")]
            BackendKind::Kvm => {
                let mut backend = aero_fuzz::backend::kvm::KvmBackend::new(snapshot.ram)?;
                drive_worker(&address, &mut backend, &opts, &snapshot.cpu, &snapshot.coverage_sites).await
            }
            #[cfg(not(target_os = "linux"))]
            BackendKind::Kvm => anyhow::bail!("the kvm backend is only available on linux hosts"),
            #[cfg(target_os = "windows")]
            BackendKind::Whv => {
                let mut backend = aero_fuzz::backend::whv::WhvBackend::new(snapshot.ram)?;
                drive_worker(&address, &mut backend, &opts, &snapshot.cpu, &snapshot.coverage_sites).await
            }
            #[cfg(not(target_os = "windows"))]
            BackendKind::Whv => anyhow::bail!("the whv backend is only available on windows hosts"),
        }
    })
}

async fn drive_worker(
    address: &str,
    backend: &mut dyn Backend,
    opts: &BackendOptions,
    cpu_state: &aero_cpu_core::CpuState,
    coverage_sites: &[aero_snapshot::CoverageSite],
) -> anyhow::Result<()> {
    backend.initialize(opts, cpu_state)?;
    for site in coverage_sites {
        backend.install_coverage_breakpoint(site.gva)?;
    }
    tracing::info!(coverage_sites = coverage_sites.len(), "coverage breakpoints armed");

    let mut target = NullTarget;
    worker::run(address, backend, &mut target, cpu_state).await?;
    Ok(())
}

fn run_once(
    target: PathBuf,
    input: PathBuf,
    trace_type: Option<TraceTypeArg>,
    trace_path: Option<PathBuf>,
    limit: u64,
) -> anyhow::Result<()> {
    let snapshot = Snapshot::load(&target)?;
    let bytes = std::fs::read(&input)?;

    let opts = BackendOptions {
        limit,
        edges: false,
        compcov: false,
        laf: LafMode::Disabled,
        laf_allowed_ranges: Vec::new(),
        trace_path: trace_path.clone(),
        trace_type: trace_type.map(Into::into),
    };

    let mut backend = EmulatorBackend::new(ScriptedCpu::new(), snapshot.ram);
    backend.initialize(&opts, &snapshot.cpu)?;
    for site in &snapshot.coverage_sites {
        backend.install_coverage_breakpoint(site.gva)?;
    }

    let result = backend.run(&bytes)?;
    println!("{result:?}");
    Ok(())
}

/// Parse `--laf-allowed-ranges` entries of the form `0xSTART-0xEND` into
/// `(Gva, Gva)` pairs.
fn parse_ranges(raw: &[String]) -> anyhow::Result<Vec<(aero_types::Gva, aero_types::Gva)>> {
    raw.iter()
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (start, end) = entry
                .split_once('-')
                .ok_or_else(|| anyhow::anyhow!("malformed range {entry:?}, expected START-END"))?;
            let start = parse_hex(start)?;
            let end = parse_hex(end)?;
            Ok((aero_types::Gva::new(start), aero_types::Gva::new(end)))
        })
        .collect()
}

fn parse_hex(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    Ok(u64::from_str_radix(digits, 16)?)
}
