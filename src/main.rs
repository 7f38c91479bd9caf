use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

use emutest::config::{HarnessConfig, RunOptions};
use emutest::decoder::CapstoneDecoder;
use emutest::expander::{self, Sampler};
use emutest::oracle::FailureArchive;
use emutest::pool::{Pool, ProcessSpawner, RunRoots};
use emutest::report::{self, ReportFormat};
use emutest::runner::{self, VmDir};
use emutest::tables::TestModule;
use emutest::worker::{BurstStatus, WorkerJob};

/// Directory the template VM boots in, also its name in the failure archive
const TEMPLATE_DIR: &str = "emutest-vm-template";

/// Differential instruction-emulation tester
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[clap(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a test module against hardware virtualization and the emulator
    Run(RunOptions),

    /// Execute one burst (started by `run`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        job: PathBuf,
    },

    /// Explain an archived failure
    Report {
        /// Archive directory holding init.mem, hvt.mem and emu.mem
        dir: PathBuf,

        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },

    /// Print the number of test cases of a module
    Count {
        #[arg(short = 'i', long)]
        test_module: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init the logger to, at minimum, info level
    let mut log_level = cli.verbosity.log_level_filter();
    if matches!(
        log_level,
        log::LevelFilter::Off | log::LevelFilter::Warn | log::LevelFilter::Error
    ) {
        log_level = log::LevelFilter::Info;
    }
    env_logger::Builder::new().filter_level(log_level).init();

    match cli.command {
        Command::Run(opts) => {
            let code = run(&opts, worker_verbosity(log_level))?;
            std::process::exit(code);
        }
        Command::Worker { job } => {
            let status = match WorkerJob::read(&job) {
                Ok(job) => job.run(),
                Err(e) => {
                    log::error!("Cannot read job {}: {}", job.display(), e);
                    BurstStatus::InternalError
                }
            };
            std::process::exit(status.code());
        }
        Command::Report { dir, format } => {
            let report = report::analyze(&dir, &CapstoneDecoder)
                .with_context(|| format!("analyzing {}", dir.display()))?;
            print!("{}", format.formatter().format(&report)?);
            Ok(())
        }
        Command::Count { test_module } => count(&test_module),
    }
}

/// Verbosity flags handed on to worker processes
fn worker_verbosity(level: log::LevelFilter) -> Vec<String> {
    match level {
        log::LevelFilter::Debug => vec!["-vvv".to_string()],
        log::LevelFilter::Trace => vec!["-vvvv".to_string()],
        _ => Vec::new(),
    }
}

fn count(name: &str) -> Result<()> {
    let module = TestModule::from_name(name)?;
    let descs = module.load()?;
    for desc in &descs {
        println!("{:>12}  {}", expander::variant_count(desc), desc);
    }
    println!("{:>12}  total ({} descriptors)", expander::total_count(&descs), descs.len());
    Ok(())
}

fn run(opts: &RunOptions, worker_args: Vec<String>) -> Result<i32> {
    let cpus = thread::available_parallelism().map_or(1, |n| n.get());
    let config = HarnessConfig::from_options(opts, cpus)?;
    let descs = config.module.load()?;
    log::info!(
        "Module {}: {} descriptors, {} test cases, {} per burst, {} workers",
        config.module,
        descs.len(),
        expander::total_count(&descs),
        config.layout.subtests,
        config.workers
    );

    let roots = RunRoots::create(&config.temp_storage, &config.fail_dir)
        .context("creating the run directories")?;
    log::info!("VMs in {}, failures in {}", roots.vm_root.display(), roots.fail_root.display());
    let archive = FailureArchive::new(&roots.fail_root);
    let timeout = Duration::from_secs(config.watchdog_secs);

    let template_dir = VmDir::create(roots.vm_root.join(TEMPLATE_DIR), &config.vm)?;
    let template = match runner::bootstrap(&template_dir, &config.launcher, timeout) {
        Ok(template) => template,
        Err(e) => {
            if let Err(copy) = archive.store_named_tree(TEMPLATE_DIR, template_dir.root()) {
                log::error!("Cannot archive the template VM: {}", copy);
            }
            return Err(e).context("bootstrapping the template VM");
        }
    };

    for id in 0..config.workers {
        VmDir::create(ProcessSpawner::worker_dir(&roots.vm_root, id), &config.vm)?;
    }
    let spawner = ProcessSpawner::new(
        env::current_exe().context("locating the emutest binary")?,
        worker_args,
        roots.vm_root.clone(),
        roots.fail_root.clone(),
        template,
        config.layout,
        config.launcher.clone(),
        config.watchdog_secs,
        config.seed,
    );
    let mut pool = Pool::new(
        spawner,
        config.workers,
        config.layout.subtests,
        config.failure_limit,
    );

    let tasks = expander::expand(&descs);
    let summary = match config.sample {
        Some(percent) => {
            let rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            pool.run(Sampler::new(tasks, percent, rng))
        }
        None => pool.run(tasks),
    };

    let code = summary.exit_code(!archive.is_empty()?);
    log::info!(
        "{} bursts ({} test cases) run, {} failures, exit code {:#x}",
        summary.bursts_launched,
        summary.cases_launched,
        summary.total_failures(),
        code
    );
    if summary.limit_reached {
        log::warn!("Failure limit reached, the run was cut short");
    }
    roots.finish(code)?;
    Ok(code)
}
