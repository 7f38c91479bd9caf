//! Run configuration: the `run` command line flags and their validated form.

use std::path::PathBuf;

use clap::Args;

use crate::runner::{ProcessLauncher, VmConfig};
use crate::snapshot::{SnapshotLayout, MAX_BURST};
use crate::tables::TestModule;
use crate::{EmuTestError, Result};

/// Flags of the `run` command
#[derive(Debug, Clone, Args)]
pub struct RunOptions {
    /// Directory to store failed test cases in
    #[arg(short = 'f', long, default_value = ".")]
    pub fail_dir: PathBuf,

    /// Directory to store the VMs in
    #[arg(short = 't', long, default_value = ".")]
    pub temp_storage: PathBuf,

    /// Number of tests executed by a single VM
    #[arg(short = 'b', long, default_value_t = 1000)]
    pub burst_size: usize,

    /// Number of VMs running simultaneously. Zero or less means the CPU
    /// count minus that many.
    #[arg(short = 'w', long, allow_hyphen_values = true)]
    pub number_of_workers: Option<i64>,

    /// Percentage of the instruction table to run, sampled at random
    #[arg(short = 's', long)]
    pub sample: Option<u8>,

    /// Number of failures after which the run is aborted
    #[arg(short = 'l', long)]
    pub failure_limit: Option<usize>,

    /// Additional `;`-separated system flags passed to every test VM
    #[arg(short = 'o', long, default_value = "")]
    pub system_flags: String,

    /// Maximum VM running time in seconds
    #[arg(short = 'd', long, default_value_t = 120)]
    pub vm_watchdog_timeout: u64,

    /// Test description module
    #[arg(short = 'i', long)]
    pub test_module: String,

    /// VM program started for every run
    #[arg(long)]
    pub vm_executable: PathBuf,

    /// Extra argument for the VM program (repeatable)
    #[arg(long = "vm-arg", allow_hyphen_values = true)]
    pub vm_args: Vec<String>,

    /// Guest image the template VM boots
    #[arg(long)]
    pub boot_iso: PathBuf,

    /// Seed for sampling and register randomization
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fail_dir: PathBuf,
    pub temp_storage: PathBuf,
    pub module: TestModule,
    pub layout: SnapshotLayout,
    pub workers: usize,
    pub sample: Option<u8>,
    pub failure_limit: Option<usize>,
    pub vm: VmConfig,
    pub launcher: ProcessLauncher,
    pub watchdog_secs: u64,
    pub seed: Option<u64>,
}

/// Worker count for `--number-of-workers`, given `cpus` available CPUs.
pub fn resolve_workers(requested: Option<i64>, cpus: usize) -> usize {
    match requested {
        Some(n) if n > 0 => n as usize,
        Some(n) => cpus.saturating_sub(n.unsigned_abs() as usize).max(1),
        None => cpus.max(1),
    }
}

impl HarnessConfig {
    pub fn from_options(opts: &RunOptions, cpus: usize) -> Result<Self> {
        let module = TestModule::from_name(&opts.test_module)?;

        if opts.burst_size == 0 || opts.burst_size > MAX_BURST {
            return Err(EmuTestError::Config(format!(
                "burst size must be within 1..={}, got {}",
                MAX_BURST, opts.burst_size
            )));
        }
        if let Some(sample) = opts.sample {
            if !(1..=100).contains(&sample) {
                return Err(EmuTestError::Config(format!(
                    "sample must be within 1..=100, got {}",
                    sample
                )));
            }
        }
        if opts.failure_limit == Some(0) {
            return Err(EmuTestError::Config("failure limit must be positive".to_string()));
        }
        if opts.vm_executable.as_os_str().is_empty() {
            return Err(EmuTestError::Config("no VM executable given".to_string()));
        }
        if opts.vm_watchdog_timeout == 0 {
            return Err(EmuTestError::Config("watchdog timeout must be positive".to_string()));
        }

        let layout = SnapshotLayout::for_burst(opts.burst_size);
        Ok(Self {
            fail_dir: opts.fail_dir.clone(),
            temp_storage: opts.temp_storage.clone(),
            module,
            layout,
            workers: resolve_workers(opts.number_of_workers, cpus),
            sample: opts.sample.filter(|&s| s < 100),
            failure_limit: opts.failure_limit,
            vm: VmConfig::new(&opts.boot_iso, layout.memory_mib, &opts.system_flags),
            launcher: ProcessLauncher::new(&opts.vm_executable, opts.vm_args.clone()),
            watchdog_secs: opts.vm_watchdog_timeout,
            seed: opts.seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        run: RunOptions,
    }

    fn options(extra: &[&str]) -> RunOptions {
        let mut argv = vec![
            "emutest",
            "--test-module",
            "gp",
            "--vm-executable",
            "/usr/bin/vm",
            "--boot-iso",
            "boot.iso",
        ];
        argv.extend_from_slice(extra);
        Cli::parse_from(argv).run
    }

    #[rstest]
    #[case(None, 8, 8)]
    #[case(Some(3), 8, 3)]
    #[case(Some(0), 8, 8)]
    #[case(Some(-2), 8, 6)]
    #[case(Some(-20), 8, 1)]
    fn test_resolve_workers(#[case] requested: Option<i64>, #[case] cpus: usize, #[case] expected: usize) {
        assert_eq!(resolve_workers(requested, cpus), expected);
    }

    #[test]
    fn test_defaults() {
        let opts = options(&[]);
        assert_eq!(opts.burst_size, 1000);
        assert_eq!(opts.vm_watchdog_timeout, 120);
        assert_eq!(opts.fail_dir, PathBuf::from("."));

        let config = HarnessConfig::from_options(&opts, 4).unwrap();
        assert_eq!(config.module, TestModule::Gp);
        assert_eq!(config.workers, 4);
        assert_eq!(config.layout, SnapshotLayout::for_burst(1000));
        assert_eq!(config.vm.memory_mib, 17);
        assert_eq!(config.sample, None);
    }

    #[test]
    fn test_negative_worker_count_parses() {
        let opts = options(&["-w", "-1", "--vm-arg", "--headless"]);
        assert_eq!(opts.number_of_workers, Some(-1));
        assert_eq!(opts.vm_args, vec!["--headless".to_string()]);
        assert_eq!(HarnessConfig::from_options(&opts, 4).unwrap().workers, 3);
    }

    #[test]
    fn test_full_sample_is_no_sample() {
        let opts = options(&["--sample", "100"]);
        assert_eq!(HarnessConfig::from_options(&opts, 1).unwrap().sample, None);
    }

    #[rstest]
    #[case(&["--burst-size", "0"])]
    #[case(&["--burst-size", "1048577"])]
    #[case(&["--burst-size", "18446744073709551615"])]
    #[case(&["--sample", "0"])]
    #[case(&["--sample", "101"])]
    #[case(&["--failure-limit", "0"])]
    #[case(&["--vm-watchdog-timeout", "0"])]
    fn test_rejected_options(#[case] extra: &[&str]) {
        let err = HarnessConfig::from_options(&options(extra), 4).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_bad_module_name() {
        let mut opts = options(&[]);
        opts.test_module = "../gp".to_string();
        let err = HarnessConfig::from_options(&opts, 4).unwrap_err();
        assert!(matches!(err, EmuTestError::InvalidTestModule(_)));
    }
}
