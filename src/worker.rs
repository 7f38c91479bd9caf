//! Per-burst worker: inject, run under both backends, compare, archive.
//!
//! A worker runs in its own process. It reads a [`WorkerJob`] written by the
//! pool and reports the outcome of the burst through its exit code.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::expander::TestCase;
use crate::oracle::{compare, diff_len, diff_ranges, FailureArchive};
use crate::runner::{DualRun, ProcessLauncher, Template, VmDir, VmLauncher};
use crate::snapshot::{inject_burst, SnapshotLayout, TEST_START};
use crate::{EmuTestError, ExecMode, Result};

/// Outcome of one burst, carried as the worker's exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstStatus {
    /// Both backends left identical memory
    Pass = 0,
    /// The images differ
    Mismatch = 1,
    /// The harness failed: I/O, VM exit, watchdog
    InternalError = 2,
}

impl BurstStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(BurstStatus::Pass),
            1 => Some(BurstStatus::Mismatch),
            2 => Some(BurstStatus::InternalError),
            _ => None,
        }
    }
}

/// Everything a worker process needs to run one burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub worker: usize,
    /// Index of the archive directory a failure of this burst goes to
    pub failure_index: usize,
    pub vm_dir: PathBuf,
    pub fail_root: PathBuf,
    pub template: Template,
    pub layout: SnapshotLayout,
    pub launcher: ProcessLauncher,
    pub watchdog_secs: u64,
    /// Seeds the randomized SIMD and x87 register contents
    pub seed: Option<u64>,
    pub burst: Vec<TestCase>,
}

impl WorkerJob {
    pub const FILE_NAME: &'static str = "job.json";

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Run the job in the current process.
    pub fn run(&self) -> BurstStatus {
        let worker = Worker {
            id: self.worker,
            failure_index: self.failure_index,
            dir: VmDir::open(&self.vm_dir),
            archive: FailureArchive::new(&self.fail_root),
            template: &self.template,
            layout: self.layout,
            launcher: &self.launcher,
            timeout: Duration::from_secs(self.watchdog_secs),
        };
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        worker.run_burst(&self.burst, &mut rng)
    }
}

/// One worker slot with its persistent VM directory.
pub struct Worker<'a, L: VmLauncher + ?Sized> {
    pub id: usize,
    pub failure_index: usize,
    pub dir: VmDir,
    pub archive: FailureArchive,
    pub template: &'a Template,
    pub layout: SnapshotLayout,
    pub launcher: &'a L,
    pub timeout: Duration,
}

impl<'a, L: VmLauncher + ?Sized> Worker<'a, L> {
    /// Run a burst and archive whatever a failure leaves behind.
    pub fn run_burst<R: Rng + ?Sized>(&self, burst: &[TestCase], rng: &mut R) -> BurstStatus {
        match self.try_burst(burst, rng) {
            Ok(status) => status,
            Err(EmuTestError::Io(e)) => {
                log::error!("Worker {} hit an I/O error: {}", self.id, e);
                if let Err(e) = self.archive.store_partial(self.id, self.failure_index, &self.dir) {
                    log::error!("Worker {} could not archive the burst: {}", self.id, e);
                }
                BurstStatus::InternalError
            }
            Err(e) => {
                log::error!("Worker {} got an exception: {}", self.id, e);
                if let Err(e) = self.archive.store_tree(self.id, self.failure_index, self.dir.root()) {
                    log::error!("Worker {} could not archive its VM directory: {}", self.id, e);
                }
                BurstStatus::InternalError
            }
        }
    }

    fn try_burst<R: Rng + ?Sized>(&self, burst: &[TestCase], rng: &mut R) -> Result<BurstStatus> {
        let (sav, mut mem) = self.template.load()?;
        inject_burst(&mut mem, &self.layout, burst, rng)?;
        fs::write(self.dir.init_mem(), &mem)?;
        // the dual run rewrites the mode word
        let init = mem.clone();

        let run = DualRun {
            dir: &self.dir,
            launcher: self.launcher,
            timeout: self.timeout,
            mem_name: &self.template.mem_name,
        };
        run.execute(&mut mem, &sav)?;

        let hvt = fs::read(self.dir.test_mem(ExecMode::Hardware))?;
        let emu = fs::read(self.dir.test_mem(ExecMode::Emulation))?;
        if compare(&hvt, &emu, TEST_START) {
            log::debug!("Worker {}: {} subtests passed", self.id, burst.len());
            return Ok(BurstStatus::Pass);
        }

        let ranges = diff_ranges(&hvt, &emu, TEST_START);
        log::warn!(
            "Worker {}: backends differ in {} bytes ({} ranges, first at {:#x})",
            self.id,
            diff_len(&ranges),
            ranges.len(),
            ranges.first().map_or(0, |r| r.start)
        );
        let dest = self
            .archive
            .store_mismatch(self.id, self.failure_index, &self.dir, &init)?;
        log::info!("Failed burst stored in {}", dest.display());
        Ok(BurstStatus::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Pool, WorkerHandle, WorkerSpawner, EXIT_FAILURES, EXIT_INTERNAL};
    use crate::runner::{VmConfig, INIT_MEM, VM_LOG};
    use crate::snapshot::{SnapshotLayout, EXEC_MODE_OFFSET, TEST_SWITCHER};
    use crate::state::{Location, StateValue};

    const MEM_NAME: &str = "guest.mem";

    /// Leaves the memory file untouched, except that it flips one byte of
    /// the first data slot under emulation when `diverge` is set.
    struct EchoLauncher {
        diverge: bool,
        exit: Option<i32>,
    }

    impl VmLauncher for EchoLauncher {
        fn run(&self, vm_dir: &Path, label: &str, _: Duration) -> crate::Result<()> {
            if let Some(code) = self.exit {
                return Err(EmuTestError::VmExit {
                    mode: label.to_string(),
                    code: Some(code),
                });
            }
            let path = vm_dir.join(MEM_NAME);
            let mut mem = fs::read(&path)?;
            if self.diverge && mem[TEST_SWITCHER + EXEC_MODE_OFFSET] == ExecMode::Emulation as u8 {
                mem[SnapshotLayout::data_slot(0).start] ^= 0xff;
            }
            fs::write(&path, mem)?;
            fs::write(vm_dir.join(VM_LOG), label)?;
            Ok(())
        }
    }

    fn setup(root: &Path) -> (VmDir, Template, SnapshotLayout) {
        let layout = SnapshotLayout::for_burst(4);
        let template_dir = root.join("template");
        fs::create_dir_all(&template_dir).unwrap();
        let template = Template {
            sav: template_dir.join("config.sav"),
            mem: template_dir.join(MEM_NAME),
            mem_name: MEM_NAME.to_string(),
        };
        fs::write(&template.sav, b"sav").unwrap();
        fs::write(&template.mem, vec![0u8; layout.memory_bytes()]).unwrap();
        let dir = VmDir::create(root.join("0"), &VmConfig::new("boot.iso", layout.memory_mib, "")).unwrap();
        (dir, template, layout)
    }

    fn burst() -> Vec<TestCase> {
        vec![TestCase {
            descriptor: 0,
            insn: vec![0x01, 0x03],
            state: vec![(Location::reg("rbx"), StateValue::Int(0x3000))],
        }]
    }

    fn worker<'a>(
        dir: VmDir,
        template: &'a Template,
        layout: SnapshotLayout,
        launcher: &'a EchoLauncher,
        fail_root: &Path,
    ) -> Worker<'a, EchoLauncher> {
        Worker {
            id: 0,
            failure_index: 0,
            dir,
            archive: FailureArchive::new(fail_root),
            template,
            layout,
            launcher,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_status_codes() {
        for status in [BurstStatus::Pass, BurstStatus::Mismatch, BurstStatus::InternalError] {
            assert_eq!(BurstStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(BurstStatus::from_code(-1), None);
    }

    #[test]
    fn test_identical_backends_pass() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, template, layout) = setup(tmp.path());
        let launcher = EchoLauncher { diverge: false, exit: None };
        let fail = tmp.path().join("fail");
        let w = worker(dir, &template, layout, &launcher, &fail);

        assert_eq!(w.run_burst(&burst(), &mut StdRng::seed_from_u64(1)), BurstStatus::Pass);
        assert!(FailureArchive::new(&fail).is_empty().unwrap());
    }

    #[test]
    fn test_divergence_is_archived() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, template, layout) = setup(tmp.path());
        let launcher = EchoLauncher { diverge: true, exit: None };
        let fail = tmp.path().join("fail");
        let w = worker(dir, &template, layout, &launcher, &fail);

        assert_eq!(w.run_burst(&burst(), &mut StdRng::seed_from_u64(1)), BurstStatus::Mismatch);
        let case = fail.join("0").join("0");
        assert_eq!(fs::read_dir(&case).unwrap().count(), 5);
        assert_eq!(fs::read_to_string(case.join("emu.log")).unwrap(), "emu");
    }

    #[test]
    fn test_vm_exit_is_internal_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, template, layout) = setup(tmp.path());
        let launcher = EchoLauncher { diverge: false, exit: Some(7) };
        let fail = tmp.path().join("fail");
        let w = worker(dir, &template, layout, &launcher, &fail);

        assert_eq!(w.run_burst(&burst(), &mut StdRng::seed_from_u64(1)), BurstStatus::InternalError);
        // the whole VM directory was copied
        assert!(fail.join("0").join("0").join("config.json").is_file());
    }

    #[test]
    fn test_missing_template_is_internal_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, template, layout) = setup(tmp.path());
        fs::remove_file(&template.mem).unwrap();
        fs::write(dir.log(), "booting").unwrap();
        let launcher = EchoLauncher { diverge: false, exit: None };
        let fail = tmp.path().join("fail");
        let w = worker(dir, &template, layout, &launcher, &fail);

        assert_eq!(w.run_burst(&burst(), &mut StdRng::seed_from_u64(1)), BurstStatus::InternalError);
        // whatever was there is salvaged
        assert!(fail.join("0").join("0").join(VM_LOG).is_file());
    }

    /// Runs every burst in-process on one worker slot.
    struct InlineSpawner<'a> {
        worker: Worker<'a, EchoLauncher>,
    }

    struct Finished(i32);

    impl WorkerHandle for Finished {
        fn try_wait(&mut self) -> crate::Result<Option<i32>> {
            Ok(Some(self.0))
        }

        fn kill(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    impl WorkerSpawner for InlineSpawner<'_> {
        fn spawn(
            &mut self,
            _: usize,
            failure_index: usize,
            burst: Vec<TestCase>,
        ) -> crate::Result<Box<dyn WorkerHandle>> {
            self.worker.failure_index = failure_index;
            let status = self.worker.run_burst(&burst, &mut StdRng::seed_from_u64(1));
            Ok(Box::new(Finished(status.code())))
        }
    }

    #[test]
    fn test_filesystem_failure_aborts_the_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, template, layout) = setup(tmp.path());
        fs::remove_file(&template.mem).unwrap();
        let launcher = EchoLauncher { diverge: false, exit: None };
        let fail = tmp.path().join("fail");
        let spawner = InlineSpawner {
            worker: worker(dir, &template, layout, &launcher, &fail),
        };

        let mut pool = Pool::new(spawner, 1, 1, Some(10)).with_poll_interval(Duration::from_millis(1));
        let summary = pool.run(std::iter::repeat(burst()).flatten().take(5));

        assert!(summary.internal_error);
        assert_eq!(summary.bursts_launched, 1);
        assert_eq!(summary.total_failures(), 0);
        assert_eq!(summary.exit_code(true), EXIT_INTERNAL | EXIT_FAILURES);
    }

    #[test]
    fn test_archived_initial_image_is_pre_run() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, template, layout) = setup(tmp.path());
        let written = dir.init_mem();
        let launcher = EchoLauncher { diverge: true, exit: None };
        let fail = tmp.path().join("fail");
        let w = worker(dir, &template, layout, &launcher, &fail);

        assert_eq!(w.run_burst(&burst(), &mut StdRng::seed_from_u64(1)), BurstStatus::Mismatch);
        let archived = fs::read(fail.join("0").join("0").join(INIT_MEM)).unwrap();
        assert_eq!(archived[TEST_SWITCHER + EXEC_MODE_OFFSET], ExecMode::Hardware as u8);
        assert_eq!(archived, fs::read(written).unwrap());
    }

    #[test]
    fn test_job_round_trips_through_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (dir, template, layout) = setup(tmp.path());
        let job = WorkerJob {
            worker: 2,
            failure_index: 5,
            vm_dir: dir.root().to_path_buf(),
            fail_root: tmp.path().join("fail"),
            template,
            layout,
            launcher: ProcessLauncher::new("/usr/bin/vm", vec!["--headless".into()]),
            watchdog_secs: 120,
            seed: Some(3),
            burst: burst(),
        };
        let path = tmp.path().join(WorkerJob::FILE_NAME);
        job.write(&path).unwrap();
        assert_eq!(WorkerJob::read(&path).unwrap(), job);
    }
}
