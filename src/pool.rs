//! Worker pool orchestrator.
//!
//! Keeps up to W worker processes busy with bursts sliced off the lazy test
//! sequence, counts failures per worker and stops early on an internal error
//! or when the failure limit is reached.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::expander::TestCase;
use crate::runner::{ProcessLauncher, Template};
use crate::snapshot::SnapshotLayout;
use crate::worker::{BurstStatus, WorkerJob};
use crate::Result;

/// Exit bit: failed tests were archived
pub const EXIT_FAILURES: i32 = 0x02;
/// Exit bit: a worker hit an internal error
pub const EXIT_INTERNAL: i32 = 0x04;
/// Exit bit: the failure limit was reached
pub const EXIT_LIMIT: i32 = 0x20;

/// Delay between two polls of the running workers
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running worker.
pub trait WorkerHandle: Send {
    /// Exit code, once the worker has finished. Death by signal reads as -1.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Kill the worker and reap it.
    fn kill(&mut self) -> Result<()>;
}

/// Starts workers on bursts.
pub trait WorkerSpawner {
    fn spawn(
        &mut self,
        worker: usize,
        failure_index: usize,
        burst: Vec<TestCase>,
    ) -> Result<Box<dyn WorkerHandle>>;
}

/// Handle of a worker child process.
#[derive(Debug)]
pub struct ChildHandle(Child);

impl WorkerHandle for ChildHandle {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self.0.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> Result<()> {
        match self.0.kill() {
            // already exited
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            other => other?,
        }
        self.0.wait()?;
        Ok(())
    }
}

/// Runs each burst as `<exe> worker --job <vm dir>/job.json`.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    /// The harness binary itself
    pub executable: PathBuf,
    /// Extra arguments passed on to every worker (verbosity)
    pub worker_args: Vec<String>,
    pub vm_root: PathBuf,
    pub fail_root: PathBuf,
    pub template: Template,
    pub layout: SnapshotLayout,
    pub launcher: ProcessLauncher,
    pub watchdog_secs: u64,
    pub seed: Option<u64>,
    bursts: u64,
}

impl ProcessSpawner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executable: PathBuf,
        worker_args: Vec<String>,
        vm_root: PathBuf,
        fail_root: PathBuf,
        template: Template,
        layout: SnapshotLayout,
        launcher: ProcessLauncher,
        watchdog_secs: u64,
        seed: Option<u64>,
    ) -> Self {
        Self {
            executable,
            worker_args,
            vm_root,
            fail_root,
            template,
            layout,
            launcher,
            watchdog_secs,
            seed,
            bursts: 0,
        }
    }

    /// VM directory of a worker slot
    pub fn worker_dir(vm_root: &Path, worker: usize) -> PathBuf {
        vm_root.join(worker.to_string())
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &mut self,
        worker: usize,
        failure_index: usize,
        burst: Vec<TestCase>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let vm_dir = Self::worker_dir(&self.vm_root, worker);
        let job = WorkerJob {
            worker,
            failure_index,
            vm_dir: vm_dir.clone(),
            fail_root: self.fail_root.clone(),
            template: self.template.clone(),
            layout: self.layout,
            launcher: self.launcher.clone(),
            watchdog_secs: self.watchdog_secs,
            // a distinct, reproducible stream per burst
            seed: self.seed.map(|s| s.wrapping_add(self.bursts)),
            burst,
        };
        self.bursts += 1;

        let path = vm_dir.join(WorkerJob::FILE_NAME);
        job.write(&path)?;
        let child = Command::new(&self.executable)
            .arg("worker")
            .arg("--job")
            .arg(&path)
            .args(&self.worker_args)
            .stdin(Stdio::null())
            .spawn()?;
        log::debug!("Worker {} started as pid {}", worker, child.id());
        Ok(Box::new(ChildHandle(child)))
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub failures_per_worker: Vec<usize>,
    pub internal_error: bool,
    pub limit_reached: bool,
    pub bursts_launched: usize,
    pub cases_launched: usize,
}

impl RunSummary {
    pub fn total_failures(&self) -> usize {
        self.failures_per_worker.iter().sum()
    }

    /// Process exit code: internal error and limit bits, plus the failure
    /// bit when the archive isn't empty.
    pub fn exit_code(&self, fail_dir_nonempty: bool) -> i32 {
        let mut code = 0;
        if self.internal_error {
            code |= EXIT_INTERNAL;
        }
        if self.limit_reached {
            code |= EXIT_LIMIT;
        }
        if fail_dir_nonempty {
            code |= EXIT_FAILURES;
        }
        code
    }
}

/// Fixed-size pool of worker slots.
pub struct Pool<S: WorkerSpawner> {
    spawner: S,
    workers: usize,
    burst_len: usize,
    failure_limit: Option<usize>,
    poll_interval: Duration,
}

struct Slots {
    running: Vec<Option<Box<dyn WorkerHandle>>>,
    failures: Vec<usize>,
}

impl Slots {
    fn idle(&self) -> bool {
        self.running.iter().all(Option::is_none)
    }

    fn kill_all(&mut self) {
        for (id, slot) in self.running.iter_mut().enumerate() {
            if let Some(mut handle) = slot.take() {
                if let Err(e) = handle.kill() {
                    log::error!("Could not kill worker {}: {}", id, e);
                }
            }
        }
    }
}

impl<S: WorkerSpawner> Pool<S> {
    pub fn new(spawner: S, workers: usize, burst_len: usize, failure_limit: Option<usize>) -> Self {
        Self {
            spawner,
            workers: workers.max(1),
            burst_len: burst_len.max(1),
            failure_limit,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Start the next burst on a slot. False once the sequence is exhausted.
    fn launch<I: Iterator<Item = TestCase>>(
        &mut self,
        id: usize,
        tasks: &mut I,
        slots: &mut Slots,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        let burst: Vec<TestCase> = tasks.by_ref().take(self.burst_len).collect();
        if burst.is_empty() {
            return Ok(false);
        }
        let len = burst.len();
        let handle = self.spawner.spawn(id, slots.failures[id], burst)?;
        slots.running[id] = Some(handle);
        summary.bursts_launched += 1;
        summary.cases_launched += len;
        log::debug!("Burst {} ({} cases) on worker {}", summary.bursts_launched, len, id);
        Ok(true)
    }

    fn limit_reached(&self, slots: &Slots) -> bool {
        self.failure_limit
            .is_some_and(|limit| slots.failures.iter().sum::<usize>() >= limit)
    }

    /// Run the sequence to exhaustion, to the failure limit, or to the first
    /// internal error.
    pub fn run<I: Iterator<Item = TestCase>>(&mut self, tasks: I) -> RunSummary {
        let mut tasks = tasks.fuse();
        let mut slots = Slots {
            running: (0..self.workers).map(|_| None).collect(),
            failures: vec![0; self.workers],
        };
        let mut summary = RunSummary::default();

        for id in 0..self.workers {
            match self.launch(id, &mut tasks, &mut slots, &mut summary) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    log::error!("Could not start worker {}: {}", id, e);
                    summary.internal_error = true;
                    break;
                }
            }
        }

        while !summary.internal_error && !slots.idle() {
            let mut reaped = false;
            for id in 0..self.workers {
                let Some(handle) = slots.running[id].as_mut() else {
                    continue;
                };
                let code = match handle.try_wait() {
                    Ok(Some(code)) => code,
                    Ok(None) => continue,
                    Err(e) => {
                        log::error!("Could not poll worker {}: {}", id, e);
                        summary.internal_error = true;
                        break;
                    }
                };
                slots.running[id] = None;
                reaped = true;

                match BurstStatus::from_code(code) {
                    Some(BurstStatus::Pass) => {}
                    Some(BurstStatus::Mismatch) => slots.failures[id] += 1,
                    _ => {
                        log::error!("Worker {} exited with status {:#x}", id, code);
                        summary.internal_error = true;
                        break;
                    }
                }

                if summary.limit_reached {
                    continue;
                }
                if self.limit_reached(&slots) {
                    log::error!("Failure limit reached, aborting the test");
                    summary.limit_reached = true;
                    continue;
                }
                if let Err(e) = self.launch(id, &mut tasks, &mut slots, &mut summary) {
                    log::error!("Could not restart worker {}: {}", id, e);
                    summary.internal_error = true;
                    break;
                }
            }
            if !reaped && !summary.internal_error {
                thread::sleep(self.poll_interval);
            }
        }

        if summary.internal_error {
            slots.kill_all();
        }
        summary.failures_per_worker = slots.failures;
        summary
    }
}

/// Temporary VM and failure roots of one run.
#[derive(Debug, Clone)]
pub struct RunRoots {
    pub vm_root: PathBuf,
    pub fail_root: PathBuf,
}

impl RunRoots {
    /// `emutest*` under `temp_storage` and `fail-*` under `fail_dir`
    pub fn create(temp_storage: &Path, fail_dir: &Path) -> Result<Self> {
        fs::create_dir_all(temp_storage)?;
        fs::create_dir_all(fail_dir)?;
        let vm_root = tempfile::Builder::new()
            .prefix("emutest")
            .tempdir_in(temp_storage)?
            .into_path();
        let fail_root = tempfile::Builder::new()
            .prefix("fail-")
            .tempdir_in(fail_dir)?
            .into_path();
        Ok(Self { vm_root, fail_root })
    }

    /// Remove the VM root, and the failure root too when the run was clean.
    /// Workers that hit an internal error have copied their VM directory
    /// into the archive already.
    pub fn finish(&self, exit_code: i32) -> Result<()> {
        fs::remove_dir_all(&self.vm_root)?;
        if exit_code == 0 {
            fs::remove_dir_all(&self.fail_root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateValue;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Finishes with `code` after `polls` unsuccessful polls, or never.
    struct FakeHandle {
        code: Option<i32>,
        polls: usize,
        kills: Arc<AtomicUsize>,
    }

    impl WorkerHandle for FakeHandle {
        fn try_wait(&mut self) -> Result<Option<i32>> {
            if self.polls > 0 {
                self.polls -= 1;
                return Ok(None);
            }
            Ok(self.code)
        }

        fn kill(&mut self) -> Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSpawner {
        /// Exit codes handed out in spawn order; 0 once exhausted
        script: VecDeque<Option<i32>>,
        spawned: Vec<(usize, usize, usize)>,
        kills: Arc<AtomicUsize>,
    }

    impl FakeSpawner {
        fn scripted(codes: &[Option<i32>]) -> Self {
            Self {
                script: codes.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl WorkerSpawner for FakeSpawner {
        fn spawn(
            &mut self,
            worker: usize,
            failure_index: usize,
            burst: Vec<TestCase>,
        ) -> Result<Box<dyn WorkerHandle>> {
            self.spawned.push((worker, failure_index, burst.len()));
            Ok(Box::new(FakeHandle {
                code: self.script.pop_front().unwrap_or(Some(0)),
                polls: 1,
                kills: self.kills.clone(),
            }))
        }
    }

    fn tasks(n: u64) -> impl Iterator<Item = TestCase> {
        (0..n).map(|i| TestCase {
            descriptor: 0,
            insn: vec![0x90],
            state: vec![(crate::state::Location::data(0), StateValue::Int(i))],
        })
    }

    fn pool(spawner: FakeSpawner, workers: usize, burst: usize, limit: Option<usize>) -> Pool<FakeSpawner> {
        Pool::new(spawner, workers, burst, limit).with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_runs_to_exhaustion() {
        let mut pool = pool(FakeSpawner::default(), 2, 3, None);
        let summary = pool.run(tasks(10));

        assert_eq!(summary.bursts_launched, 4);
        assert_eq!(summary.cases_launched, 10);
        assert_eq!(summary.total_failures(), 0);
        assert_eq!(summary.exit_code(false), 0);
        let sizes: Vec<usize> = pool.spawner.spawned.iter().map(|s| s.2).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_fewer_bursts_than_workers() {
        let mut pool = pool(FakeSpawner::default(), 8, 5, None);
        let summary = pool.run(tasks(7));
        assert_eq!(summary.bursts_launched, 2);
        assert_eq!(summary.failures_per_worker.len(), 8);
    }

    #[test]
    fn test_failures_counted_per_worker() {
        let spawner = FakeSpawner::scripted(&[Some(1), Some(0), Some(1)]);
        let mut pool = pool(spawner, 2, 1, None);
        let summary = pool.run(tasks(4));

        assert_eq!(summary.failures_per_worker, vec![2, 0]);
        assert!(!summary.limit_reached);
        assert_eq!(summary.exit_code(true), EXIT_FAILURES);
        // the failure index of a relaunch is the slot's failure count so far
        assert_eq!(pool.spawner.spawned[2], (0, 1, 1));
    }

    #[test]
    fn test_failure_limit_stops_launching() {
        let spawner = FakeSpawner::scripted(&[Some(1); 16]);
        let mut pool = pool(spawner, 2, 1, Some(2));
        let summary = pool.run(tasks(100));

        assert!(summary.limit_reached);
        assert_eq!(summary.bursts_launched, 3);
        assert_eq!(summary.total_failures(), 3);
        assert_eq!(summary.exit_code(true), EXIT_LIMIT | EXIT_FAILURES);
        // in-flight workers were drained, not killed
        assert_eq!(pool.spawner.kills.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_internal_error_kills_in_flight_workers() {
        // worker 0 fails hard, workers 1 and 2 never finish
        let spawner = FakeSpawner::scripted(&[Some(2), None, None]);
        let mut pool = pool(spawner, 3, 1, None);
        let summary = pool.run(tasks(100));

        assert!(summary.internal_error);
        assert_eq!(summary.bursts_launched, 3);
        assert_eq!(pool.spawner.kills.load(Ordering::SeqCst), 2);
        assert_eq!(summary.exit_code(false), EXIT_INTERNAL);
        assert_eq!(summary.exit_code(true), EXIT_INTERNAL | EXIT_FAILURES);
    }

    #[test]
    fn test_unknown_exit_code_is_internal() {
        let spawner = FakeSpawner::scripted(&[Some(-1)]);
        let mut pool = pool(spawner, 1, 1, None);
        assert!(pool.run(tasks(5)).internal_error);
    }

    #[test]
    fn test_roots_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let roots = RunRoots::create(&tmp.path().join("vms"), &tmp.path().join("fails")).unwrap();
        assert!(roots.vm_root.file_name().unwrap().to_str().unwrap().starts_with("emutest"));
        assert!(roots.fail_root.file_name().unwrap().to_str().unwrap().starts_with("fail-"));

        roots.finish(EXIT_FAILURES).unwrap();
        assert!(!roots.vm_root.exists());
        assert!(roots.fail_root.exists());

        let roots = RunRoots::create(&tmp.path().join("vms"), &tmp.path().join("fails")).unwrap();
        roots.finish(EXIT_INTERNAL | EXIT_LIMIT).unwrap();
        assert!(!roots.vm_root.exists());
        assert!(roots.fail_root.exists());

        let roots = RunRoots::create(&tmp.path().join("vms"), &tmp.path().join("fails")).unwrap();
        roots.finish(0).unwrap();
        assert!(!roots.vm_root.exists());
        assert!(!roots.fail_root.exists());
    }

    #[test]
    fn test_exit_bits_combine() {
        let summary = RunSummary {
            internal_error: true,
            limit_reached: true,
            ..Default::default()
        };
        assert_eq!(summary.exit_code(true), EXIT_INTERNAL | EXIT_LIMIT | EXIT_FAILURES);
        assert_eq!(summary.exit_code(false), EXIT_INTERNAL | EXIT_LIMIT);
    }

    #[cfg(unix)]
    fn wait_for(handle: &mut dyn WorkerHandle) -> i32 {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(code) = handle.try_wait().unwrap() {
                return code;
            }
            assert!(std::time::Instant::now() < deadline, "child did not exit");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[cfg(unix)]
    fn sh(script: &str) -> ChildHandle {
        ChildHandle(Command::new("sh").arg("-c").arg(script).spawn().unwrap())
    }

    #[cfg(unix)]
    #[test]
    fn test_child_exit_codes() {
        assert_eq!(wait_for(&mut sh("exit 0")), 0);
        assert_eq!(wait_for(&mut sh("exit 1")), 1);
        // death by signal
        assert_eq!(wait_for(&mut sh("kill -9 $$")), -1);
    }

    #[cfg(unix)]
    #[test]
    fn test_child_kill() {
        let started = std::time::Instant::now();
        let mut child = ChildHandle(Command::new("sleep").arg("5").spawn().unwrap());
        assert_eq!(child.try_wait().unwrap(), None);

        child.kill().unwrap();
        assert_eq!(child.try_wait().unwrap(), Some(-1));
        assert!(started.elapsed() < Duration::from_secs(5));
        // killing a reaped child is not an error
        child.kill().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_process_spawner_writes_job_and_argv() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        // stands in for the emutest binary: records its arguments
        let exe = tmp.path().join("fake-emutest");
        fs::write(&exe, "#!/bin/sh\nprintf '%s\\n' \"$@\" > \"$(dirname \"$0\")/argv\"\nexit 1\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();

        let vm_root = tmp.path().join("vms");
        fs::create_dir_all(ProcessSpawner::worker_dir(&vm_root, 1)).unwrap();
        let template = Template {
            sav: tmp.path().join("config.sav"),
            mem: tmp.path().join("guest.mem"),
            mem_name: "guest.mem".to_string(),
        };
        let mut spawner = ProcessSpawner::new(
            exe,
            vec!["-vvv".to_string()],
            vm_root.clone(),
            tmp.path().join("fail"),
            template.clone(),
            SnapshotLayout::for_burst(4),
            ProcessLauncher::new("/usr/bin/vm", Vec::new()),
            30,
            Some(100),
        );

        let mut first = spawner.spawn(1, 0, tasks(3).collect()).unwrap();
        assert_eq!(wait_for(first.as_mut()), 1);
        let mut second = spawner.spawn(1, 4, tasks(2).collect()).unwrap();
        assert_eq!(wait_for(second.as_mut()), 1);

        let job_path = ProcessSpawner::worker_dir(&vm_root, 1).join(WorkerJob::FILE_NAME);
        let argv = fs::read_to_string(tmp.path().join("argv")).unwrap();
        let expected = format!("worker\n--job\n{}\n-vvv\n", job_path.display());
        assert_eq!(argv, expected);

        // the job file holds the latest burst, with its own seed
        let job = WorkerJob::read(&job_path).unwrap();
        assert_eq!(job.worker, 1);
        assert_eq!(job.failure_index, 4);
        assert_eq!(job.burst.len(), 2);
        assert_eq!(job.seed, Some(101));
        assert_eq!(job.template, template);
        assert_eq!(job.watchdog_secs, 30);
    }
}
