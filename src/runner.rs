//! Dual-backend runner: boots one snapshot under hardware virtualization and
//! then under software emulation, keeping both resulting memory images.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wait_timeout::ChildExt;

use crate::snapshot::{patch_bootstrap, set_exec_mode};
use crate::{EmuTestError, ExecMode, Result};

pub const CONFIG_FILE: &str = "config.json";
pub const SAVE_FILE: &str = "config.sav";
pub const VM_LOG: &str = "vm.log";
pub const TEST_DIR: &str = "test";
pub const INIT_MEM: &str = "init.mem";
const MEM_EXTENSION: &str = "mem";

/// Hypervisor flags every test VM runs with. Devices that would raise
/// interrupts during a burst are disabled and snapshots stay uncompressed.
pub const BASE_SYSTEM_FLAGS: &[&str] = &[
    "devices.apm.enable=0",
    "devices.acpi=0",
    "devices.apic.disable=1",
    "devices.hpet.enable=0",
    "vm.ballooning.enabled=0",
    "vm.snapshot_compressed=0",
    "vm.mem_compressed=0",
    "vm.mem_anonymous=0",
    "kernel.emu_instr_print=1",
    "kernel.lock_by_block=0",
];

/// Configuration handed to the VM executable as `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub system_flags: Vec<String>,
    pub boot_iso: PathBuf,
    pub cpus: u32,
    pub memory_mib: usize,
    pub video_memory_mib: u32,
    pub network: bool,
}

impl VmConfig {
    /// Single-CPU, network-less test VM. `extra_flags` is a `;`-separated
    /// list appended to the base flags.
    pub fn new(boot_iso: impl Into<PathBuf>, memory_mib: usize, extra_flags: &str) -> Self {
        let system_flags = BASE_SYSTEM_FLAGS
            .iter()
            .map(|f| f.to_string())
            .chain(
                extra_flags
                    .split(';')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from),
            )
            .collect();
        Self {
            system_flags,
            boot_iso: boot_iso.into(),
            cpus: 1,
            memory_mib,
            video_memory_mib: 2,
            network: false,
        }
    }
}

/// Boots a VM directory and waits for the guest to stop.
pub trait VmLauncher: Send + Sync {
    /// Run the VM configured in `vm_dir` to completion.
    ///
    /// `label` names the run in errors. Fails with [`EmuTestError::VmExit`]
    /// on a non-zero exit and [`EmuTestError::Watchdog`] when `timeout`
    /// expires.
    fn run(&self, vm_dir: &Path, label: &str, timeout: Duration) -> Result<()>;
}

/// Launches an external VM executable as `<exe> <args..> <config.json>`,
/// with its output captured in `vm.log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLauncher {
    pub executable: PathBuf,
    pub args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }
}

impl VmLauncher for ProcessLauncher {
    fn run(&self, vm_dir: &Path, label: &str, timeout: Duration) -> Result<()> {
        let log = File::create(vm_dir.join(VM_LOG))?;
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .arg(vm_dir.join(CONFIG_FILE))
            .current_dir(vm_dir)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()?;
        log::trace!("Started {} VM (pid {}) in {}", label, child.id(), vm_dir.display());

        match child.wait_timeout(timeout)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(EmuTestError::VmExit {
                mode: label.to_string(),
                code: status.code(),
            }),
            None => {
                log::warn!("{} VM in {} hit the watchdog, killing it", label, vm_dir.display());
                let _ = child.kill();
                child.wait()?;
                Err(EmuTestError::Watchdog(timeout.as_secs()))
            }
        }
    }
}

/// Paths of a worker's persistent VM directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDir {
    root: PathBuf,
}

impl VmDir {
    /// Create the directory tree and write the VM configuration.
    pub fn create(root: impl Into<PathBuf>, config: &VmConfig) -> Result<Self> {
        let dir = Self::open(root);
        fs::create_dir_all(dir.test_dir())?;
        fs::write(dir.config(), serde_json::to_vec_pretty(config)?)?;
        Ok(dir)
    }

    /// Refer to an existing directory.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn sav(&self) -> PathBuf {
        self.root.join(SAVE_FILE)
    }

    pub fn log(&self) -> PathBuf {
        self.root.join(VM_LOG)
    }

    pub fn mem(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn test_dir(&self) -> PathBuf {
        self.root.join(TEST_DIR)
    }

    /// Memory image left behind by `mode`
    pub fn test_mem(&self, mode: ExecMode) -> PathBuf {
        self.test_dir().join(format!("{}.mem", mode.stem()))
    }

    /// VM log of `mode`
    pub fn test_log(&self, mode: ExecMode) -> PathBuf {
        self.test_dir().join(format!("{}.log", mode.stem()))
    }

    pub fn init_mem(&self) -> PathBuf {
        self.test_dir().join(INIT_MEM)
    }

    /// Every `*.mem` file directly under the root
    fn memory_snapshots(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == MEM_EXTENSION) {
                found.push(path);
            }
        }
        Ok(found)
    }
}

/// Saved state and memory of the booted template VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub sav: PathBuf,
    pub mem: PathBuf,
    /// File name the VM executable expects its memory image under
    pub mem_name: String,
}

impl Template {
    /// Read the saved state and the memory image.
    pub fn load(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((fs::read(&self.sav)?, fs::read(&self.mem)?))
    }
}

/// Boot the template VM once and patch the switcher's boot loop out of the
/// memory snapshot it leaves behind.
pub fn bootstrap<L: VmLauncher + ?Sized>(
    dir: &VmDir,
    launcher: &L,
    timeout: Duration,
) -> Result<Template> {
    log::info!("Bootstrapping template VM in {}", dir.root().display());
    launcher.run(dir.root(), "bootstrap", timeout)?;

    let mut snapshots = dir.memory_snapshots()?;
    let mem = match snapshots.len() {
        0 => {
            return Err(EmuTestError::MissingSnapshot {
                dir: dir.root().to_path_buf(),
                reason: "there's no memory snapshot".to_string(),
            })
        }
        1 => snapshots.remove(0),
        n => {
            return Err(EmuTestError::MissingSnapshot {
                dir: dir.root().to_path_buf(),
                reason: format!("{} memory snapshots instead of one", n),
            })
        }
    };
    if !dir.sav().is_file() {
        return Err(EmuTestError::MissingSnapshot {
            dir: dir.root().to_path_buf(),
            reason: format!("{} is missing", SAVE_FILE),
        });
    }

    let mem_name = mem
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .ok_or_else(|| EmuTestError::Config(format!("unusable snapshot name {}", mem.display())))?;

    let mut image = fs::read(&mem)?;
    patch_bootstrap(&mut image)?;
    fs::write(&mem, &image)?;
    log::debug!("Template snapshot {} ({} bytes) patched", mem_name, image.len());

    Ok(Template {
        sav: dir.sav(),
        mem,
        mem_name,
    })
}

/// One snapshot executed under both backends in a worker's VM directory.
pub struct DualRun<'a, L: VmLauncher + ?Sized> {
    pub dir: &'a VmDir,
    pub launcher: &'a L,
    pub timeout: Duration,
    pub mem_name: &'a str,
}

impl<'a, L: VmLauncher + ?Sized> DualRun<'a, L> {
    /// Run hardware first, then emulation. Afterwards `test/` holds both
    /// memory images and logs.
    pub fn execute(&self, mem: &mut [u8], sav: &[u8]) -> Result<()> {
        for mode in ExecMode::ORDER {
            self.run_mode(mem, sav, mode)?;
        }
        Ok(())
    }

    fn run_mode(&self, mem: &mut [u8], sav: &[u8], mode: ExecMode) -> Result<()> {
        set_exec_mode(mem, mode)?;
        fs::write(self.dir.sav(), sav)?;
        // the memory file is rewritten in place, never truncated
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.mem(self.mem_name))?;
        file.write_all(mem)?;
        drop(file);

        self.launcher.run(self.dir.root(), mode.stem(), self.timeout)?;

        fs::rename(self.dir.mem(self.mem_name), self.dir.test_mem(mode))?;
        fs::rename(self.dir.log(), self.dir.test_log(mode))?;
        log::trace!("{} run finished in {}", mode, self.dir.root().display());
        Ok(())
    }
}
