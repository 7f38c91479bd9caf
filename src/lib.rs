//! Core types, error taxonomy and module wiring for the `emutest` harness.
//!
//! `emutest` generates x86 instruction test cases from a declarative encoding
//! grammar, packs them into VM memory snapshots, runs every snapshot twice
//! (hardware-assisted and software-emulated) and byte-compares the results.
//! Any difference is an emulator bug candidate and is archived for offline
//! triage.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use emutest::{
//!     expander,
//!     tables::TestModule,
//!     snapshot::{inject_burst, SnapshotLayout},
//! };
//!
//! let module = TestModule::from_name("gp").unwrap();
//! let descriptors = module.descriptors();
//!
//! // Exact size of the test space, computed without expanding it
//! let total = expander::total_count(&descriptors);
//! println!("{} test cases", total);
//!
//! // Pack the first burst into a blank snapshot
//! let layout = SnapshotLayout::for_burst(16);
//! let burst: Vec<_> = expander::expand(&descriptors).take(layout.subtests).collect();
//! let mut mem = vec![0u8; layout.memory_bytes()];
//! let mut rng = rand::thread_rng();
//! inject_burst(&mut mem, &layout, &burst, &mut rng).unwrap();
//! ```

pub mod config;
pub mod grammar;
pub mod state;
pub mod context;
pub mod expander;
pub mod tables;
pub mod snapshot;
pub mod runner;
pub mod oracle;
pub mod worker;
pub mod pool;
pub mod decoder;
pub mod report;

use std::fmt;
use std::path::PathBuf;

/// Operand or instruction width in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    /// Width in bits
    pub fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    /// Width in bytes
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// Execution mode selected through the snapshot's mode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExecMode {
    /// Hardware-assisted virtualization
    Hardware = 0,
    /// Software instruction emulation
    Emulation = 1,
}

impl ExecMode {
    /// Both modes in the order a burst runs them
    pub const ORDER: [ExecMode; 2] = [ExecMode::Hardware, ExecMode::Emulation];

    /// Artifact stem used for snapshots and logs of this mode
    pub fn stem(self) -> &'static str {
        match self {
            ExecMode::Hardware => "hvt",
            ExecMode::Emulation => "emu",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Hardware => write!(f, "hardware"),
            ExecMode::Emulation => write!(f, "emulation"),
        }
    }
}

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum EmuTestError {
    /// A register location name that the context map doesn't know
    #[error("Invalid field: {0}")]
    UnknownLocation(String),

    /// An integer state value that doesn't fit its destination field
    #[error("Value {value:#x} does not fit the {width}-byte field {field}")]
    ValueTooWide {
        field: String,
        width: usize,
        value: u64,
    },

    /// A write or read that falls outside the snapshot or slot bounds
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// Test module name rejected before lookup
    #[error("Invalid test module: \"{0}\"")]
    InvalidTestModule(String),

    /// Instruction bytes that cannot be flattened into a code slot
    #[error("Invalid instruction encoding: {0}")]
    InvalidInstructionByte(String),

    /// Any other bad configuration (CLI combination, missing paths)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The VM process exited with a non-zero status
    #[error("The VM has exited unexpectedly ({mode}, code {code:?})")]
    VmExit { mode: String, code: Option<i32> },

    /// The VM process exceeded the watchdog timeout and was killed
    #[error("VM watchdog expired after {0} s")]
    Watchdog(u64),

    /// The bootstrap VM did not leave exactly one memory snapshot behind
    #[error("Memory snapshot problem in {dir}: {reason}")]
    MissingSnapshot { dir: PathBuf, reason: String },

    /// Disassembly failure
    #[error("Decoder error: {0}")]
    Decoder(String),

    /// Job or report (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV report output failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmuTestError {
    /// Errors that abort the process before any worker starts.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EmuTestError::UnknownLocation(_)
                | EmuTestError::ValueTooWide { .. }
                | EmuTestError::InvalidTestModule(_)
                | EmuTestError::InvalidInstructionByte(_)
                | EmuTestError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EmuTestError>;
