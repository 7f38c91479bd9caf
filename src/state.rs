//! State descriptors: which machine-state locations a test varies, and over
//! which value domains.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::ContextMap;
use crate::{EmuTestError, Result};

/// DR7 bit 10 reads as one.
pub const DR7_RESERVED_ONE: u64 = 1 << 10;
/// Number of address breakpoints DR7 can enable.
pub const DR7_MAX_BREAKPOINTS: u8 = 4;

/// Where a state value is written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    /// A named field of the register context (case-insensitive)
    Register(Cow<'static, str>),
    /// A byte offset within the subtest's private data slot
    Data(u32),
}

impl Location {
    pub const fn reg(name: &'static str) -> Self {
        Location::Register(Cow::Borrowed(name))
    }

    pub const fn data(offset: u32) -> Self {
        Location::Data(offset)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Register(name) => write!(f, "{}", name.to_ascii_lowercase()),
            Location::Data(offset) => write!(f, "data+{:#x}", offset),
        }
    }
}

/// A concrete state value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateValue {
    /// Packed little-endian in the destination field's width
    Int(u64),
    /// Copied verbatim starting at the destination
    Bytes(Vec<u8>),
}

impl From<u64> for StateValue {
    fn from(v: u64) -> Self {
        StateValue::Int(v)
    }
}

impl From<Vec<u8>> for StateValue {
    fn from(v: Vec<u8>) -> Self {
        StateValue::Bytes(v)
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Int(v) => write!(f, "{:#x}", v),
            StateValue::Bytes(b) => {
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// Candidate values of one state location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    /// An explicit list
    Values(Vec<StateValue>),
    /// `count` integers starting at `start`, `step` apart (wrapping)
    Range { start: u64, step: u64, count: u64 },
    /// Every canonical DR7 value enabling a subset of the first
    /// `breakpoints` breakpoints through their local-enable bits
    Dr7Enables { breakpoints: u8 },
}

impl Domain {
    /// The concrete domain, in generation order.
    pub fn values(&self) -> Vec<StateValue> {
        match self {
            Domain::Values(values) => values.clone(),
            Domain::Range { start, step, count } => (0..*count)
                .map(|i| StateValue::Int(start.wrapping_add(step.wrapping_mul(i))))
                .collect(),
            Domain::Dr7Enables { breakpoints } => {
                let n = (*breakpoints).min(DR7_MAX_BREAKPOINTS) as u32;
                (0u64..(1 << n))
                    .map(|mask| {
                        let enables = (0..n)
                            .filter(|bp| mask & (1 << bp) != 0)
                            .fold(0u64, |acc, bp| acc | (1 << (2 * bp)));
                        StateValue::Int(DR7_RESERVED_ONE | enables)
                    })
                    .collect()
            }
        }
    }

    /// Domain size, computed without building it.
    pub fn len(&self) -> usize {
        match self {
            Domain::Values(values) => values.len(),
            Domain::Range { count, .. } => *count as usize,
            Domain::Dr7Enables { breakpoints } => 1 << (*breakpoints).min(DR7_MAX_BREAKPOINTS),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A location paired with its value domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDescriptor {
    pub location: Location,
    pub domain: Domain,
}

impl StateDescriptor {
    pub fn new(location: Location, domain: Domain) -> Self {
        Self { location, domain }
    }

    /// Register field with an explicit integer list
    pub fn reg(name: &'static str, values: &[u64]) -> Self {
        Self::new(
            Location::reg(name),
            Domain::Values(values.iter().copied().map(StateValue::Int).collect()),
        )
    }

    /// Data-slot offset with an explicit integer list (qword writes)
    pub fn data(offset: u32, values: &[u64]) -> Self {
        Self::new(
            Location::data(offset),
            Domain::Values(values.iter().copied().map(StateValue::Int).collect()),
        )
    }

    /// Check the location against the context map and every candidate
    /// value against the destination width.
    pub fn validate(&self) -> Result<()> {
        if let Location::Register(name) = &self.location {
            let field = ContextMap::get().lookup(name)?;
            for value in self.domain.values() {
                if let StateValue::Int(v) = value {
                    field.check_int(name, v)?;
                }
            }
        }
        if let Domain::Dr7Enables { breakpoints } = self.domain {
            if breakpoints > DR7_MAX_BREAKPOINTS {
                return Err(EmuTestError::Config(format!(
                    "DR7 has only {} breakpoints, {} requested",
                    DR7_MAX_BREAKPOINTS, breakpoints
                )));
            }
        }
        Ok(())
    }
}

/// One concrete value per varied location, in descriptor order.
pub type StateAssignment = Vec<(Location, StateValue)>;
