//! Capstone-based x86-64 decoder used to describe archived test code.

use std::cell::RefCell;
use std::fmt;

use capstone::arch::x86::ArchMode as X86Mode;
use capstone::prelude::BuildsCapstone;
use capstone::Capstone;
use serde::Serialize;

use crate::snapshot::CODE_FILL;
use crate::EmuTestError;

/// Guest address
pub type Address = u64;

/// Longest legal x86 instruction
pub const MAX_INSTRUCTION_SIZE: usize = 15;

/// Errors that can occur during decoding
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    /// Capstone error
    #[error("Capstone error: {0}")]
    CapstoneError(#[from] capstone::Error),

    /// Invalid offset
    #[error("Invalid offset: {0:#x} is outside the code slot")]
    InvalidOffset(Address),
}

impl From<DecoderError> for EmuTestError {
    fn from(e: DecoderError) -> Self {
        EmuTestError::Decoder(e.to_string())
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "add")
    pub mnemonic: String,
    /// Instruction operands as string representation
    pub operands: String,
    #[serde(skip)]
    bytes: [u8; MAX_INSTRUCTION_SIZE],
}

impl Insn {
    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Space separated hex encoding
    pub fn hex(&self) -> String {
        self.bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Decoder trait: turns code bytes into instructions.
pub trait Decoder: Send + Sync {
    /// Decode a single instruction at `at` offset.
    ///
    /// Returns `None` when the bytes at `at` don't form a valid instruction.
    fn decode(&self, code: &[u8], at: Address) -> Result<Option<Insn>, DecoderError>;

    /// Decode a code slot up to the first trap fill byte.
    ///
    /// Stops early at the first undecodable byte. A slot that starts with
    /// the fill byte decodes to nothing.
    fn decode_slot(&self, code: &[u8]) -> Result<Vec<Insn>, DecoderError> {
        let mut out = Vec::new();
        let mut at = 0usize;
        while at < code.len() && code[at] != CODE_FILL {
            match self.decode(code, at as Address)? {
                Some(insn) => {
                    at += insn.size as usize;
                    out.push(insn);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

thread_local! {
    // Capstone handles are not Send; keep one per thread
    static X86_64: RefCell<Option<Capstone>> = const { RefCell::new(None) };
}

/// Capstone x86-64 decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapstoneDecoder;

impl CapstoneDecoder {
    /// Build an x86 64-bit decoder
    pub fn build_x86_64() -> Result<Capstone, DecoderError> {
        Ok(Capstone::new()
            .x86()
            .mode(X86Mode::Mode64)
            .detail(false)
            .build()?)
    }

    fn with_capstone<T>(f: impl FnOnce(&Capstone) -> T) -> Result<T, DecoderError> {
        X86_64.with(|cell| {
            let mut slot = cell.borrow_mut();
            let cs = match slot.take() {
                Some(cs) => cs,
                None => Self::build_x86_64()?,
            };
            let out = f(&cs);
            *slot = Some(cs);
            Ok(out)
        })
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, code: &[u8], at: Address) -> Result<Option<Insn>, DecoderError> {
        let offset = at as usize;
        if offset >= code.len() {
            return Err(DecoderError::InvalidOffset(at));
        }
        let end = std::cmp::min(offset + MAX_INSTRUCTION_SIZE, code.len());
        let slice = &code[offset..end];

        Self::with_capstone(|cs| {
            let insns = cs.disasm_count(slice, at, 1).ok()?;
            let i = insns.iter().next()?;

            let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
            for (j, b) in i.bytes().iter().enumerate().take(MAX_INSTRUCTION_SIZE) {
                bytes[j] = *b;
            }

            Some(Insn {
                addr: i.address(),
                size: i.bytes().len() as u8,
                mnemonic: i.mnemonic().unwrap_or("").to_string(),
                operands: i.op_str().unwrap_or("").to_string(),
                bytes,
            })
        })
    }
}
