//! Context map: named CPU, FPU and debug-register fields of a subtest's
//! context slot, with their byte offsets and widths.
//!
//! The in-guest test switcher loads the whole slot before jumping to the code
//! slot and stores it back afterwards, so this layout is shared with the
//! bootstrap image.
//!
//! | offset  | contents                                      |
//! |---------|-----------------------------------------------|
//! | `0x000` | rax..r15 in encoding order, rip, rflags       |
//! | `0x090` | dr0..dr3, dr6, dr7, xcr0                      |
//! | `0x100` | FXSAVE image (x87 control, st/mm, xmm)        |
//! | `0x300` | XSAVE header (xstatebv, xcompbv)              |
//! | `0x340` | ymmh0..ymmh15                                 |

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::state::StateValue;
use crate::{EmuTestError, Result};

/// Size of a context slot in bytes
pub const CONTEXT_SIZE: usize = 0x800;

const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

const FXSAVE: usize = 0x100;
const XSAVE_HEADER: usize = 0x300;
const YMMH: usize = 0x340;

/// Byte range of one named field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub offset: usize,
    pub width: usize,
}

impl Field {
    fn new(name: impl Into<String>, offset: usize, width: usize) -> Self {
        Self {
            name: name.into(),
            offset,
            width,
        }
    }

    /// Fail if `value` doesn't fit this field.
    pub fn check_int(&self, label: &str, value: u64) -> Result<()> {
        if self.width < 8 && value >> (self.width * 8) != 0 {
            return Err(EmuTestError::ValueTooWide {
                field: label.to_ascii_lowercase(),
                width: self.width,
                value,
            });
        }
        Ok(())
    }

    /// Write `value` into a context slot.
    ///
    /// Integers are packed little-endian and zero-extended to the field
    /// width. Byte strings start at the field and may continue into the
    /// fields after it.
    pub fn write(&self, slot: &mut [u8], value: &StateValue) -> Result<()> {
        match value {
            StateValue::Int(v) => {
                self.check_int(&self.name, *v)?;
                let dst = self.span(slot.len(), self.width)?;
                let bytes = v.to_le_bytes();
                let n = self.width.min(bytes.len());
                slot[dst.clone()][..n].copy_from_slice(&bytes[..n]);
                slot[dst][n..].fill(0);
            }
            StateValue::Bytes(b) => {
                let dst = self.span(slot.len(), b.len())?;
                slot[dst].copy_from_slice(b);
            }
        }
        Ok(())
    }

    /// Read the field back as an integer (fields up to 8 bytes).
    pub fn read_int(&self, slot: &[u8]) -> Result<u64> {
        if self.width > 8 {
            return Err(EmuTestError::OutOfBounds(format!(
                "{} is {} bytes wide, read it as bytes",
                self.name, self.width
            )));
        }
        let src = self.span(slot.len(), self.width)?;
        let mut buf = [0u8; 8];
        buf[..self.width].copy_from_slice(&slot[src]);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read `len` bytes starting at the field.
    pub fn read_bytes<'a>(&self, slot: &'a [u8], len: usize) -> Result<&'a [u8]> {
        let src = self.span(slot.len(), len)?;
        Ok(&slot[src])
    }

    fn span(&self, slot_len: usize, len: usize) -> Result<std::ops::Range<usize>> {
        let end = self.offset + len;
        if end > slot_len {
            return Err(EmuTestError::OutOfBounds(format!(
                "{} bytes at {} (offset {:#x}) overrun the {:#x}-byte context slot",
                len, self.name, self.offset, slot_len
            )));
        }
        Ok(self.offset..end)
    }
}

/// Static table of every named context field.
#[derive(Debug)]
pub struct ContextMap {
    fields: HashMap<String, Field>,
    by_offset: Vec<Field>,
}

impl ContextMap {
    /// The process-wide map.
    pub fn get() -> &'static ContextMap {
        static MAP: OnceLock<ContextMap> = OnceLock::new();
        MAP.get_or_init(ContextMap::build)
    }

    fn build() -> Self {
        let mut list = Vec::new();

        for (i, name) in GPR_NAMES.iter().enumerate() {
            list.push(Field::new(*name, i * 8, 8));
        }
        list.push(Field::new("rip", 0x80, 8));
        list.push(Field::new("rflags", 0x88, 8));
        for i in 0..4 {
            list.push(Field::new(format!("dr{i}"), 0x90 + i * 8, 8));
        }
        list.push(Field::new("dr6", 0xb0, 8));
        list.push(Field::new("dr7", 0xb8, 8));
        list.push(Field::new("xcr0", 0xc0, 8));

        list.push(Field::new("fcw", FXSAVE, 2));
        list.push(Field::new("fsw", FXSAVE + 2, 2));
        list.push(Field::new("ftw", FXSAVE + 4, 1));
        list.push(Field::new("fop", FXSAVE + 6, 2));
        list.push(Field::new("fip", FXSAVE + 8, 8));
        list.push(Field::new("fdp", FXSAVE + 16, 8));
        list.push(Field::new("mxcsr", FXSAVE + 24, 4));
        list.push(Field::new("mxcsr_mask", FXSAVE + 28, 4));
        for i in 0..8 {
            list.push(Field::new(format!("st{i}"), FXSAVE + 32 + i * 16, 10));
            list.push(Field::new(format!("mm{i}"), FXSAVE + 32 + i * 16, 8));
        }
        for i in 0..16 {
            list.push(Field::new(format!("xmm{i}"), FXSAVE + 160 + i * 16, 16));
        }

        list.push(Field::new("xstatebv", XSAVE_HEADER, 8));
        list.push(Field::new("xcompbv", XSAVE_HEADER + 8, 8));
        for i in 0..16 {
            list.push(Field::new(format!("ymmh{i}"), YMMH + i * 16, 16));
        }

        let mut by_offset = list.clone();
        by_offset.sort_by_key(|f| (f.offset, f.width));
        let fields = list.into_iter().map(|f| (f.name.clone(), f)).collect();

        Self { fields, by_offset }
    }

    /// Resolve a field by name (case-insensitive).
    pub fn lookup(&self, name: &str) -> Result<&Field> {
        self.fields
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| EmuTestError::UnknownLocation(name.to_ascii_lowercase()))
    }

    /// Narrowest field covering a slot offset.
    pub fn field_at(&self, offset: usize) -> Option<&Field> {
        self.by_offset
            .iter()
            .filter(|f| f.offset <= offset && offset < f.offset + f.width)
            .min_by_key(|f| f.width)
    }

    /// Number of named fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
