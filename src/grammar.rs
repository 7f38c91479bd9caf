//! Declarative x86 instruction-encoding grammar.
//!
//! An [`InstructionDescriptor`] lists its encoding as an ordered sequence of
//! [`Fragment`]s. Every fragment emits one axis of choices; the expander takes
//! the Cartesian product of all axes, in declaration order, to obtain the
//! concrete byte sequences of the instruction form.

use std::fmt;

use crate::state::StateDescriptor;
use crate::{EmuTestError, Result, Width};

/// Operand-size override prefix
pub const OPERAND_SIZE_PREFIX: u8 = 0x66;
/// REX prefix with only the W bit set
pub const REX_W: u8 = 0x48;
/// Optional legacy prefixes tried on top of the mandatory ones
pub const DEFAULT_OPTIONAL_PREFIXES: &[u8] = &[0x67];

/// ModRM `mod` field selecting `[rm]` memory addressing without displacement
pub const MOD_MEMORY: u8 = 0b00;
/// ModRM `mod` field selecting a register operand
pub const MOD_REGISTER: u8 = 0b11;
/// ModRM `rm` field used by every generated form (RBX, the data pointer)
pub const RM_RBX: u8 = 3;

/// Storage class of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// General-purpose register (ModRM.reg or opcode-embedded)
    Reg,
    /// Register or memory (ModRM.rm)
    Rm,
    /// Memory only
    Mem,
    /// Absolute memory offset (moffs)
    MemOffs,
    /// Immediate
    Imm,
    /// Segment register
    SegReg,
}

impl fmt::Display for OperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperandKind::Reg => write!(f, "reg"),
            OperandKind::Rm => write!(f, "rm"),
            OperandKind::Mem => write!(f, "mem"),
            OperandKind::MemOffs => write!(f, "moffs"),
            OperandKind::Imm => write!(f, "imm"),
            OperandKind::SegReg => write!(f, "sreg"),
        }
    }
}

/// One operand of an instruction form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub kind: OperandKind,
    pub width: Width,
}

impl Operand {
    pub const fn new(kind: OperandKind, width: Width) -> Self {
        Self { kind, width }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.width)
    }
}

/// Prefix-combination generator.
///
/// The first choice never carries an optional prefix, so the un-prefixed
/// encoding is always reachable. Mandatory prefixes follow the optional one
/// in architectural order: legacy, 0x66, REX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixSet {
    pub operand_size: bool,
    pub rex_w: bool,
    pub optional: &'static [u8],
}

impl PrefixSet {
    pub const fn plain() -> Self {
        Self {
            operand_size: false,
            rex_w: false,
            optional: DEFAULT_OPTIONAL_PREFIXES,
        }
    }

    pub const fn operand_size() -> Self {
        Self {
            operand_size: true,
            ..Self::plain()
        }
    }

    pub const fn rex_w() -> Self {
        Self {
            rex_w: true,
            ..Self::plain()
        }
    }

    /// Replace the optional legacy prefixes
    pub const fn with_optional(self, optional: &'static [u8]) -> Self {
        Self { optional, ..self }
    }

    fn choices(&self) -> Vec<Vec<u8>> {
        std::iter::once(None)
            .chain(self.optional.iter().copied().map(Some))
            .map(|legacy| {
                let mut bytes = Vec::with_capacity(3);
                bytes.extend(legacy);
                if self.operand_size {
                    bytes.push(OPERAND_SIZE_PREFIX);
                }
                if self.rex_w {
                    bytes.push(REX_W);
                }
                bytes
            })
            .collect()
    }
}

/// ModRM-byte generator.
///
/// `mod` varies over memory and register forms, `rm` is pinned to RBX.
/// With `reg` fixed (an opcode extension) the axis has two entries,
/// otherwise `reg` varies over all eight registers as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModRm {
    pub reg: Option<u8>,
}

impl ModRm {
    pub const fn any() -> Self {
        Self { reg: None }
    }

    pub const fn ext(reg: u8) -> Self {
        Self { reg: Some(reg) }
    }

    fn choices(&self) -> Vec<Vec<u8>> {
        let regs: Vec<u8> = match self.reg {
            Some(reg) => vec![reg],
            None => (0..8).collect(),
        };
        [MOD_MEMORY, MOD_REGISTER]
            .iter()
            .flat_map(|&md| regs.iter().map(move |&reg| vec![(md << 6) | (reg << 3) | RM_RBX]))
            .collect()
    }

    fn len(&self) -> usize {
        if self.reg.is_some() {
            2
        } else {
            16
        }
    }
}

/// Boundary values tried for an immediate of `size` bytes
pub fn imm_values(size: u8) -> &'static [u64] {
    match size {
        1 => &[0x00, 0x01, 0x7f, 0x80, 0xff],
        2 => &[0x0000, 0x0001, 0x7fff, 0x8000, 0xffff],
        4 => &[0x0000_0000, 0x0000_0001, 0x7fff_ffff, 0x8000_0000, 0xffff_ffff],
        8 => &[
            0x0000_0000_0000_0000,
            0x0000_0000_0000_0001,
            0x7fff_ffff_ffff_ffff,
            0x8000_0000_0000_0000,
            0xffff_ffff_ffff_ffff,
        ],
        _ => &[],
    }
}

/// One axis of an instruction encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment {
    /// A fixed byte
    Byte(u8),
    /// Opcode with a register number in the low three bits
    BytePlusReg(u8),
    /// Opcode with a condition code in the low four bits
    BytePlusCond(u8),
    /// Prefix combinations
    Prefixes(PrefixSet),
    /// ModRM byte
    ModRm(ModRm),
    /// Little-endian immediate of the given size in bytes
    Imm(u8),
}

impl Fragment {
    /// The concrete choices of this axis, in generation order.
    pub fn emit(&self) -> Vec<Vec<u8>> {
        match self {
            Fragment::Byte(b) => vec![vec![*b]],
            // the low bits of a validated base are clear
            Fragment::BytePlusReg(base) => (0..8).map(|r| vec![base | r]).collect(),
            Fragment::BytePlusCond(base) => (0..16).map(|cc| vec![base | cc]).collect(),
            Fragment::Prefixes(set) => set.choices(),
            Fragment::ModRm(modrm) => modrm.choices(),
            Fragment::Imm(size) => imm_values(*size)
                .iter()
                .map(|v| v.to_le_bytes()[..*size as usize].to_vec())
                .collect(),
        }
    }

    /// Number of choices on this axis, without building them.
    pub fn axis_len(&self) -> usize {
        match self {
            Fragment::Byte(_) => 1,
            Fragment::BytePlusReg(_) => 8,
            Fragment::BytePlusCond(_) => 16,
            Fragment::Prefixes(set) => 1 + set.optional.len(),
            Fragment::ModRm(modrm) => modrm.len(),
            Fragment::Imm(size) => imm_values(*size).len(),
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            Fragment::BytePlusReg(base) if base & 0x07 != 0 => Err(
                EmuTestError::InvalidInstructionByte(format!("register opcode base {base:#x} has low bits set")),
            ),
            Fragment::BytePlusCond(base) if base & 0x0f != 0 => Err(
                EmuTestError::InvalidInstructionByte(format!("condition opcode base {base:#x} has low bits set")),
            ),
            Fragment::ModRm(ModRm { reg: Some(reg) }) if reg > 7 => Err(
                EmuTestError::InvalidInstructionByte(format!("ModRM extension {reg} out of range")),
            ),
            Fragment::Imm(size) if imm_values(size).is_empty() => Err(
                EmuTestError::InvalidInstructionByte(format!("immediate size {size} unsupported")),
            ),
            _ => Ok(()),
        }
    }
}

/// Immutable definition of one instruction form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionDescriptor {
    pub mnemonic: &'static str,
    pub operands: Vec<Operand>,
    pub fragments: Vec<Fragment>,
    /// CPU feature tags, informational only
    pub features: &'static [&'static str],
    pub width: Width,
    pub state: Vec<StateDescriptor>,
}

impl InstructionDescriptor {
    pub fn new(
        mnemonic: &'static str,
        operands: Vec<Operand>,
        fragments: Vec<Fragment>,
        features: &'static [&'static str],
        width: Width,
        state: Vec<StateDescriptor>,
    ) -> Self {
        Self {
            mnemonic,
            operands,
            fragments,
            features,
            width,
            state,
        }
    }

    /// Reject malformed fragments and state locations before generation.
    pub fn validate(&self) -> Result<()> {
        for fragment in &self.fragments {
            fragment.validate()?;
        }
        for state in &self.state {
            state.validate()?;
        }
        Ok(())
    }
}

impl fmt::Display for InstructionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)?;
        for (i, op) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{op}")?;
        }
        write!(f, " ({}-bit)", self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_prefix_axis_starts_unprefixed() {
        let choices = Fragment::Prefixes(PrefixSet::plain()).emit();
        assert_eq!(choices, vec![vec![], vec![0x67]]);
    }

    #[test]
    fn test_prefix_axis_orders_mandatory_after_optional() {
        let choices = Fragment::Prefixes(PrefixSet::operand_size()).emit();
        assert_eq!(choices, vec![vec![0x66], vec![0x67, 0x66]]);

        let choices = Fragment::Prefixes(PrefixSet::rex_w().with_optional(&[0x2e, 0x67])).emit();
        assert_eq!(choices, vec![vec![0x48], vec![0x2e, 0x48], vec![0x67, 0x48]]);
    }

    #[test]
    fn test_modrm_with_extension() {
        let choices = Fragment::ModRm(ModRm::ext(4)).emit();
        // mod=00 reg=4 rm=3, then mod=11 reg=4 rm=3
        assert_eq!(choices, vec![vec![0x23], vec![0xe3]]);
    }

    #[test]
    fn test_modrm_any_register() {
        let choices = Fragment::ModRm(ModRm::any()).emit();
        assert_eq!(choices.len(), 16);
        assert_eq!(choices[0], vec![0x03]);
        assert_eq!(choices[7], vec![0x3b]);
        assert_eq!(choices[8], vec![0xc3]);
    }

    #[test]
    fn test_imm_little_endian() {
        let choices = Fragment::Imm(2).emit();
        assert_eq!(choices[2], vec![0xff, 0x7f]);
        assert!(choices.iter().all(|c| c.len() == 2));
    }

    #[rstest]
    #[case(Fragment::Byte(0x90), 1)]
    #[case(Fragment::BytePlusReg(0x50), 8)]
    #[case(Fragment::BytePlusCond(0x70), 16)]
    #[case(Fragment::Prefixes(PrefixSet::plain()), 2)]
    #[case(Fragment::Prefixes(PrefixSet::rex_w().with_optional(&[])), 1)]
    #[case(Fragment::ModRm(ModRm::any()), 16)]
    #[case(Fragment::ModRm(ModRm::ext(0)), 2)]
    #[case(Fragment::Imm(4), 5)]
    fn test_axis_len_matches_emit(#[case] fragment: Fragment, #[case] expected: usize) {
        assert_eq!(fragment.axis_len(), expected);
        assert_eq!(fragment.emit().len(), expected);
    }

    #[test]
    fn test_unvalidated_base_does_not_overflow() {
        assert_eq!(Fragment::BytePlusReg(0xff).emit(), vec![vec![0xff]; 8]);
        assert_eq!(Fragment::BytePlusCond(0xf1).emit().last(), Some(&vec![0xff]));
    }

    #[rstest]
    #[case(Fragment::BytePlusReg(0x51))]
    #[case(Fragment::BytePlusCond(0x41))]
    #[case(Fragment::ModRm(ModRm::ext(8)))]
    #[case(Fragment::Imm(3))]
    fn test_invalid_fragments_rejected(#[case] fragment: Fragment) {
        let desc = InstructionDescriptor::new("BAD", vec![], vec![fragment], &[], Width::W8, vec![]);
        assert!(matches!(desc.validate(), Err(EmuTestError::InvalidInstructionByte(_))));
    }

    #[test]
    fn test_descriptor_display() {
        let desc = InstructionDescriptor::new(
            "ADD",
            vec![
                Operand::new(OperandKind::Rm, Width::W32),
                Operand::new(OperandKind::Reg, Width::W32),
            ],
            vec![Fragment::Byte(0x01)],
            &["386"],
            Width::W32,
            vec![],
        );
        assert_eq!(desc.to_string(), "ADD rm32, reg32 (32-bit)");
    }
}
