//! Registry of statically linked instruction tables ("test modules").

use std::fmt;

use crate::grammar::{Fragment, InstructionDescriptor, ModRm, Operand, OperandKind, PrefixSet};
use crate::state::StateDescriptor;
use crate::{EmuTestError, Result, Width};

pub mod gp;
pub mod dbg;

/// Stack pointer every test starts with
pub const STACK_TOP: u64 = 0x2800;
/// Guest address of the subtest data slot, addressed through RBX
pub const DATA_BASE: u64 = 0x3000;
/// Last byte of the data page
pub const DATA_END: u64 = 0x3fff;

/// Available instruction tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestModule {
    /// General-purpose integer instructions
    Gp,
    /// Memory-accessing instructions under DR0-DR3 data breakpoints
    Dbg,
}

impl fmt::Display for TestModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TestModule {
    /// Every registered module
    pub fn all() -> &'static [TestModule] {
        &[TestModule::Gp, TestModule::Dbg]
    }

    pub fn name(&self) -> &'static str {
        match self {
            TestModule::Gp => "gp",
            TestModule::Dbg => "dbg",
        }
    }

    /// Resolve a module by name. Names must be alphanumeric.
    pub fn from_name(name: &str) -> Result<Self> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EmuTestError::InvalidTestModule(name.to_string()));
        }
        Self::all()
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                let known: Vec<_> = Self::all().iter().map(|m| m.name()).collect();
                EmuTestError::Config(format!(
                    "unknown test module \"{}\" (known: {})",
                    name,
                    known.join(", ")
                ))
            })
    }

    /// The module's descriptor list, in declaration order.
    pub fn descriptors(&self) -> Vec<InstructionDescriptor> {
        match self {
            TestModule::Gp => gp::descriptors(),
            TestModule::Dbg => dbg::descriptors(),
        }
    }

    /// Descriptor list after validating every descriptor.
    pub fn load(&self) -> Result<Vec<InstructionDescriptor>> {
        let descs = self.descriptors();
        for (i, desc) in descs.iter().enumerate() {
            desc.validate().map_err(|e| {
                log::error!("{} descriptor #{} ({}) is invalid: {}", self, i, desc, e);
                e
            })?;
        }
        log::debug!("Loaded {} descriptors from module {}", descs.len(), self);
        Ok(descs)
    }
}

// Shorthands shared by the tables.

pub(crate) fn op(kind: OperandKind, width: Width) -> Operand {
    Operand::new(kind, width)
}

/// Prefix axis matching the operand size of `width`
pub(crate) fn prefixes(width: Width) -> Fragment {
    match width {
        Width::W16 => Fragment::Prefixes(PrefixSet::operand_size()),
        Width::W64 => Fragment::Prefixes(PrefixSet::rex_w()),
        _ => Fragment::Prefixes(PrefixSet::plain()),
    }
}

pub(crate) fn modrm() -> Fragment {
    Fragment::ModRm(ModRm::any())
}

pub(crate) fn modrm_ext(reg: u8) -> Fragment {
    Fragment::ModRm(ModRm::ext(reg))
}

/// Stack-only state
pub(crate) fn stack_state() -> Vec<StateDescriptor> {
    vec![StateDescriptor::reg("RSP", &[STACK_TOP])]
}

/// Memory-operand state: RBX at the start of the data page and, for
/// multi-byte operands, straddling its end. The operand itself takes
/// boundary values around the sign bit.
pub(crate) fn memory_state(width: Width) -> Vec<StateDescriptor> {
    let sign = 1u64 << (width.bits() - 1);
    let rbx: &[u64] = match width {
        Width::W8 => &[DATA_BASE],
        Width::W16 => &[DATA_BASE, DATA_END],
        Width::W32 => &[DATA_BASE, DATA_END - 1],
        Width::W64 => &[DATA_BASE, DATA_END - 3],
    };
    vec![
        StateDescriptor::reg("RBX", rbx),
        StateDescriptor::data(0, &[0, 1, sign, sign | 1]),
        StateDescriptor::reg("RSP", &[STACK_TOP]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander;
    use crate::state::StateValue;

    #[test]
    fn test_module_lookup() {
        assert_eq!(TestModule::from_name("gp").unwrap(), TestModule::Gp);
        assert_eq!(TestModule::from_name("DBG").unwrap(), TestModule::Dbg);
    }

    #[test]
    fn test_non_alphanumeric_name_rejected() {
        for name in ["", "gp;rm", "../gp", "g p", "gp_2"] {
            let err = TestModule::from_name(name).unwrap_err();
            assert!(matches!(err, EmuTestError::InvalidTestModule(_)), "{name}");
            assert!(err.is_config_error());
        }
    }

    #[test]
    fn test_unknown_module_is_config_error() {
        let err = TestModule::from_name("sse42").unwrap_err();
        assert!(matches!(err, EmuTestError::Config(_)));
    }

    #[test]
    fn test_all_modules_validate() {
        for module in TestModule::all() {
            let descs = module.load().unwrap();
            assert!(!descs.is_empty(), "{module} is empty");
            assert!(expander::total_count(&descs) > 0);
        }
    }

    #[test]
    fn test_memory_state_rbx_bounds() {
        let state = memory_state(Width::W16);
        assert_eq!(state[0].domain.values()[1], StateValue::Int(0x3fff));

        let state = memory_state(Width::W64);
        assert_eq!(state[0].domain.values()[1], StateValue::Int(0x3ffc));
        assert_eq!(state[1].domain.values()[2], StateValue::Int(0x8000_0000_0000_0000));

        let state = memory_state(Width::W8);
        assert_eq!(state[0].domain.len(), 1);
        assert_eq!(state[1].domain.values()[3], StateValue::Int(0x81));
    }
}
