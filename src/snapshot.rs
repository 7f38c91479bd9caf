//! State injector: writes a burst of test cases into a raw guest-memory
//! snapshot.
//!
//! Guest physical layout around the test area:
//!
//! | address                         | contents                          |
//! |---------------------------------|-----------------------------------|
//! | `TEST_SWITCHER`                 | in-guest test switcher (boot loop)|
//! | `TEST_SWITCHER + 0x2000`        | `u32` index of the last subtest   |
//! | `TEST_SWITCHER + 0x2020`        | `u32` execution mode              |
//! | `TEST_START + 0x4000 * i`       | subtest `i`: scratch page         |
//! | `... + 0x1000`                  | data slot                         |
//! | `... + 0x2000`                  | code slot (0xCC filled)           |
//! | `... + 0x3000`                  | context slot                      |

use std::ops::Range;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::context::{ContextMap, CONTEXT_SIZE};
use crate::expander::TestCase;
use crate::state::{Location, StateValue};
use crate::{EmuTestError, ExecMode, Result};

pub const PAGE_SIZE: usize = 0x1000;
const MIB: usize = 1024 * 1024;

/// Guest physical address of the test switcher
pub const TEST_SWITCHER: usize = MIB;
/// Guest physical address of the first subtest slot
pub const TEST_START: usize = MIB + 16 * PAGE_SIZE;
/// Largest burst a VM is sized for (16 GiB of guest memory)
pub const MAX_BURST: usize = 1 << 20;
/// Subtest-count control word, relative to the switcher
pub const SUBTEST_COUNT_OFFSET: usize = 0x2000;
/// Execution-mode word, relative to the switcher
pub const EXEC_MODE_OFFSET: usize = 0x2020;
/// Distance between two subtests
pub const SLOT_STRIDE: usize = 4 * PAGE_SIZE;
/// Trap byte filling the unused part of a code slot
pub const CODE_FILL: u8 = 0xcc;
/// Replaces the switcher's initial `jmp $`
pub const BOOT_LOOP_PATCH: [u8; 2] = [0x90, 0x90];

const DEFAULT_GPRS: u64 = 14;
const FPU_REGISTER_BYTES: usize = 10;
const FPU_REGISTER_STRIDE: usize = 16;

/// Memory sizing of a worker VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLayout {
    /// Guest memory in MiB
    pub memory_mib: usize,
    /// Number of subtest slots that fit in guest memory
    pub subtests: usize,
}

impl SnapshotLayout {
    /// Size guest memory for roughly `burst_size` subtests. Sizes above
    /// [`MAX_BURST`] are treated as [`MAX_BURST`].
    pub fn for_burst(burst_size: usize) -> Self {
        let memory_mib = (burst_size.min(MAX_BURST) * SLOT_STRIDE + 2 * MIB) / MIB;
        let subtests = ((memory_mib - 1) * MIB / SLOT_STRIDE).saturating_sub(4);
        Self {
            memory_mib,
            subtests,
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_mib * MIB
    }

    fn slot_base(subtest: usize) -> usize {
        TEST_START + SLOT_STRIDE * subtest
    }

    pub fn data_slot(subtest: usize) -> Range<usize> {
        let start = Self::slot_base(subtest) + PAGE_SIZE;
        start..start + PAGE_SIZE
    }

    pub fn code_slot(subtest: usize) -> Range<usize> {
        let start = Self::slot_base(subtest) + 2 * PAGE_SIZE;
        start..start + PAGE_SIZE
    }

    pub fn context_slot(subtest: usize) -> Range<usize> {
        let start = Self::slot_base(subtest) + 3 * PAGE_SIZE;
        start..start + CONTEXT_SIZE
    }
}

fn region<'a>(mem: &'a mut [u8], range: Range<usize>, what: &str) -> Result<&'a mut [u8]> {
    let len = mem.len();
    mem.get_mut(range.clone()).ok_or_else(|| {
        EmuTestError::OutOfBounds(format!(
            "{} at {:#x}..{:#x} is past the end of a {:#x}-byte snapshot",
            what, range.start, range.end, len
        ))
    })
}

fn write_u32(mem: &mut [u8], offset: usize, value: u32, what: &str) -> Result<()> {
    region(mem, offset..offset + 4, what)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn random_bytes<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf[..]);
    buf
}

/// Default register context applied before any override.
fn write_defaults<R: Rng + ?Sized>(slot: &mut [u8], rng: &mut R) -> Result<()> {
    let map = ContextMap::get();

    let gprs: Vec<u8> = (1..=DEFAULT_GPRS)
        .flat_map(|i| (0xdead << 48 | i << 32 | 0xdead << 16 | i).to_le_bytes())
        .collect();
    map.lookup("rax")?.write(slot, &StateValue::Bytes(gprs))?;

    for (name, value) in [
        ("fcw", 0x037f),
        ("fsw", 0x0000),
        ("mxcsr", 0x1f80),
        ("mxcsr_mask", 0xffff),
        ("xstatebv", 0x0007),
    ] {
        map.lookup(name)?.write(slot, &StateValue::Int(value))?;
    }

    map.lookup("xmm0")?
        .write(slot, &StateValue::Bytes(random_bytes(rng, 16 * 16)))?;
    map.lookup("ymmh0")?
        .write(slot, &StateValue::Bytes(random_bytes(rng, 16 * 16)))?;

    let mut fpu = Vec::with_capacity(8 * FPU_REGISTER_STRIDE);
    for _ in 0..8 {
        fpu.extend(random_bytes(rng, FPU_REGISTER_BYTES));
        fpu.resize(fpu.len() + FPU_REGISTER_STRIDE - FPU_REGISTER_BYTES, 0);
    }
    map.lookup("mm0")?.write(slot, &StateValue::Bytes(fpu))?;

    map.lookup("xcr0")?.write(slot, &StateValue::Int(7))?;
    Ok(())
}

fn write_data(slot: &mut [u8], offset: u32, value: &StateValue) -> Result<()> {
    let bytes = match value {
        StateValue::Int(v) => v.to_le_bytes().to_vec(),
        StateValue::Bytes(b) => b.clone(),
    };
    let start = offset as usize;
    let dst = slot.get_mut(start..start + bytes.len()).ok_or_else(|| {
        EmuTestError::OutOfBounds(format!(
            "{} bytes at data+{:#x} overrun the data slot",
            bytes.len(),
            offset
        ))
    })?;
    dst.copy_from_slice(&bytes);
    Ok(())
}

fn inject_subtest<R: Rng + ?Sized>(
    mem: &mut [u8],
    subtest: usize,
    test: &TestCase,
    rng: &mut R,
) -> Result<()> {
    let map = ContextMap::get();

    let context = region(mem, SnapshotLayout::context_slot(subtest), "context slot")?;
    context.fill(0);
    write_defaults(context, rng)?;

    for (location, value) in &test.state {
        match location {
            Location::Register(name) => {
                let context = region(mem, SnapshotLayout::context_slot(subtest), "context slot")?;
                map.lookup(name)?.write(context, value)?;
            }
            Location::Data(offset) => {
                let data = region(mem, SnapshotLayout::data_slot(subtest), "data slot")?;
                write_data(data, *offset, value)?;
            }
        }
    }

    if test.insn.len() > PAGE_SIZE {
        return Err(EmuTestError::InvalidInstructionByte(format!(
            "{} instruction bytes don't fit a code slot",
            test.insn.len()
        )));
    }
    let code = region(mem, SnapshotLayout::code_slot(subtest), "code slot")?;
    code.fill(CODE_FILL);
    code[..test.insn.len()].copy_from_slice(&test.insn);
    Ok(())
}

/// Write a burst into a snapshot and set the subtest count.
///
/// Subtest `i` of the burst goes to slot `i`. The control word receives the
/// index of the last subtest.
pub fn inject_burst<R: Rng + ?Sized>(
    mem: &mut [u8],
    layout: &SnapshotLayout,
    tests: &[TestCase],
    rng: &mut R,
) -> Result<()> {
    if tests.is_empty() {
        return Err(EmuTestError::Config("cannot inject an empty burst".to_string()));
    }
    if tests.len() > layout.subtests {
        return Err(EmuTestError::OutOfBounds(format!(
            "burst of {} exceeds the {} subtest slots of a {} MiB VM",
            tests.len(),
            layout.subtests,
            layout.memory_mib
        )));
    }

    for (i, test) in tests.iter().enumerate() {
        inject_subtest(mem, i, test, rng)?;
    }

    let last = (tests.len() - 1) as u32;
    write_u32(mem, TEST_SWITCHER + SUBTEST_COUNT_OFFSET, last, "subtest count")?;
    log::trace!("Injected {} subtests", tests.len());
    Ok(())
}

/// Select the backend the switcher reports to the hypervisor.
pub fn set_exec_mode(mem: &mut [u8], mode: ExecMode) -> Result<()> {
    write_u32(mem, TEST_SWITCHER + EXEC_MODE_OFFSET, mode as u32, "execution mode")
}

/// Remove the infinite loop the switcher starts with.
pub fn patch_bootstrap(mem: &mut [u8]) -> Result<()> {
    let at = TEST_SWITCHER..TEST_SWITCHER + BOOT_LOOP_PATCH.len();
    region(mem, at, "test switcher")?.copy_from_slice(&BOOT_LOOP_PATCH);
    Ok(())
}

/// Number of subtests recorded in the control word.
pub fn subtest_count(mem: &[u8]) -> Result<usize> {
    let at = TEST_SWITCHER + SUBTEST_COUNT_OFFSET;
    let word = mem
        .get(at..at + 4)
        .ok_or_else(|| EmuTestError::OutOfBounds(format!("no control word in a {:#x}-byte snapshot", mem.len())))?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(word);
    Ok(u32::from_le_bytes(buf) as usize + 1)
}

/// Read a location of one subtest back from a snapshot.
///
/// Context fields up to 8 bytes and data offsets read as integers, wider
/// fields as their raw bytes.
pub fn read_back(mem: &[u8], subtest: usize, location: &Location) -> Result<StateValue> {
    let oob = |what: &str| {
        EmuTestError::OutOfBounds(format!("subtest {} {} is outside the snapshot", subtest, what))
    };
    match location {
        Location::Register(name) => {
            let slot = mem
                .get(SnapshotLayout::context_slot(subtest))
                .ok_or_else(|| oob("context slot"))?;
            let field = ContextMap::get().lookup(name)?;
            if field.width <= 8 {
                Ok(StateValue::Int(field.read_int(slot)?))
            } else {
                Ok(StateValue::Bytes(field.read_bytes(slot, field.width)?.to_vec()))
            }
        }
        Location::Data(offset) => {
            let start = SnapshotLayout::data_slot(subtest).start + *offset as usize;
            let bytes = mem.get(start..start + 8).ok_or_else(|| oob("data word"))?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            Ok(StateValue::Int(u64::from_le_bytes(buf)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    fn case(insn: &[u8], state: Vec<(Location, StateValue)>) -> TestCase {
        TestCase {
            descriptor: 0,
            insn: insn.to_vec(),
            state,
        }
    }

    fn small() -> (SnapshotLayout, Vec<u8>, StdRng) {
        let layout = SnapshotLayout::for_burst(16);
        let mem = vec![0u8; layout.memory_bytes()];
        (layout, mem, StdRng::seed_from_u64(0))
    }

    #[rstest]
    #[case(1000, 17, 1020)]
    #[case(16, 2, 60)]
    #[case(0, 2, 60)]
    fn test_layout_for_burst(#[case] burst: usize, #[case] mib: usize, #[case] subtests: usize) {
        let layout = SnapshotLayout::for_burst(burst);
        assert_eq!(layout.memory_mib, mib);
        assert_eq!(layout.subtests, subtests);
        // the last slot ends exactly at the top of guest memory
        assert_eq!(
            SnapshotLayout::context_slot(subtests - 1).start + PAGE_SIZE,
            layout.memory_bytes()
        );
    }

    #[test]
    fn test_layout_caps_huge_bursts() {
        let layout = SnapshotLayout::for_burst(usize::MAX);
        assert_eq!(layout, SnapshotLayout::for_burst(MAX_BURST));
        assert_eq!(layout.memory_mib, 16386);
    }

    #[test]
    fn test_slot_addresses() {
        assert_eq!(SnapshotLayout::data_slot(0).start, 0x111000);
        assert_eq!(SnapshotLayout::code_slot(0).start, 0x112000);
        assert_eq!(SnapshotLayout::context_slot(1).start, 0x117000);
    }

    #[test]
    fn test_overrides_round_trip() {
        let (layout, mut mem, mut rng) = small();
        let state = vec![
            (Location::reg("RBX"), StateValue::Int(0x3ffc)),
            (Location::reg("FCW"), StateValue::Int(0x027f)),
            (Location::data(0), StateValue::Int(0x8000_0000_0000_0001)),
            (Location::reg("xmm3"), StateValue::Bytes(vec![0x5a; 16])),
        ];
        inject_burst(&mut mem, &layout, &[case(&[0x01, 0x03], state.clone())], &mut rng).unwrap();

        for (location, value) in &state {
            assert_eq!(&read_back(&mem, 0, location).unwrap(), value, "{location}");
        }
    }

    #[test]
    fn test_defaults_applied() {
        let (layout, mut mem, mut rng) = small();
        inject_burst(&mut mem, &layout, &[case(&[0x90], vec![])], &mut rng).unwrap();

        assert_eq!(read_back(&mem, 0, &Location::reg("rax")).unwrap(), StateValue::Int(0xdead_0001_dead_0001));
        assert_eq!(read_back(&mem, 0, &Location::reg("r13")).unwrap(), StateValue::Int(0xdead_000e_dead_000e));
        assert_eq!(read_back(&mem, 0, &Location::reg("r14")).unwrap(), StateValue::Int(0));
        assert_eq!(read_back(&mem, 0, &Location::reg("mxcsr")).unwrap(), StateValue::Int(0x1f80));
        assert_eq!(read_back(&mem, 0, &Location::reg("xcr0")).unwrap(), StateValue::Int(7));

        let st0 = SnapshotLayout::context_slot(0).start + 0x120;
        assert!(mem[st0 + 10..st0 + 16].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_code_slot_filled_with_traps() {
        let (layout, mut mem, mut rng) = small();
        inject_burst(&mut mem, &layout, &[case(&[0x48, 0x01, 0xc3], vec![])], &mut rng).unwrap();
        let code = &mem[SnapshotLayout::code_slot(0)];
        assert_eq!(&code[..3], &[0x48, 0x01, 0xc3]);
        assert!(code[3..].iter().all(|&b| b == CODE_FILL));
    }

    #[test]
    fn test_subtests_do_not_alias() {
        let (layout, mut mem, mut rng) = small();
        let burst: Vec<TestCase> = (0..layout.subtests as u64)
            .map(|i| case(&[0x90], vec![(Location::reg("rbx"), StateValue::Int(i)), (Location::data(8), StateValue::Int(!i))]))
            .collect();
        inject_burst(&mut mem, &layout, &burst, &mut rng).unwrap();

        assert_eq!(subtest_count(&mem).unwrap(), layout.subtests);
        for i in 0..layout.subtests {
            assert_eq!(read_back(&mem, i, &Location::reg("rbx")).unwrap(), StateValue::Int(i as u64));
            assert_eq!(read_back(&mem, i, &Location::data(8)).unwrap(), StateValue::Int(!(i as u64)));
        }
    }

    #[test]
    fn test_burst_too_large() {
        let (layout, mut mem, mut rng) = small();
        let burst = vec![case(&[0x90], vec![]); layout.subtests + 1];
        let err = inject_burst(&mut mem, &layout, &burst, &mut rng).unwrap_err();
        assert!(matches!(err, EmuTestError::OutOfBounds(_)));
    }

    #[test]
    fn test_empty_burst_rejected() {
        let (layout, mut mem, mut rng) = small();
        let err = inject_burst(&mut mem, &layout, &[], &mut rng).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_short_snapshot_rejected() {
        let (layout, _, mut rng) = small();
        let mut mem = vec![0u8; TEST_START + PAGE_SIZE];
        let err = inject_burst(&mut mem, &layout, &[case(&[0x90], vec![])], &mut rng).unwrap_err();
        assert!(matches!(err, EmuTestError::OutOfBounds(_)));
    }

    #[test]
    fn test_unknown_and_too_wide_overrides() {
        let (layout, mut mem, mut rng) = small();
        let err = inject_burst(&mut mem, &layout, &[case(&[0x90], vec![(Location::reg("rzz"), StateValue::Int(0))])], &mut rng)
            .unwrap_err();
        assert!(matches!(err, EmuTestError::UnknownLocation(_)));

        let err = inject_burst(&mut mem, &layout, &[case(&[0x90], vec![(Location::reg("mxcsr"), StateValue::Int(1 << 32))])], &mut rng)
            .unwrap_err();
        assert!(matches!(err, EmuTestError::ValueTooWide { .. }));
    }

    #[test]
    fn test_mode_word_and_boot_patch() {
        let (_, mut mem, _) = small();
        mem[TEST_SWITCHER..TEST_SWITCHER + 2].copy_from_slice(&[0xeb, 0xfe]);
        patch_bootstrap(&mut mem).unwrap();
        assert_eq!(&mem[TEST_SWITCHER..TEST_SWITCHER + 2], &[0x90, 0x90]);

        set_exec_mode(&mut mem, ExecMode::Emulation).unwrap();
        let at = TEST_SWITCHER + EXEC_MODE_OFFSET;
        assert_eq!(&mem[at..at + 4], &[1, 0, 0, 0]);
        set_exec_mode(&mut mem, ExecMode::Hardware).unwrap();
        assert_eq!(&mem[at..at + 4], &[0, 0, 0, 0]);
    }
}
