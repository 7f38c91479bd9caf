//! Memory-accessing instructions under data breakpoints.
//!
//! DR0-DR3 watch qwords inside the data page and just below the stack top.
//! DR7 enables every subset of the four breakpoints, all armed for
//! 8-byte read/write accesses.

use crate::grammar::{Fragment, InstructionDescriptor, OperandKind::*};
use crate::state::{Domain, Location, StateDescriptor, StateValue, DR7_MAX_BREAKPOINTS};
use crate::Width::{self, *};

use super::{modrm, modrm_ext, op, prefixes, DATA_BASE, DATA_END, STACK_TOP};

/// R/W = 11 and LEN = 11 for all four breakpoints
const DR7_RW_LEN_QWORD: u64 = 0xffff_0000;

const FEATURES: &[&str] = &["386", "DBG"];

fn dr7_domain() -> Domain {
    let values = Domain::Dr7Enables {
        breakpoints: DR7_MAX_BREAKPOINTS,
    }
    .values()
    .into_iter()
    .map(|v| match v {
        StateValue::Int(enables) => StateValue::Int(enables | DR7_RW_LEN_QWORD),
        other => other,
    })
    .collect();
    Domain::Values(values)
}

fn breakpoint_state(width: Width) -> Vec<StateDescriptor> {
    let sign = 1u64 << (width.bits() - 1);
    vec![
        StateDescriptor::reg("RBX", &[DATA_BASE, DATA_BASE + 8]),
        StateDescriptor::data(0, &[0, sign]),
        StateDescriptor::reg("DR0", &[DATA_BASE]),
        StateDescriptor::reg("DR1", &[DATA_BASE + 8]),
        StateDescriptor::reg("DR2", &[(DATA_END + 1) - 8]),
        StateDescriptor::reg("DR3", &[STACK_TOP - 8]),
        StateDescriptor::new(Location::reg("DR7"), dr7_domain()),
        StateDescriptor::reg("RSP", &[STACK_TOP]),
    ]
}

fn form(
    mnemonic: &'static str,
    operands: Vec<crate::grammar::Operand>,
    fragments: Vec<Fragment>,
    width: Width,
) -> InstructionDescriptor {
    InstructionDescriptor::new(mnemonic, operands, fragments, FEATURES, width, breakpoint_state(width))
}

pub fn descriptors() -> Vec<InstructionDescriptor> {
    let mut out = Vec::new();

    for w in [W8, W16, W32, W64] {
        let (store, load) = if w == W8 { (0x88, 0x8a) } else { (0x89, 0x8b) };
        out.push(form("MOV", vec![op(Rm, w), op(Reg, w)], vec![prefixes(w), Fragment::Byte(store), modrm()], w));
        out.push(form("MOV", vec![op(Reg, w), op(Rm, w)], vec![prefixes(w), Fragment::Byte(load), modrm()], w));

        // read-modify-write
        let add = if w == W8 { 0x00 } else { 0x01 };
        out.push(form("ADD", vec![op(Rm, w), op(Reg, w)], vec![prefixes(w), Fragment::Byte(add), modrm()], w));
    }

    out.push(form("PUSH", vec![op(Rm, W64)], vec![prefixes(W32), Fragment::Byte(0xff), modrm_ext(6)], W64));
    out.push(form("POP", vec![op(Rm, W64)], vec![prefixes(W32), Fragment::Byte(0x8f), modrm_ext(0)], W64));
    out
}
