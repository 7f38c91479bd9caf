//! General-purpose integer instruction table.

use crate::grammar::{Fragment, InstructionDescriptor, OperandKind::*};
use crate::state::StateDescriptor;
use crate::Width::{self, *};

use super::{memory_state, modrm, modrm_ext, op, prefixes, stack_state};

/// Operand sizes reachable with 0x66 / none / REX.W
const WIDE: [Width; 3] = [W16, W32, W64];

/// `/digit` extensions of the shift and rotate groups (6 is an alias of 4)
const SHIFTS: [(&str, u8); 7] = [
    ("ROL", 0),
    ("ROR", 1),
    ("RCL", 2),
    ("RCR", 3),
    ("SHL", 4),
    ("SHR", 5),
    ("SAR", 7),
];

const ALU: [&str; 8] = ["ADD", "OR", "ADC", "SBB", "AND", "SUB", "XOR", "CMP"];

fn features(width: Width) -> &'static [&'static str] {
    match width {
        W8 => &["8086"],
        W16 => &["8086", "OSO"],
        W32 => &["386"],
        W64 => &["X64", "REX.W"],
    }
}

/// Immediate size for a full-width immediate operand (imm32 sign-extends in 64-bit)
fn imm_size(width: Width) -> u8 {
    match width {
        W8 => 1,
        W16 => 2,
        W32 | W64 => 4,
    }
}

fn imm_width(width: Width) -> Width {
    match width {
        W64 => W32,
        other => other,
    }
}

fn insn(
    mnemonic: &'static str,
    operands: Vec<crate::grammar::Operand>,
    fragments: Vec<Fragment>,
    width: Width,
    state: Vec<StateDescriptor>,
) -> InstructionDescriptor {
    InstructionDescriptor::new(mnemonic, operands, fragments, features(width), width, state)
}

/// 64-bit by default in long mode, no REX.W needed
fn default64(mut desc: InstructionDescriptor) -> InstructionDescriptor {
    desc.features = &["X64"];
    desc
}

/// The eight classic ALU operations in every encoding.
fn alu() -> Vec<InstructionDescriptor> {
    let mut out = Vec::new();
    for (i, &name) in ALU.iter().enumerate() {
        let base = (i as u8) * 8;
        let ext = i as u8;

        out.push(insn(name, vec![op(Rm, W8), op(Reg, W8)], vec![prefixes(W8), Fragment::Byte(base), modrm()], W8, memory_state(W8)));
        for w in WIDE {
            out.push(insn(name, vec![op(Rm, w), op(Reg, w)], vec![prefixes(w), Fragment::Byte(base + 1), modrm()], w, memory_state(w)));
        }
        out.push(insn(name, vec![op(Reg, W8), op(Rm, W8)], vec![prefixes(W8), Fragment::Byte(base + 2), modrm()], W8, memory_state(W8)));
        for w in WIDE {
            out.push(insn(name, vec![op(Reg, w), op(Rm, w)], vec![prefixes(w), Fragment::Byte(base + 3), modrm()], w, memory_state(w)));
        }

        // accumulator forms
        out.push(insn(name, vec![op(Imm, W8)], vec![prefixes(W8), Fragment::Byte(base + 4), Fragment::Imm(1)], W8, stack_state()));
        for w in WIDE {
            out.push(insn(name, vec![op(Imm, imm_width(w))], vec![prefixes(w), Fragment::Byte(base + 5), Fragment::Imm(imm_size(w))], w, stack_state()));
        }

        // group 1: 0x80 /i ib, 0x81 /i iz, 0x83 /i ib
        out.push(insn(name, vec![op(Rm, W8), op(Imm, W8)], vec![prefixes(W8), Fragment::Byte(0x80), modrm_ext(ext), Fragment::Imm(1)], W8, memory_state(W8)));
        for w in WIDE {
            out.push(insn(name, vec![op(Rm, w), op(Imm, imm_width(w))], vec![prefixes(w), Fragment::Byte(0x81), modrm_ext(ext), Fragment::Imm(imm_size(w))], w, memory_state(w)));
            out.push(insn(name, vec![op(Rm, w), op(Imm, W8)], vec![prefixes(w), Fragment::Byte(0x83), modrm_ext(ext), Fragment::Imm(1)], w, memory_state(w)));
        }
    }
    out
}

/// Groups 3, 4 and 5: TEST imm, NOT, NEG, MUL, IMUL, DIV, IDIV, INC, DEC.
fn unary() -> Vec<InstructionDescriptor> {
    let mut out = Vec::new();

    out.push(insn("TEST", vec![op(Rm, W8), op(Imm, W8)], vec![prefixes(W8), Fragment::Byte(0xf6), modrm_ext(0), Fragment::Imm(1)], W8, memory_state(W8)));
    for w in WIDE {
        out.push(insn("TEST", vec![op(Rm, w), op(Imm, imm_width(w))], vec![prefixes(w), Fragment::Byte(0xf7), modrm_ext(0), Fragment::Imm(imm_size(w))], w, memory_state(w)));
    }

    for (name, ext) in [("NOT", 2), ("NEG", 3), ("MUL", 4), ("IMUL", 5), ("DIV", 6), ("IDIV", 7)] {
        out.push(insn(name, vec![op(Rm, W8)], vec![prefixes(W8), Fragment::Byte(0xf6), modrm_ext(ext)], W8, memory_state(W8)));
        for w in WIDE {
            out.push(insn(name, vec![op(Rm, w)], vec![prefixes(w), Fragment::Byte(0xf7), modrm_ext(ext)], w, memory_state(w)));
        }
    }

    for (name, ext) in [("INC", 0), ("DEC", 1)] {
        out.push(insn(name, vec![op(Rm, W8)], vec![prefixes(W8), Fragment::Byte(0xfe), modrm_ext(ext)], W8, memory_state(W8)));
        for w in WIDE {
            out.push(insn(name, vec![op(Rm, w)], vec![prefixes(w), Fragment::Byte(0xff), modrm_ext(ext)], w, memory_state(w)));
        }
    }
    out
}

/// Shift and rotate group 2: by one, by CL and by imm8.
fn shifts() -> Vec<InstructionDescriptor> {
    let mut out = Vec::new();
    for (name, ext) in SHIFTS {
        for (narrow, wide, count) in [(0xd0u8, 0xd1u8, None), (0xd2, 0xd3, None), (0xc0, 0xc1, Some(1u8))] {
            let frags = |opcode: u8, w: Width| {
                let mut f = vec![prefixes(w), Fragment::Byte(opcode), modrm_ext(ext)];
                f.extend(count.map(Fragment::Imm));
                f
            };
            let operands = |w: Width| {
                let mut ops = vec![op(Rm, w)];
                if count.is_some() {
                    ops.push(op(Imm, W8));
                }
                ops
            };
            out.push(insn(name, operands(W8), frags(narrow, W8), W8, memory_state(W8)));
            for w in WIDE {
                out.push(insn(name, operands(w), frags(wide, w), w, memory_state(w)));
            }
        }
    }

    for (name, imm_op, cl_op) in [("SHLD", 0xa4u8, 0xa5u8), ("SHRD", 0xac, 0xad)] {
        for w in WIDE {
            out.push(insn(name, vec![op(Rm, w), op(Reg, w), op(Imm, W8)], vec![prefixes(w), Fragment::Byte(0x0f), Fragment::Byte(imm_op), modrm(), Fragment::Imm(1)], w, memory_state(w)));
            out.push(insn(name, vec![op(Rm, w), op(Reg, w)], vec![prefixes(w), Fragment::Byte(0x0f), Fragment::Byte(cl_op), modrm()], w, memory_state(w)));
        }
    }
    out
}

/// Stack operations. In 64-bit mode PUSH/POP default to 64 bits.
fn stack() -> Vec<InstructionDescriptor> {
    let mut out = Vec::new();
    for (name, opcode) in [("PUSH", 0x50u8), ("POP", 0x58)] {
        out.push(insn(name, vec![op(Reg, W16)], vec![prefixes(W16), Fragment::BytePlusReg(opcode)], W16, stack_state()));
        out.push(default64(insn(name, vec![op(Reg, W64)], vec![prefixes(W32), Fragment::BytePlusReg(opcode)], W64, stack_state())));
    }
    out.push(insn("PUSH", vec![op(Imm, W16)], vec![prefixes(W16), Fragment::Byte(0x68), Fragment::Imm(2)], W16, stack_state()));
    out.push(insn("PUSH", vec![op(Imm, W32)], vec![prefixes(W32), Fragment::Byte(0x68), Fragment::Imm(4)], W32, stack_state()));
    out.push(insn("PUSH", vec![op(Imm, W8)], vec![prefixes(W8), Fragment::Byte(0x6a), Fragment::Imm(1)], W8, stack_state()));
    out.push(insn("POP", vec![op(Rm, W16)], vec![prefixes(W16), Fragment::Byte(0x8f), modrm_ext(0)], W16, memory_state(W16)));
    out.push(default64(insn("POP", vec![op(Rm, W64)], vec![prefixes(W32), Fragment::Byte(0x8f), modrm_ext(0)], W64, memory_state(W64))));
    out.push(default64(insn("PUSH", vec![op(Rm, W64)], vec![prefixes(W32), Fragment::Byte(0xff), modrm_ext(6)], W64, memory_state(W64))));

    for (name, opcode, w) in [("PUSHFW", 0x9cu8, W16), ("PUSHFQ", 0x9c, W32), ("POPFW", 0x9d, W16), ("POPFQ", 0x9d, W32)] {
        out.push(insn(name, vec![], vec![prefixes(w), Fragment::Byte(opcode)], w, stack_state()));
    }
    out
}

/// MOV, XCHG, TEST, LEA and the zero/sign-extending moves.
fn moves() -> Vec<InstructionDescriptor> {
    let mut out = Vec::new();

    for (name, narrow, wide, operands) in [
        ("MOV", 0x88u8, 0x89u8, [Rm, Reg]),
        ("MOV", 0x8a, 0x8b, [Reg, Rm]),
        ("TEST", 0x84, 0x85, [Rm, Reg]),
        ("XCHG", 0x86, 0x87, [Reg, Rm]),
    ] {
        out.push(insn(name, vec![op(operands[0], W8), op(operands[1], W8)], vec![prefixes(W8), Fragment::Byte(narrow), modrm()], W8, memory_state(W8)));
        for w in WIDE {
            out.push(insn(name, vec![op(operands[0], w), op(operands[1], w)], vec![prefixes(w), Fragment::Byte(wide), modrm()], w, memory_state(w)));
        }
    }

    out.push(insn("MOV", vec![op(Reg, W8), op(Imm, W8)], vec![prefixes(W8), Fragment::BytePlusReg(0xb0), Fragment::Imm(1)], W8, stack_state()));
    for w in WIDE {
        // B8+r is the only form with a full 64-bit immediate
        let size = if w == W64 { 8 } else { imm_size(w) };
        out.push(insn("MOV", vec![op(Reg, w), op(Imm, w)], vec![prefixes(w), Fragment::BytePlusReg(0xb8), Fragment::Imm(size)], w, stack_state()));
    }

    out.push(insn("MOV", vec![op(Rm, W8), op(Imm, W8)], vec![prefixes(W8), Fragment::Byte(0xc6), modrm_ext(0), Fragment::Imm(1)], W8, memory_state(W8)));
    for w in WIDE {
        out.push(insn("MOV", vec![op(Rm, w), op(Imm, imm_width(w))], vec![prefixes(w), Fragment::Byte(0xc7), modrm_ext(0), Fragment::Imm(imm_size(w))], w, memory_state(w)));
        out.push(insn("XCHG", vec![op(Reg, w)], vec![prefixes(w), Fragment::BytePlusReg(0x90)], w, stack_state()));
        out.push(insn("LEA", vec![op(Reg, w), op(Mem, w)], vec![prefixes(w), Fragment::Byte(0x8d), modrm()], w, memory_state(w)));
    }

    for (name, narrow, wide) in [("MOVZX", 0xb6u8, 0xb7u8), ("MOVSX", 0xbe, 0xbf)] {
        for w in WIDE {
            out.push(insn(name, vec![op(Reg, w), op(Rm, W8)], vec![prefixes(w), Fragment::Byte(0x0f), Fragment::Byte(narrow), modrm()], w, memory_state(W8)));
            if w != W16 {
                out.push(insn(name, vec![op(Reg, w), op(Rm, W16)], vec![prefixes(w), Fragment::Byte(0x0f), Fragment::Byte(wide), modrm()], w, memory_state(W16)));
            }
        }
    }
    out
}

/// Condition-code driven forms: Jcc, CMOVcc, SETcc.
fn conditional() -> Vec<InstructionDescriptor> {
    let mut out = vec![
        insn("Jcc", vec![op(Imm, W8)], vec![prefixes(W8), Fragment::BytePlusCond(0x70), Fragment::Imm(1)], W8, stack_state()),
        insn("Jcc", vec![op(Imm, W32)], vec![prefixes(W32), Fragment::Byte(0x0f), Fragment::BytePlusCond(0x80), Fragment::Imm(4)], W32, stack_state()),
        insn("SETcc", vec![op(Rm, W8)], vec![prefixes(W8), Fragment::Byte(0x0f), Fragment::BytePlusCond(0x90), modrm_ext(0)], W8, memory_state(W8)),
    ];
    for w in WIDE {
        let mut cmov = insn("CMOVcc", vec![op(Reg, w), op(Rm, w)], vec![prefixes(w), Fragment::Byte(0x0f), Fragment::BytePlusCond(0x40), modrm()], w, memory_state(w));
        if w != W64 {
            cmov.features = &["P6"];
        }
        out.push(cmov);
    }
    out
}

/// Remaining two-byte opcodes: bit scans, IMUL r,rm, XADD, BSWAP.
fn two_byte() -> Vec<InstructionDescriptor> {
    let mut out = Vec::new();
    for (name, opcode) in [("BSF", 0xbcu8), ("BSR", 0xbd), ("IMUL", 0xaf)] {
        for w in WIDE {
            out.push(insn(name, vec![op(Reg, w), op(Rm, w)], vec![prefixes(w), Fragment::Byte(0x0f), Fragment::Byte(opcode), modrm()], w, memory_state(w)));
        }
    }
    for w in WIDE {
        out.push(insn("IMUL", vec![op(Reg, w), op(Rm, w), op(Imm, imm_width(w))], vec![prefixes(w), Fragment::Byte(0x69), modrm(), Fragment::Imm(imm_size(w))], w, memory_state(w)));
        out.push(insn("IMUL", vec![op(Reg, w), op(Rm, w), op(Imm, W8)], vec![prefixes(w), Fragment::Byte(0x6b), modrm(), Fragment::Imm(1)], w, memory_state(w)));
    }

    out.push(insn("XADD", vec![op(Rm, W8), op(Reg, W8)], vec![prefixes(W8), Fragment::Byte(0x0f), Fragment::Byte(0xc0), modrm()], W8, memory_state(W8)));
    for w in WIDE {
        out.push(insn("XADD", vec![op(Rm, w), op(Reg, w)], vec![prefixes(w), Fragment::Byte(0x0f), Fragment::Byte(0xc1), modrm()], w, memory_state(w)));
    }

    let mut bswap32 = insn("BSWAP", vec![op(Reg, W32)], vec![prefixes(W32), Fragment::Byte(0x0f), Fragment::BytePlusReg(0xc8)], W32, stack_state());
    bswap32.features = &["486"];
    out.push(bswap32);
    out.push(insn("BSWAP", vec![op(Reg, W64)], vec![prefixes(W64), Fragment::Byte(0x0f), Fragment::BytePlusReg(0xc8)], W64, stack_state()));
    out
}

/// Operand-less instructions with implicit registers or flags.
fn implicit() -> Vec<InstructionDescriptor> {
    let mut out = vec![insn("NOP", vec![], vec![prefixes(W8), Fragment::Byte(0x90)], W8, stack_state())];
    for (names, opcode) in [(["CBW", "CWDE", "CDQE"], 0x98u8), (["CWD", "CDQ", "CQO"], 0x99)] {
        for (name, w) in names.into_iter().zip(WIDE) {
            out.push(insn(name, vec![], vec![prefixes(w), Fragment::Byte(opcode)], w, stack_state()));
        }
    }
    for (name, opcode) in [("SAHF", 0x9eu8), ("LAHF", 0x9f), ("CMC", 0xf5), ("CLC", 0xf8), ("STC", 0xf9), ("CLD", 0xfc), ("STD", 0xfd)] {
        out.push(insn(name, vec![], vec![prefixes(W8), Fragment::Byte(opcode)], W8, stack_state()));
    }
    out
}

/// The full table, in declaration order.
pub fn descriptors() -> Vec<InstructionDescriptor> {
    let mut out = Vec::new();
    out.extend(alu());
    out.extend(unary());
    out.extend(shifts());
    out.extend(stack());
    out.extend(moves());
    out.extend(conditional());
    out.extend(two_byte());
    out.extend(implicit());
    out
}
