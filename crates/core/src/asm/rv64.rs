//! Assembler and compiler for RISC-V RV64IMC.
//!
//! Register plan:
//!
//! - `s0` — cell pointer (argument `a0`, returned in `a0`)
//! - `s1` — read callback (argument `a1`)
//! - `s2` — print callback (argument `a2`)
//! - `a4`/`a5` — scratch, chosen from the 3-bit register window so the
//!   compressed load/store forms apply
//! - `t6` — address materialization and far-branch trampolines
//!
//! Code is emitted into an ordered list of [Block]s instead of a flat
//! buffer. Branch targets are block indices, which keeps the relaxation
//! pass free of pointer chasing: sizes are iterated to a fixpoint, then the
//! blocks are concatenated.
//!
//! Requires the `M` extension only when a program carries a `mac` with a
//! multiplier other than ±1.

use tracing::warn;

use crate::cell::{Cell, CellWidth};
use crate::errors::JitError;
use crate::opcode::{Instruction, Op};

/// A RISC-V integer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

pub const ZERO: Reg = Reg(0);
pub const RA: Reg = Reg(1);
pub const SP: Reg = Reg(2);
pub const S0: Reg = Reg(8);
pub const S1: Reg = Reg(9);
pub const A0: Reg = Reg(10);
pub const A1: Reg = Reg(11);
pub const A2: Reg = Reg(12);
pub const A4: Reg = Reg(14);
pub const A5: Reg = Reg(15);
pub const S2: Reg = Reg(18);
pub const S3: Reg = Reg(19);
pub const T6: Reg = Reg(31);

impl Reg {
    fn num(self) -> u32 {
        self.0 as u32
    }

    /// Usable in the 3-bit register field of compressed instructions.
    fn is_3bit(self) -> bool {
        (8..=15).contains(&self.0)
    }

    fn num_3bit(self) -> u32 {
        debug_assert!(self.is_3bit());
        (self.0 - 8) as u32
    }
}

/// One element of the assembler's ordered block list.
#[derive(Debug)]
pub enum Block {
    /// Opaque, already-encoded bytes.
    Basic(Vec<u8>),
    /// Unconditional jump to the start of another block.
    Jump { target: usize },
    /// `bne rs1, rs2, target-block`.
    Bne { rs1: Reg, rs2: Reg, target: usize },
    /// `beq rs1, rs2, target-block`.
    Beq { rs1: Reg, rs2: Reg, target: usize },
}

/// Placeholder for a forward branch whose close bracket is still pending.
const UNRESOLVED: usize = usize::MAX;

pub struct Rv64Assembly {
    blocks: Vec<Block>,
    current: Vec<u8>,
    open_branches: Vec<usize>,
}

impl Rv64Assembly {
    pub fn new() -> Self {
        Rv64Assembly {
            blocks: Vec::new(),
            current: Vec::new(),
            open_branches: Vec::new(),
        }
    }

    // Block management ///////////////////////////////////////////////////

    fn seal_block(&mut self) {
        let bytes = std::mem::take(&mut self.current);
        self.blocks.push(Block::Basic(bytes));
    }

    /// Ends the current basic block with a forward `beq rs1, zero` whose
    /// target is filled in by the matching [Rv64Assembly::bne_back].
    pub fn beq_forward(&mut self, rs1: Reg) {
        self.seal_block();
        self.open_branches.push(self.blocks.len());
        self.blocks.push(Block::Beq {
            rs1,
            rs2: ZERO,
            target: UNRESOLVED,
        });
    }

    /// Ends the current basic block with `bne rs1, zero` back to the block
    /// after the pending forward branch, and resolves that branch to the
    /// block after this one.
    pub fn bne_back(&mut self, rs1: Reg) {
        self.seal_block();
        let open = self
            .open_branches
            .pop()
            .expect("bne_back without a pending beq_forward");

        self.blocks.push(Block::Bne {
            rs1,
            rs2: ZERO,
            target: open + 1,
        });

        let after = self.blocks.len();
        match &mut self.blocks[open] {
            Block::Beq { target, .. } => *target = after,
            other => panic!("pending forward branch is not a beq: {:?}", other),
        }
    }

    /// Ends the current basic block with an unconditional jump. Returns the
    /// jump's own block index; the block after it is `index + 1`.
    pub fn jump_to(&mut self, target: usize) -> usize {
        self.seal_block();
        let index = self.blocks.len();
        self.blocks.push(Block::Jump { target });
        index
    }

    // Emission ///////////////////////////////////////////////////////////

    fn emit16(&mut self, halfword: u16) {
        self.current.extend_from_slice(&halfword.to_le_bytes());
    }

    fn emit32(&mut self, word: u32) {
        self.current.extend_from_slice(&word.to_le_bytes());
    }

    // Arithmetic /////////////////////////////////////////////////////////

    /// `addi rd, rs1, imm`, choosing among `c.addi`, `c.li`, `c.mv` and
    /// `c.addi16sp` when their constraints hold.
    pub fn addi(&mut self, rd: Reg, rs1: Reg, imm: i32) {
        if rd == SP && rs1 == SP && imm != 0 && imm % 16 == 0 && fits_i(10, imm as i64) {
            self.emit16(encode_caddi16sp(imm));
        } else if rd == rs1 && rd != ZERO && imm != 0 && fits_i(6, imm as i64) {
            self.emit16(encode_ci(0b000, rd.num(), imm)); // c.addi
        } else if rs1 == ZERO && rd != ZERO && fits_i(6, imm as i64) {
            self.emit16(encode_ci(0b010, rd.num(), imm)); // c.li
        } else if imm == 0 && rd != ZERO && rs1 != ZERO {
            self.emit16(encode_cr(0b1000, rd.num(), rs1.num())); // c.mv
        } else {
            self.emit32(encode_i(imm, rs1, 0b000, rd, 0b0010011));
        }
    }

    /// `addiw rd, rs1, imm` (sign-extends the 32-bit result).
    pub fn addiw(&mut self, rd: Reg, rs1: Reg, imm: i32) {
        if rd == rs1 && rd != ZERO && fits_i(6, imm as i64) {
            self.emit16(encode_ci(0b001, rd.num(), imm)); // c.addiw
        } else {
            self.emit32(encode_i(imm, rs1, 0b000, rd, 0b0011011));
        }
    }

    pub fn mv(&mut self, rd: Reg, rs1: Reg) {
        self.addi(rd, rs1, 0);
    }

    /// Materializes an arbitrary 64-bit constant.
    pub fn li(&mut self, rd: Reg, value: i64) {
        if fits_i(12, value) {
            self.addi(rd, ZERO, value as i32);
        } else if fits_i(32, value) {
            let v = value as i32;
            let hi = v.wrapping_add(0x800) >> 12;
            let lo = v.wrapping_sub(hi << 12);
            self.lui(rd, hi);
            if lo != 0 {
                self.addiw(rd, rd, lo);
            }
        } else {
            // Build the upper bits first, then shift them into place.
            let lo12 = (value << 52) >> 52;
            let hi = (value - lo12) >> 12;
            self.li(rd, hi);
            self.slli(rd, rd, 12);
            if lo12 != 0 {
                self.addi(rd, rd, lo12 as i32);
            }
        }
    }

    pub fn lui(&mut self, rd: Reg, imm20: i32) {
        self.emit32(((imm20 as u32 & 0xFFFFF) << 12) | (rd.num() << 7) | 0b0110111);
    }

    pub fn slli(&mut self, rd: Reg, rs1: Reg, shamt: u32) {
        if rd == rs1 && rd != ZERO && shamt != 0 {
            self.emit16(
                (((shamt >> 5) & 1) << 12 | rd.num() << 7 | (shamt & 0x1F) << 2 | 0b10) as u16,
            ); // c.slli
        } else {
            self.emit32(encode_i(shamt as i32, rs1, 0b001, rd, 0b0010011));
        }
    }

    pub fn add(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        if rd == rs1 && rd != ZERO && rs2 != ZERO {
            self.emit16(encode_cr(0b1001, rd.num(), rs2.num())); // c.add
        } else {
            self.emit32(encode_r(0b0000000, rs2, rs1, 0b000, rd, 0b0110011));
        }
    }

    pub fn sub(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        if rd == rs1 && rd.is_3bit() && rs2.is_3bit() {
            // c.sub
            self.emit16(
                (0b100011 << 10 | rd.num_3bit() << 7 | 0b00 << 5 | rs2.num_3bit() << 2 | 0b01)
                    as u16,
            );
        } else {
            self.emit32(encode_r(0b0100000, rs2, rs1, 0b000, rd, 0b0110011));
        }
    }

    /// `mul rd, rs1, rs2` — the only instruction here from the M extension.
    pub fn mul(&mut self, rd: Reg, rs1: Reg, rs2: Reg) {
        self.emit32(encode_r(0b0000001, rs2, rs1, 0b000, rd, 0b0110011));
    }

    pub fn andi(&mut self, rd: Reg, rs1: Reg, imm: i32) {
        if rd == rs1 && rd.is_3bit() && fits_i(6, imm as i64) {
            // c.andi
            self.emit16(
                (0b100 << 13
                    | ((imm as u32 >> 5) & 1) << 12
                    | 0b10 << 10
                    | rd.num_3bit() << 7
                    | (imm as u32 & 0x1F) << 2
                    | 0b01) as u16,
            );
        } else {
            self.emit32(encode_i(imm, rs1, 0b111, rd, 0b0010011));
        }
    }

    // Loads and stores ///////////////////////////////////////////////////

    /// Width-selected cell load. Narrow cells load zero-extended; `lw` and
    /// `ld` have compressed forms when the offset and registers allow.
    pub fn load_cell(&mut self, width: CellWidth, rd: Reg, rs1: Reg, off: i32) {
        match width {
            CellWidth::C8 => self.emit32(encode_i(off, rs1, 0b100, rd, 0b0000011)), // lbu
            CellWidth::C16 => self.emit32(encode_i(off, rs1, 0b101, rd, 0b0000011)), // lhu
            CellWidth::C32 => self.lw(rd, rs1, off),
            CellWidth::C64 => self.ld(rd, rs1, off),
        }
    }

    pub fn store_cell(&mut self, width: CellWidth, rs2: Reg, rs1: Reg, off: i32) {
        match width {
            CellWidth::C8 => self.emit32(encode_s(off, rs2, rs1, 0b000)), // sb
            CellWidth::C16 => self.emit32(encode_s(off, rs2, rs1, 0b001)), // sh
            CellWidth::C32 => self.sw(rs2, rs1, off),
            CellWidth::C64 => self.sd(rs2, rs1, off),
        }
    }

    /// `lbu` regardless of cell width (for the print callback's argument).
    pub fn lbu(&mut self, rd: Reg, rs1: Reg, off: i32) {
        self.emit32(encode_i(off, rs1, 0b100, rd, 0b0000011));
    }

    pub fn lw(&mut self, rd: Reg, rs1: Reg, off: i32) {
        if rd.is_3bit() && rs1.is_3bit() && off >= 0 && off <= 124 && off % 4 == 0 {
            let o = off as u32;
            self.emit16(
                (0b010 << 13
                    | ((o >> 3) & 7) << 10
                    | rs1.num_3bit() << 7
                    | ((o >> 2) & 1) << 6
                    | ((o >> 6) & 1) << 5
                    | rd.num_3bit() << 2) as u16,
            ); // c.lw
        } else {
            self.emit32(encode_i(off, rs1, 0b010, rd, 0b0000011));
        }
    }

    pub fn ld(&mut self, rd: Reg, rs1: Reg, off: i32) {
        if rs1 == SP && rd != ZERO && off >= 0 && off <= 504 && off % 8 == 0 {
            let o = off as u32;
            self.emit16(
                (0b011 << 13
                    | ((o >> 5) & 1) << 12
                    | rd.num() << 7
                    | ((o >> 3) & 3) << 5
                    | ((o >> 6) & 7) << 2
                    | 0b10) as u16,
            ); // c.ldsp
        } else if rd.is_3bit() && rs1.is_3bit() && off >= 0 && off <= 248 && off % 8 == 0 {
            let o = off as u32;
            self.emit16(
                (0b011 << 13
                    | ((o >> 3) & 7) << 10
                    | rs1.num_3bit() << 7
                    | ((o >> 6) & 3) << 5
                    | rd.num_3bit() << 2) as u16,
            ); // c.ld
        } else {
            self.emit32(encode_i(off, rs1, 0b011, rd, 0b0000011));
        }
    }

    pub fn sw(&mut self, rs2: Reg, rs1: Reg, off: i32) {
        if rs2.is_3bit() && rs1.is_3bit() && off >= 0 && off <= 124 && off % 4 == 0 {
            let o = off as u32;
            self.emit16(
                (0b110 << 13
                    | ((o >> 3) & 7) << 10
                    | rs1.num_3bit() << 7
                    | ((o >> 2) & 1) << 6
                    | ((o >> 6) & 1) << 5
                    | rs2.num_3bit() << 2) as u16,
            ); // c.sw
        } else {
            self.emit32(encode_s(off, rs2, rs1, 0b010));
        }
    }

    pub fn sd(&mut self, rs2: Reg, rs1: Reg, off: i32) {
        if rs1 == SP && off >= 0 && off <= 504 && off % 8 == 0 {
            let o = off as u32;
            self.emit16(
                (0b111 << 13 | ((o >> 3) & 7) << 10 | ((o >> 6) & 7) << 7 | rs2.num() << 2 | 0b10)
                    as u16,
            ); // c.sdsp
        } else if rs2.is_3bit() && rs1.is_3bit() && off >= 0 && off <= 248 && off % 8 == 0 {
            let o = off as u32;
            self.emit16(
                (0b111 << 13
                    | ((o >> 3) & 7) << 10
                    | rs1.num_3bit() << 7
                    | ((o >> 6) & 3) << 5
                    | rs2.num_3bit() << 2) as u16,
            ); // c.sd
        } else {
            self.emit32(encode_s(off, rs2, rs1, 0b011));
        }
    }

    // Calls and returns //////////////////////////////////////////////////

    /// `jalr rd, imm(rs1)`; `c.jalr`/`c.jr` when the short forms apply.
    pub fn jalr(&mut self, rd: Reg, rs1: Reg, imm: i32) {
        if imm == 0 && rs1 != ZERO && rd == RA {
            self.emit16(encode_cr(0b1001, rs1.num(), 0)); // c.jalr
        } else if imm == 0 && rs1 != ZERO && rd == ZERO {
            self.emit16(encode_cr(0b1000, rs1.num(), 0)); // c.jr
        } else {
            self.emit32(encode_i(imm, rs1, 0b000, rd, 0b1100111));
        }
    }

    pub fn ret(&mut self) {
        self.jalr(ZERO, RA, 0);
    }

    // Relaxation /////////////////////////////////////////////////////////

    /// Concatenates the block list into machine code.
    ///
    /// Branch sizes start at the 2-byte compressed forms and are re-derived
    /// from the running block offsets until nothing grows. A block never
    /// shrinks between iterations (that could oscillate); if a final
    /// encoding comes up short it is padded with `c.nop` and logged.
    pub fn assemble(mut self) -> Vec<u8> {
        self.seal_block();
        assert!(
            self.open_branches.is_empty(),
            "tried to assemble with {} unresolved forward branches!",
            self.open_branches.len()
        );

        let mut sizes: Vec<usize> = self
            .blocks
            .iter()
            .map(|b| match b {
                Block::Basic(bytes) => bytes.len(),
                _ => 2,
            })
            .collect();

        loop {
            let offsets = running_offsets(&sizes);
            let mut changed = false;

            for (i, block) in self.blocks.iter().enumerate() {
                let required = match block {
                    Block::Basic(_) => continue,
                    Block::Jump { target } => {
                        jump_size(block_disp(&offsets, i, *target))
                    }
                    Block::Bne { rs1, rs2, target } | Block::Beq { rs1, rs2, target } => {
                        branch_size(block_disp(&offsets, i, *target), *rs1, *rs2)
                    }
                };
                if required > sizes[i] {
                    sizes[i] = required;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        let offsets = running_offsets(&sizes);
        let mut code: Vec<u8> = Vec::with_capacity(*offsets.last().unwrap());

        for (i, block) in self.blocks.iter().enumerate() {
            let start = code.len();
            match block {
                Block::Basic(bytes) => code.extend_from_slice(bytes),
                Block::Jump { target } => {
                    emit_jump(&mut code, block_disp(&offsets, i, *target), sizes[i]);
                }
                Block::Bne { rs1, rs2, target } => {
                    emit_branch(
                        &mut code,
                        block_disp(&offsets, i, *target),
                        sizes[i],
                        *rs1,
                        *rs2,
                        true,
                    );
                }
                Block::Beq { rs1, rs2, target } => {
                    emit_branch(
                        &mut code,
                        block_disp(&offsets, i, *target),
                        sizes[i],
                        *rs1,
                        *rs2,
                        false,
                    );
                }
            }

            let emitted = code.len() - start;
            if emitted < sizes[i] {
                warn!(
                    block = i,
                    expected = sizes[i],
                    emitted,
                    "assembled block shrank; padding with nops"
                );
                for _ in 0..(sizes[i] - emitted) / 2 {
                    code.extend_from_slice(&C_NOP.to_le_bytes());
                }
            }
            debug_assert_eq!(code.len() - start, sizes[i]);
        }

        code
    }
}

const C_NOP: u16 = 0x0001;

fn running_offsets(sizes: &[usize]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(sizes.len() + 1);
    let mut at = 0;
    for &s in sizes {
        offsets.push(at);
        at += s;
    }
    offsets.push(at);
    offsets
}

fn block_disp(offsets: &[usize], from: usize, to: usize) -> i64 {
    offsets[to] as i64 - offsets[from] as i64
}

/// Smallest legal encoding of an unconditional jump.
fn jump_size(disp: i64) -> usize {
    if fits_i(12, disp) {
        2 // c.j
    } else if fits_i(21, disp) {
        4 // jal zero
    } else {
        8 // auipc + jalr
    }
}

/// Smallest legal encoding of a conditional branch.
fn branch_size(disp: i64, rs1: Reg, rs2: Reg) -> usize {
    if rs2 == ZERO && rs1.is_3bit() && fits_i(9, disp) {
        2 // c.beqz / c.bnez
    } else if fits_i(13, disp) {
        4 // beq / bne
    } else {
        12 // inverted branch over an auipc+jalr pair
    }
}

fn emit_jump(code: &mut Vec<u8>, disp: i64, size: usize) {
    match size {
        2 => code.extend_from_slice(&encode_cj(disp as i32).to_le_bytes()),
        4 => code.extend_from_slice(&encode_j(disp as i32, ZERO).to_le_bytes()),
        _ => emit_far_jump(code, disp),
    }
}

fn emit_branch(code: &mut Vec<u8>, disp: i64, size: usize, rs1: Reg, rs2: Reg, not_equal: bool) {
    match size {
        2 => {
            let funct3 = if not_equal { 0b111 } else { 0b110 };
            code.extend_from_slice(&encode_cb(funct3, rs1.num_3bit(), disp as i32).to_le_bytes());
        }
        4 => {
            let funct3 = if not_equal { 0b001 } else { 0b000 };
            code.extend_from_slice(&encode_b(disp as i32, rs2, rs1, funct3).to_le_bytes());
        }
        _ => {
            // Invert the condition to hop over the far jump.
            let funct3 = if not_equal { 0b000 } else { 0b001 };
            code.extend_from_slice(&encode_b(12, rs2, rs1, funct3).to_le_bytes());
            emit_far_jump(code, disp - 4);
        }
    }
}

/// `auipc t6, hi20; jalr zero, lo12(t6)` — an 8-byte jump with ±2 GiB range,
/// relative to the `auipc` itself.
fn emit_far_jump(code: &mut Vec<u8>, disp: i64) {
    let disp = disp as i32;
    let hi = disp.wrapping_add(0x800) >> 12;
    let lo = disp.wrapping_sub(hi << 12);
    let auipc = ((hi as u32 & 0xFFFFF) << 12) | (T6.num() << 7) | 0b0010111;
    code.extend_from_slice(&auipc.to_le_bytes());
    code.extend_from_slice(&encode_i(lo, T6, 0b000, ZERO, 0b1100111).to_le_bytes());
}

// 32-bit encodings /////////////////////////////////////////////////////////

fn encode_r(funct7: u32, rs2: Reg, rs1: Reg, funct3: u32, rd: Reg, opcode: u32) -> u32 {
    funct7 << 25 | rs2.num() << 20 | rs1.num() << 15 | funct3 << 12 | rd.num() << 7 | opcode
}

fn encode_i(imm: i32, rs1: Reg, funct3: u32, rd: Reg, opcode: u32) -> u32 {
    debug_assert!(fits_i(12, imm as i64) || funct3 == 0b001);
    (imm as u32 & 0xFFF) << 20 | rs1.num() << 15 | funct3 << 12 | rd.num() << 7 | opcode
}

fn encode_s(imm: i32, rs2: Reg, rs1: Reg, funct3: u32) -> u32 {
    debug_assert!(fits_i(12, imm as i64));
    let i = imm as u32;
    ((i >> 5) & 0x7F) << 25
        | rs2.num() << 20
        | rs1.num() << 15
        | funct3 << 12
        | (i & 0x1F) << 7
        | 0b0100011
}

fn encode_b(imm: i32, rs2: Reg, rs1: Reg, funct3: u32) -> u32 {
    debug_assert!(fits_i(13, imm as i64) && imm % 2 == 0);
    let i = imm as u32;
    ((i >> 12) & 1) << 31
        | ((i >> 5) & 0x3F) << 25
        | rs2.num() << 20
        | rs1.num() << 15
        | funct3 << 12
        | ((i >> 1) & 0xF) << 8
        | ((i >> 11) & 1) << 7
        | 0b1100011
}

fn encode_j(imm: i32, rd: Reg) -> u32 {
    debug_assert!(fits_i(21, imm as i64) && imm % 2 == 0);
    let i = imm as u32;
    ((i >> 20) & 1) << 31
        | ((i >> 1) & 0x3FF) << 21
        | ((i >> 11) & 1) << 20
        | ((i >> 12) & 0xFF) << 12
        | rd.num() << 7
        | 0b1101111
}

// 16-bit (RVC) encodings ///////////////////////////////////////////////////

/// CI format: `c.addi` (000), `c.addiw` (001), `c.li` (010), quadrant 01.
fn encode_ci(funct3: u32, rd: u32, imm: i32) -> u16 {
    let i = imm as u32;
    (funct3 << 13 | ((i >> 5) & 1) << 12 | rd << 7 | (i & 0x1F) << 2 | 0b01) as u16
}

/// CR format, quadrant 10: `c.jr`/`c.mv` (1000), `c.jalr`/`c.add` (1001).
fn encode_cr(funct4: u32, rd_rs1: u32, rs2: u32) -> u16 {
    (funct4 << 12 | rd_rs1 << 7 | rs2 << 2 | 0b10) as u16
}

fn encode_caddi16sp(imm: i32) -> u16 {
    let i = imm as u32;
    (0b011 << 13
        | ((i >> 9) & 1) << 12
        | 2 << 7
        | ((i >> 4) & 1) << 6
        | ((i >> 6) & 1) << 5
        | ((i >> 7) & 3) << 3
        | ((i >> 5) & 1) << 2
        | 0b01) as u16
}

/// `c.j`.
fn encode_cj(imm: i32) -> u16 {
    let i = imm as u32;
    (0b101 << 13
        | ((i >> 11) & 1) << 12
        | ((i >> 4) & 1) << 11
        | ((i >> 8) & 3) << 9
        | ((i >> 10) & 1) << 8
        | ((i >> 6) & 1) << 7
        | ((i >> 7) & 1) << 6
        | ((i >> 1) & 7) << 3
        | ((i >> 5) & 1) << 2
        | 0b01) as u16
}

/// `c.beqz` (110) / `c.bnez` (111).
fn encode_cb(funct3: u32, rs1_3bit: u32, imm: i32) -> u16 {
    let i = imm as u32;
    (funct3 << 13
        | ((i >> 8) & 1) << 12
        | ((i >> 3) & 3) << 10
        | rs1_3bit << 7
        | ((i >> 6) & 3) << 5
        | ((i >> 1) & 3) << 3
        | ((i >> 5) & 1) << 2
        | 0b01) as u16
}

fn fits_i(bits: u32, v: i64) -> bool {
    let bound = 1i64 << (bits - 1);
    v >= -bound && v < bound
}

// Compiler /////////////////////////////////////////////////////////////////

/// Compiles a finalized instruction stream to RV64IMC machine code.
pub fn compile<C: Cell>(program: &[Instruction]) -> Result<Vec<u8>, JitError> {
    let width = C::WIDTH;
    let mut asm = Rv64Assembly::new();
    prologue(&mut asm);

    for ins in program {
        let disp = ins.off * width.bytes() as i64;
        match ins.op {
            Op::Add(v) => {
                let (base, off) = cell_addr(&mut asm, disp);
                asm.load_cell(width, A5, base, off);
                if fits_i(12, v) {
                    asm.addi(A5, A5, v as i32);
                } else {
                    asm.li(A4, v);
                    asm.add(A5, A5, A4);
                }
                asm.store_cell(width, A5, base, off);
            }
            Op::Move(v) => {
                let delta = v * width.bytes() as i64;
                if fits_i(12, delta) {
                    asm.addi(S0, S0, delta as i32);
                } else {
                    asm.li(A5, delta);
                    asm.add(S0, S0, A5);
                }
            }
            Op::Print => {
                let (base, off) = cell_addr(&mut asm, disp);
                asm.lbu(A0, base, off);
                asm.jalr(RA, S2, 0);
            }
            Op::Read => {
                asm.jalr(RA, S1, 0);
                asm.andi(A0, A0, 0xFF);
                let (base, off) = cell_addr(&mut asm, disp);
                asm.store_cell(width, A0, base, off);
            }
            Op::JumpForward(_) => {
                let (base, off) = cell_addr(&mut asm, disp);
                asm.load_cell(width, A5, base, off);
                asm.beq_forward(A5);
            }
            Op::JumpBack(_) => {
                let (base, off) = cell_addr(&mut asm, disp);
                asm.load_cell(width, A5, base, off);
                asm.bne_back(A5);
            }
            Op::Set(v) => {
                asm.li(A5, v);
                let (base, off) = cell_addr(&mut asm, disp);
                asm.store_cell(width, A5, base, off);
            }
            Op::Mac { offset, multiplier } => {
                let dst_disp = offset * width.bytes() as i64;
                let (base, off) = cell_addr(&mut asm, disp);
                asm.load_cell(width, A5, base, off);

                match multiplier {
                    1 => {
                        let (base, off) = cell_addr(&mut asm, dst_disp);
                        asm.load_cell(width, A4, base, off);
                        asm.add(A4, A4, A5);
                        asm.store_cell(width, A4, base, off);
                    }
                    -1 => {
                        let (base, off) = cell_addr(&mut asm, dst_disp);
                        asm.load_cell(width, A4, base, off);
                        asm.sub(A4, A4, A5);
                        asm.store_cell(width, A4, base, off);
                    }
                    m => {
                        asm.li(A4, m);
                        asm.mul(A5, A5, A4);
                        let (base, off) = cell_addr(&mut asm, dst_disp);
                        asm.load_cell(width, A4, base, off);
                        asm.add(A4, A4, A5);
                        asm.store_cell(width, A4, base, off);
                    }
                }
            }
        }
    }

    epilogue(&mut asm);
    Ok(asm.assemble())
}

/// Resolves a byte displacement from the cell pointer into a base register
/// and an i12 offset, materializing the address in `t6` when it is too far.
fn cell_addr(asm: &mut Rv64Assembly, disp: i64) -> (Reg, i32) {
    if fits_i(12, disp) {
        (S0, disp as i32)
    } else {
        asm.li(T6, disp);
        asm.add(T6, T6, S0);
        (T6, 0)
    }
}

fn prologue(asm: &mut Rv64Assembly) {
    asm.addi(SP, SP, -48);
    asm.sd(RA, SP, 40);
    asm.sd(S0, SP, 32);
    asm.sd(S1, SP, 24);
    asm.sd(S2, SP, 16);
    asm.sd(S3, SP, 8);
    asm.mv(S0, A0);
    asm.mv(S1, A1);
    asm.mv(S2, A2);
}

fn epilogue(asm: &mut Rv64Assembly) {
    asm.mv(A0, S0);
    asm.ld(RA, SP, 40);
    asm.ld(S0, SP, 32);
    asm.ld(S1, SP, 24);
    asm.ld(S2, SP, 16);
    asm.ld(S3, SP, 8);
    asm.addi(SP, SP, 48);
    asm.ret();
}
