//! Assembler and compiler for x86-64 (SysV).
//!
//! Register plan:
//!
//! - `rbp` — cell pointer (argument 1, returned in `rax`)
//! - `r12` — read callback (argument 2)
//! - `rbx` — print callback (argument 3)
//!
//! Every opcode expands to a fixed template parameterized by cell width;
//! memory operands always use the 32-bit displacement form `[rbp + disp32]`,
//! so an offset that cannot be encoded is reported as
//! [JitError::UnsupportedLargeOffset] instead of being silently truncated.

use crate::cell::{Cell, CellWidth};
use crate::errors::JitError;
use crate::opcode::{Instruction, Op};

/// Generates x86-64 machine code into a flat buffer.
///
/// Forward jumps are emitted with a placeholder displacement and a patch
/// site pushed onto a stack; the matching back jump pops and patches it.
pub struct X64Assembly {
    code: Vec<u8>,
    forward_patches: Vec<usize>,
}

impl X64Assembly {
    pub fn new() -> Self {
        X64Assembly {
            code: Vec::new(),
            forward_patches: Vec::new(),
        }
    }

    /// Returns machine code.
    /// Panics if there are unpatched forward jumps.
    pub fn machine_code(self) -> Vec<u8> {
        assert!(
            self.forward_patches.is_empty(),
            "tried to generate binary, but {} forward jumps are still unpatched!",
            self.forward_patches.len()
        );
        self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    // Prologue / epilogue ////////////////////////////////////////////////

    /// Saves the callee-saved registers and keeps `rsp` 16-byte aligned
    /// across the callback calls.
    pub fn prologue(&mut self) {
        self.emit(&[0x55]); // push rbp
        self.emit(&[0x53]); // push rbx
        self.emit(&[0x41, 0x54]); // push r12
        self.emit(&[0x41, 0x55]); // push r13
        self.emit(&[0x41, 0x56]); // push r14
        self.emit(&[0x41, 0x57]); // push r15
        self.emit(&[0x48, 0x83, 0xEC, 0x08]); // sub rsp, 8
        self.emit(&[0x48, 0x89, 0xFD]); // mov rbp, rdi
        self.emit(&[0x49, 0x89, 0xF4]); // mov r12, rsi
        self.emit(&[0x48, 0x89, 0xD3]); // mov rbx, rdx
    }

    /// Moves the final cell pointer into `rax` and restores in reverse.
    pub fn epilogue(&mut self) {
        self.emit(&[0x48, 0x89, 0xE8]); // mov rax, rbp
        self.emit(&[0x48, 0x83, 0xC4, 0x08]); // add rsp, 8
        self.emit(&[0x41, 0x5F]); // pop r15
        self.emit(&[0x41, 0x5E]); // pop r14
        self.emit(&[0x41, 0x5D]); // pop r13
        self.emit(&[0x41, 0x5C]); // pop r12
        self.emit(&[0x5B]); // pop rbx
        self.emit(&[0x5D]); // pop rbp
        self.emit(&[0xC3]); // ret
    }

    // Cell arithmetic ////////////////////////////////////////////////////

    /// `add <width> [rbp + disp], v`
    pub fn add_cell(&mut self, width: CellWidth, disp: i32, v: i64) {
        match width {
            CellWidth::C8 => {
                self.emit(&[0x80, 0x85]); // add byte [rbp+disp32], imm8
                self.emit_i32(disp);
                self.emit(&[v as u8]);
            }
            CellWidth::C16 => {
                self.emit(&[0x66, 0x81, 0x85]); // add word [rbp+disp32], imm16
                self.emit_i32(disp);
                self.emit(&(v as u16).to_le_bytes());
            }
            CellWidth::C32 => {
                self.emit(&[0x81, 0x85]); // add dword [rbp+disp32], imm32
                self.emit_i32(disp);
                self.emit_i32(v as i32);
            }
            CellWidth::C64 => {
                if let Ok(imm) = i32::try_from(v) {
                    self.emit(&[0x48, 0x81, 0x85]); // add qword [rbp+disp32], imm32
                    self.emit_i32(disp);
                    self.emit_i32(imm);
                } else {
                    self.mov_rax_imm64(v);
                    self.emit(&[0x48, 0x01, 0x85]); // add [rbp+disp32], rax
                    self.emit_i32(disp);
                }
            }
        }
    }

    /// `mov <width> [rbp + disp], v`
    pub fn set_cell(&mut self, width: CellWidth, disp: i32, v: i64) {
        match width {
            CellWidth::C8 => {
                self.emit(&[0xC6, 0x85]); // mov byte [rbp+disp32], imm8
                self.emit_i32(disp);
                self.emit(&[v as u8]);
            }
            CellWidth::C16 => {
                self.emit(&[0x66, 0xC7, 0x85]); // mov word [rbp+disp32], imm16
                self.emit_i32(disp);
                self.emit(&(v as u16).to_le_bytes());
            }
            CellWidth::C32 => {
                self.emit(&[0xC7, 0x85]); // mov dword [rbp+disp32], imm32
                self.emit_i32(disp);
                self.emit_i32(v as i32);
            }
            CellWidth::C64 => {
                if let Ok(imm) = i32::try_from(v) {
                    self.emit(&[0x48, 0xC7, 0x85]); // mov qword [rbp+disp32], imm32 (sign-extended)
                    self.emit_i32(disp);
                    self.emit_i32(imm);
                } else {
                    self.mov_rax_imm64(v);
                    self.emit(&[0x48, 0x89, 0x85]); // mov [rbp+disp32], rax
                    self.emit_i32(disp);
                }
            }
        }
    }

    /// `add rbp, bytes` — advances the cell pointer.
    pub fn move_ptr(&mut self, bytes: i32) {
        self.emit(&[0x48, 0x81, 0xC5]); // add rbp, imm32
        self.emit_i32(bytes);
    }

    // I/O ////////////////////////////////////////////////////////////////

    /// Loads the cell's low byte into `dil` and calls the print callback.
    pub fn print_cell(&mut self, disp: i32) {
        self.emit(&[0x0F, 0xB6, 0xBD]); // movzx edi, byte [rbp+disp32]
        self.emit_i32(disp);
        self.emit(&[0xFF, 0xD3]); // call rbx
    }

    /// Calls the read callback and stores the returned byte, zero-extended
    /// to the cell width.
    pub fn read_cell(&mut self, width: CellWidth, disp: i32) {
        self.emit(&[0x41, 0xFF, 0xD4]); // call r12
        match width {
            CellWidth::C8 => {
                self.emit(&[0x88, 0x85]); // mov [rbp+disp32], al
                self.emit_i32(disp);
            }
            CellWidth::C16 => {
                self.emit(&[0x0F, 0xB6, 0xC0]); // movzx eax, al
                self.emit(&[0x66, 0x89, 0x85]); // mov [rbp+disp32], ax
                self.emit_i32(disp);
            }
            CellWidth::C32 => {
                self.emit(&[0x0F, 0xB6, 0xC0]); // movzx eax, al
                self.emit(&[0x89, 0x85]); // mov [rbp+disp32], eax
                self.emit_i32(disp);
            }
            CellWidth::C64 => {
                self.emit(&[0x0F, 0xB6, 0xC0]); // movzx eax, al (clears the upper half)
                self.emit(&[0x48, 0x89, 0x85]); // mov [rbp+disp32], rax
                self.emit_i32(disp);
            }
        }
    }

    // Branches ///////////////////////////////////////////////////////////

    /// `cmp <width> [rbp + disp], 0` followed by a forward `je` with a
    /// placeholder displacement; the patch site goes on the stack.
    pub fn jump_forward(&mut self, width: CellWidth, disp: i32) {
        self.cmp_cell_zero(width, disp);
        self.emit(&[0x0F, 0x84]); // je rel32
        self.forward_patches.push(self.code.len());
        self.emit_i32(0);
    }

    /// `cmp` + `jne` back to `body_start`, then patches the matching
    /// forward `je` to land here.
    pub fn jump_back(&mut self, width: CellWidth, disp: i32) {
        let site = self
            .forward_patches
            .pop()
            .expect("jump_back without a pending jump_forward");
        let body_start = site + 4;

        self.cmp_cell_zero(width, disp);
        self.emit(&[0x0F, 0x85]); // jne rel32
        let after_jne = self.code.len() + 4;
        self.emit_i32(body_start as i32 - after_jne as i32);

        let fixup = (after_jne - (site + 4)) as i32;
        self.code[site..site + 4].copy_from_slice(&fixup.to_le_bytes());
    }

    fn cmp_cell_zero(&mut self, width: CellWidth, disp: i32) {
        match width {
            CellWidth::C8 => {
                self.emit(&[0x80, 0xBD]); // cmp byte [rbp+disp32], 0
                self.emit_i32(disp);
                self.emit(&[0x00]);
            }
            CellWidth::C16 => {
                self.emit(&[0x66, 0x81, 0xBD]); // cmp word [rbp+disp32], 0
                self.emit_i32(disp);
                self.emit(&[0x00, 0x00]);
            }
            CellWidth::C32 => {
                self.emit(&[0x81, 0xBD]); // cmp dword [rbp+disp32], 0
                self.emit_i32(disp);
                self.emit_i32(0);
            }
            CellWidth::C64 => {
                self.emit(&[0x48, 0x81, 0xBD]); // cmp qword [rbp+disp32], 0
                self.emit_i32(disp);
                self.emit_i32(0);
            }
        }
    }

    // Multiply-accumulate ////////////////////////////////////////////////

    /// `cells[dst] += cells[src] * multiplier`.
    ///
    /// `multiplier == ±1` lowers to plain add/sub; byte cells go through
    /// `mul` (implicit `al`), wider cells through three-operand `imul`.
    pub fn mac_cell(&mut self, width: CellWidth, src_disp: i32, dst_disp: i32, multiplier: i64) {
        match multiplier {
            1 => {
                self.load_acc(width, src_disp);
                self.add_acc_to(width, dst_disp, false);
            }
            -1 => {
                self.load_acc(width, src_disp);
                self.add_acc_to(width, dst_disp, true);
            }
            m => {
                match width {
                    CellWidth::C8 => {
                        self.emit(&[0xB8]); // mov eax, imm32 (multiplier into al)
                        self.emit_i32(m as i32);
                        self.emit(&[0xF6, 0xA5]); // mul byte [rbp+disp32] (ax = al * mem)
                        self.emit_i32(src_disp);
                    }
                    CellWidth::C16 => {
                        self.emit(&[0x66, 0x69, 0x85]); // imul ax, [rbp+disp32], imm16
                        self.emit_i32(src_disp);
                        self.emit(&(m as u16).to_le_bytes());
                    }
                    CellWidth::C32 => {
                        self.emit(&[0x69, 0x85]); // imul eax, [rbp+disp32], imm32
                        self.emit_i32(src_disp);
                        self.emit_i32(m as i32);
                    }
                    CellWidth::C64 => {
                        if let Ok(imm) = i32::try_from(m) {
                            self.emit(&[0x48, 0x69, 0x85]); // imul rax, [rbp+disp32], imm32
                            self.emit_i32(src_disp);
                            self.emit_i32(imm);
                        } else {
                            self.mov_rax_imm64(m);
                            self.emit(&[0x48, 0x0F, 0xAF, 0x85]); // imul rax, [rbp+disp32]
                            self.emit_i32(src_disp);
                        }
                    }
                }
                self.add_acc_to(width, dst_disp, false);
            }
        }
    }

    /// Loads a cell into the accumulator register.
    fn load_acc(&mut self, width: CellWidth, disp: i32) {
        match width {
            CellWidth::C8 => self.emit(&[0x8A, 0x85]), // mov al, [rbp+disp32]
            CellWidth::C16 => self.emit(&[0x66, 0x8B, 0x85]), // mov ax, [rbp+disp32]
            CellWidth::C32 => self.emit(&[0x8B, 0x85]), // mov eax, [rbp+disp32]
            CellWidth::C64 => self.emit(&[0x48, 0x8B, 0x85]), // mov rax, [rbp+disp32]
        }
        self.emit_i32(disp);
    }

    /// `add`/`sub` the accumulator into a cell.
    fn add_acc_to(&mut self, width: CellWidth, disp: i32, subtract: bool) {
        let opcode = if subtract { 0x28 } else { 0x00 };
        match width {
            CellWidth::C8 => self.emit(&[opcode, 0x85]), // add/sub [rbp+disp32], al
            CellWidth::C16 => self.emit(&[0x66, opcode | 0x01, 0x85]), // add/sub [rbp+disp32], ax
            CellWidth::C32 => self.emit(&[opcode | 0x01, 0x85]), // add/sub [rbp+disp32], eax
            CellWidth::C64 => self.emit(&[0x48, opcode | 0x01, 0x85]), // add/sub [rbp+disp32], rax
        }
        self.emit_i32(disp);
    }

    fn mov_rax_imm64(&mut self, v: i64) {
        self.emit(&[0x48, 0xB8]); // mov rax, imm64
        self.emit(&v.to_le_bytes());
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn emit_i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }
}

/// Compiles a finalized instruction stream to x86-64 machine code.
pub fn compile<C: Cell>(program: &[Instruction]) -> Result<Vec<u8>, JitError> {
    let width = C::WIDTH;
    let mut asm = X64Assembly::new();
    asm.prologue();

    for ins in program {
        let disp = cell_disp(ins.off, width)?;
        match ins.op {
            Op::Add(v) => asm.add_cell(width, disp, v),
            Op::Move(v) => asm.move_ptr(cell_disp(v, width)?),
            Op::Print => asm.print_cell(disp),
            Op::Read => asm.read_cell(width, disp),
            Op::JumpForward(_) => asm.jump_forward(width, disp),
            Op::JumpBack(_) => asm.jump_back(width, disp),
            Op::Set(v) => asm.set_cell(width, disp, v),
            Op::Mac { offset, multiplier } => {
                let dst = cell_disp(offset, width)?;
                asm.mac_cell(width, disp, dst, multiplier);
            }
        }
    }

    asm.epilogue();
    Ok(asm.machine_code())
}

/// Scales a cell offset to a byte displacement, or refuses it.
fn cell_disp(off: i64, width: CellWidth) -> Result<i32, JitError> {
    off.checked_mul(width.bytes() as i64)
        .and_then(|bytes| i32::try_from(bytes).ok())
        .ok_or(JitError::UnsupportedLargeOffset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::finalize;
    use crate::parsing::parse;

    #[test]
    fn prologue_preserves_stack_alignment() {
        let mut asm = X64Assembly::new();
        asm.prologue();
        let code = asm.machine_code();
        // six pushes and the 8-byte adjustment
        assert_eq!(&code[..4], &[0x55, 0x53, 0x41, 0x54]);
        assert!(code
            .windows(4)
            .any(|w| w == [0x48, 0x83, 0xEC, 0x08]));
    }

    #[test]
    fn add_byte_cell_encoding() {
        let mut asm = X64Assembly::new();
        asm.add_cell(CellWidth::C8, 0x10, 5);
        assert_eq!(
            asm.machine_code(),
            vec![0x80, 0x85, 0x10, 0x00, 0x00, 0x00, 0x05]
        );
    }

    #[test]
    fn add_qword_cell_uses_sign_extended_imm32() {
        let mut asm = X64Assembly::new();
        asm.add_cell(CellWidth::C64, -8, -1);
        assert_eq!(
            asm.machine_code(),
            vec![0x48, 0x81, 0x85, 0xF8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn branch_pair_patches_both_directions() {
        let mut asm = X64Assembly::new();
        asm.jump_forward(CellWidth::C8, 0);
        let body = asm.len();
        asm.add_cell(CellWidth::C8, 0, -1);
        asm.jump_back(CellWidth::C8, 0);
        let code = asm.machine_code();

        // cmp byte [rbp+0], 0 is 7 bytes; je rel32 is 6.
        // Forward je displacement: from end of je to end of code.
        let je_disp = i32::from_le_bytes(code[9..13].try_into().unwrap());
        assert_eq!(13 + je_disp as usize, code.len());

        // Back jne displacement: from end of code to loop body start.
        let jne_disp = i32::from_le_bytes(code[code.len() - 4..].try_into().unwrap());
        assert_eq!((code.len() as i32 + jne_disp) as usize, body);
    }

    #[test]
    fn mac_with_unit_multiplier_is_an_add() {
        let mut asm = X64Assembly::new();
        asm.mac_cell(CellWidth::C8, 0, 4, 1);
        // mov al, [rbp+0]; add [rbp+4], al
        assert_eq!(
            asm.machine_code(),
            vec![0x8A, 0x85, 0, 0, 0, 0, 0x00, 0x85, 4, 0, 0, 0]
        );
    }

    #[test]
    fn mac_with_negative_unit_multiplier_is_a_sub() {
        let mut asm = X64Assembly::new();
        asm.mac_cell(CellWidth::C32, 0, 4, -1);
        // mov eax, [rbp+0]; sub [rbp+4], eax
        assert_eq!(
            asm.machine_code(),
            vec![0x8B, 0x85, 0, 0, 0, 0, 0x29, 0x85, 4, 0, 0, 0]
        );
    }

    #[test]
    fn byte_mac_multiplies_through_al() {
        let mut asm = X64Assembly::new();
        asm.mac_cell(CellWidth::C8, 0, 1, 3);
        let code = asm.machine_code();
        // mov eax, 3
        assert_eq!(&code[..5], &[0xB8, 0x03, 0x00, 0x00, 0x00]);
        // mul byte [rbp+0]
        assert_eq!(&code[5..7], &[0xF6, 0xA5]);
    }

    #[test]
    fn rejects_displacements_beyond_disp32() {
        let program = vec![Instruction::at(1 << 40, Op::Add(1))];
        let err = compile::<u8>(&program).unwrap_err();
        assert!(matches!(err, JitError::UnsupportedLargeOffset));
    }

    #[test]
    fn wide_cells_scale_the_displacement() {
        assert_eq!(cell_disp(3, CellWidth::C32).unwrap(), 12);
        assert_eq!(cell_disp(-2, CellWidth::C64).unwrap(), -16);
        assert!(cell_disp(1 << 29, CellWidth::C64).is_err());
    }

    #[test]
    fn whole_program_compiles_with_balanced_patches() {
        let mut program = parse(b"++[>+<-].");
        finalize(&mut program).unwrap();
        // machine_code() would panic on an unpatched forward jump
        let code = compile::<u8>(&program).unwrap();
        assert!(code.ends_with(&[0xC3]));
    }
}
