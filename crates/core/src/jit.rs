//! Architecture-neutral compile driver.
//!
//! Picks a back-end for the host, owns the W^X lifecycle of the emitted
//! code, and round-trips the cell pointer through the compiled function.

use mmap_exec::{as_function, WritableRegion};
use tracing::debug;

use crate::cell::Cell;
use crate::errors::JitError;
use crate::io;
use crate::opcode::Instruction;
use crate::tape::Tape;
use crate::{asm, fault};

/// The callback ABI a back-end emits calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// x86-64 System V: rdi/rsi/rdx in, rax out.
    SysV,
    /// RV64 GNU: a0/a1/a2 in, a0 out.
    Rv64C,
}

/// A native back-end this build can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    X64,
    Rv64,
}

impl Backend {
    /// The back-end matching the host, if there is one.
    pub fn host() -> Option<Backend> {
        if cfg!(target_arch = "x86_64") {
            Some(Backend::X64)
        } else if cfg!(target_arch = "riscv64") {
            Some(Backend::Rv64)
        } else {
            None
        }
    }

    pub fn call_conv(self) -> CallConv {
        match self {
            Backend::X64 => CallConv::SysV,
            Backend::Rv64 => CallConv::Rv64C,
        }
    }
}

/// Machine code for the host, plus the ABI its callbacks use.
pub struct CompiledProgram {
    code: Vec<u8>,
    call_conv: CallConv,
}

impl CompiledProgram {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }
}

/// Compiles a finalized instruction stream for an explicit back-end. The
/// result is only runnable on a matching host, but producing it anywhere is
/// useful (inspection, cross builds).
pub fn compile_for<C: Cell>(
    backend: Backend,
    program: &[Instruction],
) -> Result<CompiledProgram, JitError> {
    let code = match backend {
        Backend::X64 => asm::x86_64::compile::<C>(program)?,
        Backend::Rv64 => asm::rv64::compile::<C>(program)?,
    };
    debug!(bytes = code.len(), ?backend, "compiled program");

    Ok(CompiledProgram {
        code,
        call_conv: backend.call_conv(),
    })
}

/// Compiles a finalized instruction stream for the host architecture.
pub fn compile<C: Cell>(program: &[Instruction]) -> Result<CompiledProgram, JitError> {
    let backend = Backend::host().ok_or(JitError::UnsupportedArchitecture)?;
    compile_for::<C>(backend, program)
}

/// The compiled function: cell pointer and the two I/O callbacks in, final
/// cell pointer out. Both supported ABIs spell this `extern "C"` on their
/// respective hosts.
type Entry<C> = unsafe extern "C" fn(*mut C, extern "C" fn() -> u8, extern "C" fn(u8)) -> *mut C;

/// Copies the code into fresh writable pages, flips them executable, runs
/// the program against the tape, and unmaps on return.
pub fn execute<C: Cell>(compiled: &CompiledProgram, tape: &mut Tape<C>) -> Result<(), JitError> {
    fault::install();

    let code = compiled.code();
    let mut region = WritableRegion::allocate(code.len())?;
    region[..code.len()].copy_from_slice(code);
    let region = region.into_executable()?;

    let end = unsafe {
        let entry = as_function!(region, Entry<C>);
        entry(tape.current_ptr(), io::read_shim, io::print_shim)
    };
    tape.set_current_ptr(end);

    Ok(())
}

/// Compile-and-run convenience used by the CLI.
pub fn run<C: Cell>(program: &[Instruction], tape: &mut Tape<C>) -> Result<(), JitError> {
    let compiled = compile::<C>(program)?;
    execute(&compiled, tape)
}
