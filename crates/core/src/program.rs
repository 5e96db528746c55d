//! A compiled program, ready for the interpreter or a back-end.

use crate::errors::CompilationError;
use crate::opcode::{self, Instruction};
use crate::optimize;
use crate::parsing;

/// An optimized, finalized instruction stream.
///
/// Owned by the driver; the interpreter, the back-ends and the profiler all
/// borrow it.
#[derive(Debug)]
pub struct Program {
    instructions: Vec<Instruction>,
    max_off: u64,
}

impl Program {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Largest absolute cell offset any instruction can touch; the tape's
    /// danger zones must cover at least this many cells.
    pub fn max_off(&self) -> u64 {
        self.max_off
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Parse → optimize → finalize.
pub fn compile(source: &[u8], opt_level: u8) -> Result<Program, CompilationError> {
    let parsed = parsing::parse(source);
    let mut instructions = optimize::optimize(&parsed, opt_level);
    let max_off = opcode::finalize(&mut instructions)?;

    Ok(Program {
        instructions,
        max_off,
    })
}
