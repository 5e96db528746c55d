//! All errors that can be _generated_ by the toolchain.
use std::fmt;

use mmap_exec::MappingError;

/// Any error that occurs as a result of compiling the source code.
#[derive(Debug)]
pub struct CompilationError {
    reason: Reason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Input ended while at least one `[` was still open. The REPL treats
    /// this as "read another line"; batch mode treats it as fatal.
    UnmatchedJumpForward,
    /// A `]` with no matching `[`.
    UnmatchedJumpBack,
}

impl CompilationError {
    pub fn new(reason: Reason) -> Self {
        CompilationError { reason }
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// True iff more input could complete the program (open bracket at EOF).
    pub fn wants_more_input(&self) -> bool {
        self.reason == Reason::UnmatchedJumpForward
    }

    pub fn message(&self) -> &'static str {
        self.reason.message()
    }

    pub fn message_identifier(&self) -> u32 {
        self.reason.message_identifier()
    }
}

impl Reason {
    pub fn message_identifier(&self) -> u32 {
        use Reason::*;
        match self {
            UnmatchedJumpForward => 0x001,
            UnmatchedJumpBack => 0x002,
        }
    }

    pub fn message(&self) -> &'static str {
        use Reason::*;
        match self {
            UnmatchedJumpForward => {
                "too many '[' brackets. Check that each '[' has a matching ']'"
            }
            UnmatchedJumpBack => "too many ']' brackets. Check that each '[' has a matching ']'",
        }
    }
}

impl std::error::Error for CompilationError {}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "error[{:04x}]: {}",
            self.message_identifier(),
            self.message()
        )
    }
}

/// Any error raised while producing or running native code.
#[derive(Debug)]
pub enum JitError {
    /// The host is neither x86-64 nor riscv64.
    UnsupportedArchitecture,
    /// A cell offset produced a displacement that does not fit in the
    /// signed 32-bit field of an x86-64 memory operand.
    UnsupportedLargeOffset,
    /// The OS refused to map or reprotect the code pages.
    Mapping(MappingError),
}

impl From<MappingError> for JitError {
    fn from(e: MappingError) -> Self {
        JitError::Mapping(e)
    }
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use JitError::*;
        match self {
            UnsupportedArchitecture => {
                write!(f, "native compilation is not supported on this architecture")
            }
            UnsupportedLargeOffset => write!(
                f,
                "cell offset too large for native code; try a lower optimization level"
            ),
            Mapping(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for JitError {}
