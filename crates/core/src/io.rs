//! Blocking byte I/O on the standard streams.
//!
//! The interpreter talks to an [Io] implementation; the JIT calls the
//! `extern "C"` shims below through function pointers, using whatever the
//! platform C calling convention is.
//!
//! End-of-input policy: the first read past EOF returns the configured EOF
//! byte, the second one flushes output and exits the process with status 1.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

pub trait Io {
    /// Returns the next input byte, blocking as needed.
    fn read_byte(&mut self) -> u8;

    /// Best-effort write to standard output.
    fn print_byte(&mut self, byte: u8);
}

/// [Io] over the process's stdin/stdout.
pub struct Console {
    eof_byte: u8,
    seen_eof: bool,
}

impl Console {
    pub fn new(eof_byte: u8) -> Self {
        Console {
            eof_byte,
            seen_eof: false,
        }
    }
}

impl Io for Console {
    fn read_byte(&mut self) -> u8 {
        if self.seen_eof {
            die_after_eof();
        }
        // Anything printed so far should be visible before we block.
        let _ = io::stdout().flush();

        let mut one_byte = [0u8];
        match io::stdin().read_exact(&mut one_byte) {
            Ok(()) => one_byte[0],
            Err(_) => {
                self.seen_eof = true;
                self.eof_byte
            }
        }
    }

    fn print_byte(&mut self, byte: u8) {
        let _ = io::stdout().write_all(&[byte]);
    }
}

/// In-memory [Io] for embedders and tests.
pub struct BufferedIo {
    input: Vec<u8>,
    cursor: usize,
    eof_byte: u8,
    pub output: Vec<u8>,
}

impl BufferedIo {
    pub fn new(input: &[u8], eof_byte: u8) -> Self {
        BufferedIo {
            input: input.to_vec(),
            cursor: 0,
            eof_byte,
            output: Vec::new(),
        }
    }
}

impl Io for BufferedIo {
    fn read_byte(&mut self) -> u8 {
        match self.input.get(self.cursor) {
            Some(&b) => {
                self.cursor += 1;
                b
            }
            None => self.eof_byte,
        }
    }

    fn print_byte(&mut self, byte: u8) {
        self.output.push(byte);
    }
}

fn die_after_eof() -> ! {
    let _ = io::stdout().flush();
    eprintln!("warning: input exhausted");
    std::process::exit(1);
}

// The JIT cannot carry an &mut Io through its C-ABI entry point, so the
// shims share one process-wide EOF state.

static EOF_BYTE: AtomicU8 = AtomicU8::new(0);
static SEEN_EOF: AtomicBool = AtomicBool::new(false);

/// Sets the EOF byte the JIT shims hand to compiled code.
pub fn configure_shims(eof_byte: u8) {
    EOF_BYTE.store(eof_byte, Ordering::Relaxed);
    SEEN_EOF.store(false, Ordering::Relaxed);
}

/// `read` callback passed to compiled code.
pub extern "C" fn read_shim() -> u8 {
    if SEEN_EOF.load(Ordering::Relaxed) {
        die_after_eof();
    }
    let _ = io::stdout().flush();

    let mut one_byte = [0u8];
    match io::stdin().read_exact(&mut one_byte) {
        Ok(()) => one_byte[0],
        Err(_) => {
            SEEN_EOF.store(true, Ordering::Relaxed);
            EOF_BYTE.load(Ordering::Relaxed)
        }
    }
}

/// `print` callback passed to compiled code.
pub extern "C" fn print_shim(byte: u8) {
    let _ = io::stdout().write_all(&[byte]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_io_round_trips() {
        let mut io = BufferedIo::new(b"hi", 0xFF);
        assert_eq!(io.read_byte(), b'h');
        assert_eq!(io.read_byte(), b'i');
        assert_eq!(io.read_byte(), 0xFF);
        io.print_byte(b'!');
        assert_eq!(io.output, b"!");
    }
}
