use std::fs;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process;

use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use bfx_core::interp::{self, Profile, RunStatus};
use bfx_core::io::{configure_shims, Console};
use bfx_core::opcode;
use bfx_core::tape::Tape;
use bfx_core::{compile, fault, jit, Cell, CellWidth, JitError, Program};

#[derive(Debug, StructOpt)]
#[structopt(name = "bfx", about = "An optimizing Brainfuck toolchain")]
struct Opt {
    /// Program to run; starts an interactive session when omitted
    #[structopt(parse(from_os_str))]
    program: Option<PathBuf>,

    /// Optimization level (0-4)
    #[structopt(short = "O", long = "opt-level", default_value = "2")]
    opt_level: u8,

    /// Cell width in bits (8, 16, 32, 64)
    #[structopt(long, default_value = "8")]
    cell_width: CellWidth,

    /// Number of tape cells
    #[structopt(long, default_value = "30000")]
    tape_size: usize,

    /// Cell the pointer starts at
    #[structopt(long, default_value = "0")]
    start_cell: usize,

    /// Force the interpreter, even when the host has a JIT back-end
    #[structopt(long)]
    interpret: bool,

    /// Stop after this many interpreted instructions
    #[structopt(long)]
    budget: Option<u64>,

    /// Byte returned by `,` at end of input
    #[structopt(long, default_value = "0")]
    eof_byte: u8,

    /// Dump an execution profile to stderr (interpreter only)
    #[structopt(long)]
    profile: bool,

    /// Print the optimized instruction stream and exit
    #[structopt(long)]
    dump_ir: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();
    if opt.opt_level > 4 {
        eprintln!("bfx: optimization level must be 0-4");
        process::exit(1);
    }

    fault::install();
    configure_shims(opt.eof_byte);

    process::exit(match opt.cell_width {
        CellWidth::C8 => run::<u8>(&opt),
        CellWidth::C16 => run::<u16>(&opt),
        CellWidth::C32 => run::<u32>(&opt),
        CellWidth::C64 => run::<u64>(&opt),
    })
}

fn run<C: Cell>(opt: &Opt) -> i32 {
    match &opt.program {
        Some(path) => batch::<C>(opt, path),
        None => repl::<C>(opt),
    }
}

fn batch<C: Cell>(opt: &Opt, path: &PathBuf) -> i32 {
    let source = match fs::read(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("bfx: {}: {}", path.display(), e);
            return 1;
        }
    };

    let program = match compile(&source, opt.opt_level) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("bfx: {}", e);
            return 1;
        }
    };

    if opt.dump_ir {
        print!("{}", opcode::disassemble(program.instructions()));
        return 0;
    }

    let mut tape: Tape<C> = match Tape::new(opt.tape_size, opt.start_cell) {
        Ok(tape) => tape,
        Err(e) => {
            eprintln!("bfx: could not map the tape: {}", e);
            return 1;
        }
    };
    if let Err(e) = tape.grow_danger_zone(program.max_off()) {
        eprintln!("bfx: could not grow the danger zone: {}", e);
        return 1;
    }

    // The JIT has no instruction budget and no profiler; both force the
    // interpreter.
    if !opt.interpret && !opt.profile && opt.budget.is_none() {
        match jit::run(program.instructions(), &mut tape) {
            Ok(()) => return 0,
            Err(e @ JitError::UnsupportedArchitecture)
            | Err(e @ JitError::UnsupportedLargeOffset) => {
                eprintln!("bfx: {}; falling back to the interpreter", e);
            }
            Err(e) => {
                eprintln!("bfx: {}", e);
                return 1;
            }
        }
    }

    interpret_chunk::<C>(opt, &program, &mut tape)
}

fn interpret_chunk<C: Cell>(opt: &Opt, program: &Program, tape: &mut Tape<C>) -> i32 {
    let mut console = Console::new(opt.eof_byte);
    let mut profile = opt.profile.then(|| Profile::new(program.len()));

    let status = interp::run(
        program.instructions(),
        tape,
        &mut console,
        opt.budget,
        profile.as_mut(),
    );

    let _ = std::io::stdout().flush();
    if status == RunStatus::OutOfFuel {
        eprintln!("bfx: instruction budget exhausted");
    }
    if let Some(profile) = profile {
        eprint!("{}", profile.dump(program.instructions()));
    }
    0
}

/// Line-at-a-time interactive mode.
///
/// A chunk with an open bracket asks for continuation lines; everything
/// else runs immediately against the session's single tape, whose danger
/// zones only ever grow.
fn repl<C: Cell>(opt: &Opt) -> i32 {
    let stdin = std::io::stdin();
    let mut tape: Tape<C> = match Tape::new(opt.tape_size, opt.start_cell) {
        Ok(tape) => tape,
        Err(e) => {
            eprintln!("bfx: could not map the tape: {}", e);
            return 1;
        }
    };

    let mut pending = String::new();
    loop {
        let prompt = if pending.is_empty() { "bfx> " } else { "...> " };
        eprint!("{}", prompt);

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return 0,
            Ok(_) => {}
        }
        pending.push_str(&line);

        let program = match compile(pending.as_bytes(), opt.opt_level) {
            Ok(program) => program,
            Err(e) if e.wants_more_input() => continue,
            Err(e) => {
                eprintln!("bfx: {}", e);
                pending.clear();
                continue;
            }
        };
        pending.clear();

        if let Err(e) = tape.grow_danger_zone(program.max_off()) {
            eprintln!("bfx: could not grow the danger zone: {}", e);
            return 1;
        }
        interpret_chunk::<C>(opt, &program, &mut tape);
        let _ = std::io::stdout().flush();
        eprintln!();
    }
}
