//! End-to-end scenarios, run at every optimization level.

use bfx_core::interp::{self, RunStatus};
use bfx_core::io::BufferedIo;
use bfx_core::tape::Tape;
use bfx_core::{compile, Cell};

fn run_at_level<C: Cell>(
    source: &[u8],
    input: &[u8],
    level: u8,
    fuel: Option<u64>,
) -> (RunStatus, Vec<u8>, Vec<C>, i64) {
    let program = compile(source, level).expect("program should compile");
    let mut tape: Tape<C> = Tape::new(256, 0).expect("tape should map");
    tape.grow_danger_zone(program.max_off())
        .expect("danger zone should grow");

    let mut io = BufferedIo::new(input, 0);
    let status = interp::run(program.instructions(), &mut tape, &mut io, fuel, None);

    let cells = tape.cells()[..16].to_vec();
    (status, io.output, cells, tape.cell_index())
}

fn check_all_levels(source: &[u8], input: &[u8], output: &[u8], cells: &[(usize, u8)]) {
    for level in 0..=4 {
        let (status, got, tape, _) = run_at_level::<u8>(source, input, level, None);
        assert_eq!(status, RunStatus::Completed, "level {}", level);
        assert_eq!(got, output, "level {} output for {:?}", level, source);
        for &(index, value) in cells {
            assert_eq!(
                tape[index], value,
                "level {} cell {} for {:?}",
                level, index, source
            );
        }
    }
}

#[test]
fn scenario_uppercase_a() {
    check_all_levels(b"++++++++[>++++++++<-]>+.", b"", b"A", &[(0, 0), (1, 65)]);
}

#[test]
fn scenario_cat() {
    // EOF hands back the configured byte (0 here), which ends the loop.
    check_all_levels(b",[.,]", b"hi\n", b"hi\n", &[(0, 0)]);
}

#[test]
fn scenario_clear_then_five() {
    check_all_levels(b"+[-]+++++.", b"", &[0x05], &[(0, 5)]);
}

#[test]
fn scenario_transfer_loop() {
    check_all_levels(b">+<[->+<]>.", b"", &[0x01], &[(0, 0), (1, 1)]);
}

#[test]
fn scenario_add_two_values() {
    check_all_levels(b"++>+++[<+>-]<.", b"", &[0x05], &[(0, 5), (1, 0)]);
}

#[test]
fn scenario_infinite_loop_exhausts_budget() {
    for level in 0..=4 {
        let (status, output, _, _) = run_at_level::<u8>(b"+[]", b"", level, Some(100_000));
        assert_eq!(status, RunStatus::OutOfFuel, "level {}", level);
        assert!(output.is_empty());
    }
}

#[test]
fn final_pointer_survives_the_run() {
    let (_, _, _, index) = run_at_level::<u8>(b">>>>", b"", 4, None);
    assert_eq!(index, 4);
}

#[test]
fn scenarios_agree_across_cell_widths() {
    for level in 0..=4 {
        let (_, out8, _, _) = run_at_level::<u8>(b"++++++++[>++++++++<-]>+.", b"", level, None);
        let (_, out16, _, _) = run_at_level::<u16>(b"++++++++[>++++++++<-]>+.", b"", level, None);
        let (_, out64, _, _) = run_at_level::<u64>(b"++++++++[>++++++++<-]>+.", b"", level, None);
        assert_eq!(out8, b"A");
        assert_eq!(out16, b"A");
        assert_eq!(out64, b"A");
    }
}

#[test]
fn wrapping_differs_by_width_where_it_should() {
    // 8-bit wraps 255+1 to 0; 16-bit holds 256.
    let source = b"-+";
    let (_, _, cells8, _) = run_at_level::<u8>(source, b"", 1, None);
    assert_eq!(cells8[0], 0);

    let program = compile(b"-", 0).unwrap();
    let mut tape: Tape<u16> = Tape::new(64, 0).unwrap();
    let mut io = BufferedIo::new(b"", 0);
    interp::run(program.instructions(), &mut tape, &mut io, None, None);
    assert_eq!(tape.cells()[0], 0xFFFF);
}

// In-process JIT coverage for programs that do not touch the I/O shims:
// the tape contents and the returned cell pointer are compared against the
// interpreter's. The same suite is instantiated once per native back-end,
// gated on the host that can actually run it.
#[allow(unused_macros)]
macro_rules! jit_round_trip_suite {
    () => {
    use super::*;
    use bfx_core::jit;

    fn jit_vs_interp<C: Cell>(source: &[u8], level: u8) {
        let program = compile(source, level).expect("program should compile");

        let mut jit_tape: Tape<C> = Tape::new(256, 0).unwrap();
        jit_tape.grow_danger_zone(program.max_off()).unwrap();
        jit::run(program.instructions(), &mut jit_tape).expect("jit should run");

        let mut interp_tape: Tape<C> = Tape::new(256, 0).unwrap();
        interp_tape.grow_danger_zone(program.max_off()).unwrap();
        let mut io = BufferedIo::new(b"", 0);
        interp::run(
            program.instructions(),
            &mut interp_tape,
            &mut io,
            None,
            None,
        );

        assert_eq!(
            jit_tape.cells(),
            interp_tape.cells(),
            "level {} tape for {:?}",
            level,
            source
        );
        assert_eq!(
            jit_tape.cell_index(),
            interp_tape.cell_index(),
            "level {} pointer for {:?}",
            level,
            source
        );
    }

    #[test]
    fn straightline_and_loops() {
        for level in 0..=4 {
            jit_vs_interp::<u8>(b"++++++++[>++++++++<-]>+", level);
            jit_vs_interp::<u8>(b">+<[->+<]>", level);
            jit_vs_interp::<u8>(b"++>+++[<+>-]<", level);
            jit_vs_interp::<u8>(b"+[-]+++++", level);
        }
    }

    #[test]
    fn multiply_loops_with_nonunit_factors() {
        for level in 0..=4 {
            jit_vs_interp::<u8>(b"+++[->+++++<]>", level);
            jit_vs_interp::<u8>(b"+++[->-----<]", level);
        }
    }

    #[test]
    fn every_cell_width() {
        for level in 0..=4 {
            jit_vs_interp::<u8>(b"+++[->++<]", level);
            jit_vs_interp::<u16>(b"+++[->++<]", level);
            jit_vs_interp::<u32>(b"+++[->++<]", level);
            jit_vs_interp::<u64>(b"+++[->++<]", level);
        }
    }

    #[test]
    fn byte_cells_wrap_through_the_loop_counter() {
        // 254 iterations on an 8-bit cell; wider cells would loop for ages.
        for level in 0..=4 {
            jit_vs_interp::<u8>(b"--[->++<]", level);
        }
    }

    #[test]
    fn offset_heavy_streams_after_level_4() {
        jit_vs_interp::<u8>(b">>>>>+<<+>>>-<<<<<+>", 4);
        jit_vs_interp::<u32>(b">>>>>+<<+>>>-<<<<<+>", 4);
    }
    };
}

/// Scenarios under the x86-64 JIT (when the host supports it).
#[cfg(target_arch = "x86_64")]
mod jit_round_trip_x64 {
    jit_round_trip_suite!();
}

/// Scenarios under the RV64 JIT (when the host supports it).
#[cfg(target_arch = "riscv64")]
mod jit_round_trip_rv64 {
    jit_round_trip_suite!();
}
