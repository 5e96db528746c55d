//! Rewrites the instruction stream, level by level.
//!
//! Each level consumes the output of the previous one and is a pure
//! function over the stream; none of them need bracket addresses, so the
//! pipeline runs before [crate::opcode::finalize].
//!
//! - level 1: merge adjacent arithmetic (`++++` becomes one `add`)
//! - level 2: clear loops (`[-]`) become `set 0`, and `add` folds into a
//!   preceding `set`
//! - level 3: balanced multiply loops become `mac` chains
//! - level 4: `move`s dissolve into per-instruction cell offsets

use crate::opcode::{Instruction, Op};

/// Applies every optimization up to and including `level` (0..=4).
pub fn optimize(program: &[Instruction], level: u8) -> Vec<Instruction> {
    let mut program = program.to_vec();
    if level >= 1 {
        program = fold_constants(&program);
    }
    if level >= 2 {
        program = fold_clear_loops(&program);
    }
    if level >= 3 {
        program = fold_multiply_loops(&program);
    }
    if level >= 4 {
        program = fold_moves(&program);
    }
    program
}

/// Level 1: merge adjacent same-kind arithmetic.
///
/// Zero-valued results are preserved; later passes do not depend on their
/// removal.
fn fold_constants(program: &[Instruction]) -> Vec<Instruction> {
    let mut out: Vec<Instruction> = Vec::with_capacity(program.len());

    for &ins in program {
        let merged = match (out.last(), ins.op) {
            (Some(last), Op::Add(y)) if last.off == ins.off => match last.op {
                Op::Add(x) => Some(Op::Add(x.wrapping_add(y))),
                _ => None,
            },
            (Some(last), Op::Move(y)) => match last.op {
                Op::Move(x) => Some(Op::Move(x.wrapping_add(y))),
                _ => None,
            },
            _ => None,
        };

        match merged {
            Some(op) => out.last_mut().unwrap().op = op,
            None => out.push(ins),
        }
    }

    out
}

/// Level 2: `[-]` becomes `set 0`, and an `add` directly after a `set` at
/// the same cell folds into the `set`.
fn fold_clear_loops(program: &[Instruction]) -> Vec<Instruction> {
    let mut out: Vec<Instruction> = Vec::with_capacity(program.len());
    let mut i = 0;

    while i < program.len() {
        let ins = program[i];

        if is_clear_loop(&program[i..]) {
            push_or_merge(&mut out, Instruction::at(ins.off, Op::Set(0)));
            i += 3;
            continue;
        }

        push_or_merge(&mut out, ins);
        i += 1;
    }

    out
}

fn is_clear_loop(window: &[Instruction]) -> bool {
    match window {
        [open, body, close, ..] => {
            matches!(open.op, Op::JumpForward(_))
                && body.op == Op::Add(-1)
                && body.off == open.off
                && matches!(close.op, Op::JumpBack(_))
                && close.off == open.off
        }
        _ => false,
    }
}

fn push_or_merge(out: &mut Vec<Instruction>, ins: Instruction) {
    if let Op::Add(v) = ins.op {
        if let Some(last) = out.last_mut() {
            if last.off == ins.off {
                if let Op::Set(s) = last.op {
                    last.op = Op::Set(s.wrapping_add(v));
                    return;
                }
            }
        }
    }
    out.push(ins);
}

/// Level 3: rewrite balanced decrement loops as multiply-accumulates.
///
/// A loop qualifies when its body is non-empty, contains only `add` and
/// `move`, returns to its entry cell, and applies a net `-1` to it. Each
/// add at a non-zero move balance becomes one `mac` keyed by that balance;
/// entry-cell adds are absorbed by the final `set 0`.
fn fold_multiply_loops(program: &[Instruction]) -> Vec<Instruction> {
    let mut out: Vec<Instruction> = Vec::with_capacity(program.len());
    let mut i = 0;

    while i < program.len() {
        if matches!(program[i].op, Op::JumpForward(_)) {
            if let Some((rewritten, consumed)) = try_fold_loop(&program[i..]) {
                out.extend(rewritten);
                i += consumed;
                continue;
            }
        }
        out.push(program[i]);
        i += 1;
    }

    out
}

fn try_fold_loop(window: &[Instruction]) -> Option<(Vec<Instruction>, usize)> {
    let entry = window[0];
    let mut balance: i64 = 0;
    let mut entry_delta: i64 = 0;
    let mut macs: Vec<(i64, i64)> = Vec::new();

    let mut j = 1;
    loop {
        match window.get(j)?.op {
            Op::Add(v) => {
                if balance == 0 {
                    entry_delta = entry_delta.wrapping_add(v);
                } else {
                    macs.push((balance, v));
                }
            }
            Op::Move(v) => balance += v,
            Op::JumpBack(_) => break,
            // Anything else (I/O, set, mac, a nested loop) disables the
            // rewrite for this loop.
            _ => return None,
        }
        j += 1;
    }

    if balance != 0 || entry_delta != -1 || j == 1 {
        return None;
    }

    let mut rewritten: Vec<Instruction> = macs
        .into_iter()
        .map(|(offset, multiplier)| {
            Instruction::at(
                entry.off,
                Op::Mac {
                    offset,
                    multiplier,
                },
            )
        })
        .collect();
    rewritten.push(Instruction::at(entry.off, Op::Set(0)));

    Some((rewritten, j + 1))
}

/// Level 4: fold `move`s into the `off` field of the instructions around
/// them.
///
/// Brackets delimit offset scopes: a loop body that ends at a different
/// balance than it started gets one explicit `move` before the closing
/// bracket, and a nonzero residual offset at the end of the stream gets one
/// trailing `move`.
fn fold_moves(program: &[Instruction]) -> Vec<Instruction> {
    let mut out: Vec<Instruction> = Vec::with_capacity(program.len());
    let mut offset: i64 = 0;
    let mut scopes: Vec<i64> = Vec::new();

    for &ins in program {
        match ins.op {
            Op::Move(v) => offset += v,
            Op::JumpForward(_) => {
                scopes.push(offset);
                out.push(Instruction::at(ins.off + offset, Op::JumpForward(0)));
            }
            Op::JumpBack(_) => {
                // An unmatched `]` is reported by finalize; treat its scope
                // as starting at zero so the pass stays total.
                let start = scopes.pop().unwrap_or(0);
                if offset != start {
                    out.push(Instruction::here(Op::Move(offset - start)));
                    offset = start;
                }
                out.push(Instruction::at(ins.off + start, Op::JumpBack(0)));
            }
            Op::Mac {
                offset: target,
                multiplier,
            } => out.push(Instruction::at(
                ins.off + offset,
                Op::Mac {
                    offset: target + offset,
                    multiplier,
                },
            )),
            op => out.push(Instruction::at(ins.off + offset, op)),
        }
    }

    if offset != 0 {
        out.push(Instruction::here(Op::Move(offset)));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse;

    fn ops(program: &[Instruction]) -> Vec<Op> {
        program.iter().map(|i| i.op).collect()
    }

    #[test]
    fn level_1_merges_runs() {
        let program = optimize(&parse(b"+++-->><"), 1);
        assert_eq!(ops(&program), vec![Op::Add(1), Op::Move(1)]);
    }

    #[test]
    fn level_1_keeps_zero_results() {
        let program = optimize(&parse(b"+-><"), 1);
        assert_eq!(ops(&program), vec![Op::Add(0), Op::Move(0)]);
    }

    #[test]
    fn level_2_rewrites_clear_loops() {
        let program = optimize(&parse(b"[-]"), 2);
        assert_eq!(ops(&program), vec![Op::Set(0)]);
    }

    #[test]
    fn level_2_merges_add_into_set() {
        let program = optimize(&parse(b"[-]+++++"), 2);
        assert_eq!(ops(&program), vec![Op::Set(5)]);
    }

    #[test]
    fn level_3_rewrites_transfer_loops() {
        // [->+<] moves the entry cell one to the right
        let program = optimize(&parse(b"[->+<]"), 3);
        assert_eq!(
            ops(&program),
            vec![
                Op::Mac {
                    offset: 1,
                    multiplier: 1
                },
                Op::Set(0)
            ]
        );
    }

    #[test]
    fn level_3_emits_one_mac_per_add() {
        // [->++>+++<<] at level 1 collapses the adds first
        let program = optimize(&parse(b"[->++>+++<<]"), 3);
        assert_eq!(
            ops(&program),
            vec![
                Op::Mac {
                    offset: 1,
                    multiplier: 2
                },
                Op::Mac {
                    offset: 2,
                    multiplier: 3
                },
                Op::Set(0)
            ]
        );
    }

    #[test]
    fn level_3_requires_balanced_moves() {
        let program = optimize(&parse(b"[->+]"), 3);
        assert!(program.iter().any(|i| matches!(i.op, Op::JumpForward(_))));
    }

    #[test]
    fn level_3_requires_minus_one_entry_delta() {
        let program = optimize(&parse(b"[-->+<]"), 3);
        assert!(program.iter().any(|i| matches!(i.op, Op::JumpForward(_))));
    }

    #[test]
    fn level_3_is_disabled_by_io() {
        let program = optimize(&parse(b"[-.>+<]"), 3);
        assert!(program.iter().any(|i| matches!(i.op, Op::Print)));
        assert!(program.iter().any(|i| matches!(i.op, Op::JumpForward(_))));
    }

    #[test]
    fn level_3_skips_empty_loops() {
        let program = optimize(&parse(b"[]"), 3);
        assert!(matches!(program[0].op, Op::JumpForward(_)));
    }

    #[test]
    fn level_3_reaches_inner_loops() {
        // outer loop is disqualified (contains a bracket), inner is not
        let program = optimize(&parse(b"[.[->+<]]"), 3);
        assert!(program.iter().any(|i| matches!(
            i.op,
            Op::Mac {
                offset: 1,
                multiplier: 1
            }
        )));
    }

    #[test]
    fn level_4_folds_moves_into_offsets() {
        let program = optimize(&parse(b">+>++<."), 4);
        assert_eq!(
            ops(&program),
            vec![Op::Add(1), Op::Add(2), Op::Print, Op::Move(1)]
        );
        let offs: Vec<i64> = program.iter().map(|i| i.off).collect();
        assert_eq!(offs, vec![1, 2, 1, 0]);
    }

    #[test]
    fn level_4_scopes_offsets_at_brackets() {
        // The loop body ends one cell right of where it started, so an
        // explicit move is emitted before the back bracket.
        let program = optimize(&parse(b"[.>]"), 4);
        assert_eq!(
            ops(&program),
            vec![
                Op::JumpForward(0),
                Op::Print,
                Op::Move(1),
                Op::JumpBack(0)
            ]
        );
        assert_eq!(program[0].off, 0);
        assert_eq!(program[3].off, 0);
    }

    #[test]
    fn level_4_offsets_mac_targets() {
        // level 3 dissolves the loop; level 4 then folds the leading move
        // into both the mac's source and its target.
        let program = optimize(&parse(b">[->+<]"), 4);
        assert_eq!(
            ops(&program),
            vec![
                Op::Mac {
                    offset: 2,
                    multiplier: 1
                },
                Op::Set(0),
                Op::Move(1)
            ]
        );
        assert_eq!(program[0].off, 1);
        assert_eq!(program[1].off, 1);
    }

    #[test]
    fn level_0_is_identity() {
        let parsed = parse(b"+[->+<].");
        assert_eq!(optimize(&parsed, 0), parsed);
    }
}
