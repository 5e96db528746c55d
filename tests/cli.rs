//! Black-box tests against the `bfx` binary.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

fn bfx() -> Command {
    Command::new(env!("CARGO_BIN_EXE_bfx"))
}

fn program_file(name: &str, source: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("bfx-cli-{}-{}.b", std::process::id(), name));
    std::fs::write(&path, source).unwrap();
    path
}

fn run_with_stdin(mut cmd: Command, input: &[u8]) -> Output {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.as_mut().unwrap().write_all(input).unwrap();
    child.wait_with_output().unwrap()
}

#[test]
fn prints_uppercase_a_at_every_level() {
    let path = program_file("hello-a", "++++++++[>++++++++<-]>+.");
    for level in 0..=4 {
        for interpret in [false, true] {
            let mut cmd = bfx();
            cmd.arg(&path).arg("-O").arg(level.to_string());
            if interpret {
                cmd.arg("--interpret");
            }
            let out = run_with_stdin(cmd, b"");
            assert!(out.status.success(), "level {}: {:?}", level, out);
            assert_eq!(out.stdout, b"A", "level {} interpret={}", level, interpret);
        }
    }
}

#[test]
fn cat_round_trips_stdin() {
    let path = program_file("cat", ",[.,]");
    for interpret in [false, true] {
        let mut cmd = bfx();
        cmd.arg(&path);
        if interpret {
            cmd.arg("--interpret");
        }
        let out = run_with_stdin(cmd, b"hi\n");
        assert!(out.status.success());
        assert_eq!(out.stdout, b"hi\n");
    }
}

#[test]
fn eof_byte_is_configurable() {
    let path = program_file("eof", ",.");
    let mut cmd = bfx();
    cmd.arg(&path).arg("--eof-byte").arg("65").arg("--interpret");
    let out = run_with_stdin(cmd, b"");
    assert!(out.status.success());
    assert_eq!(out.stdout, b"A");
}

#[test]
fn budget_exhaustion_exits_cleanly() {
    let path = program_file("spin", "+[]");
    let mut cmd = bfx();
    cmd.arg(&path).arg("--budget").arg("10000");
    let out = run_with_stdin(cmd, b"");
    assert!(out.status.success(), "{:?}", out);
    assert!(String::from_utf8_lossy(&out.stderr).contains("budget"));
}

#[test]
fn stray_close_bracket_is_fatal_in_batch_mode() {
    let path = program_file("stray", "][");
    let mut cmd = bfx();
    cmd.arg(&path);
    let out = run_with_stdin(cmd, b"");
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("']'"));
}

#[test]
fn tape_overrun_is_a_controlled_exit() {
    // Marches right forever; the danger zone catches it.
    let path = program_file("runaway", "+[>+]");
    for interpret in [false, true] {
        let mut cmd = bfx();
        cmd.arg(&path).arg("--tape-size").arg("4096");
        if interpret {
            cmd.arg("--interpret");
        }
        let out = run_with_stdin(cmd, b"");
        assert_eq!(out.status.code(), Some(1), "interpret={}", interpret);
        assert!(
            String::from_utf8_lossy(&out.stderr).contains("Reached end of tape"),
            "interpret={} stderr={:?}",
            interpret,
            out.stderr
        );
    }
}

#[test]
fn dump_ir_shows_the_optimized_stream() {
    let path = program_file("dump", "+++[->+<]");
    let mut cmd = bfx();
    cmd.arg(&path).arg("-O").arg("4").arg("--dump-ir");
    let out = run_with_stdin(cmd, b"");
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("mac"), "{}", text);
    assert!(text.contains("set"), "{}", text);
}

#[test]
fn profile_dump_lands_on_stderr() {
    let path = program_file("profiled", "+++.");
    let mut cmd = bfx();
    cmd.arg(&path).arg("--profile");
    let out = run_with_stdin(cmd, b"");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("cells touched"));
}

#[test]
fn repl_runs_chunks_and_asks_for_continuations() {
    // First chunk is incomplete; the bracket closes on the second line.
    let out = run_with_stdin(bfx(), b"+++++.\n[[\n-]]\n");
    assert!(out.status.success(), "{:?}", out);
    assert_eq!(out.stdout, &[0x05]);
    let prompts = String::from_utf8_lossy(&out.stderr);
    assert!(prompts.contains("bfx>"));
    assert!(prompts.contains("...>"));
}

#[test]
fn repl_warns_on_stray_close_and_keeps_going() {
    let out = run_with_stdin(bfx(), b"][\n++.\n");
    assert!(out.status.success());
    assert_eq!(out.stdout, &[0x02]);
    assert!(String::from_utf8_lossy(&out.stderr).contains("']'"));
}
