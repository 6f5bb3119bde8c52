use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::TempDir;

fn program(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("programs")
        .join(name)
}

fn stackvm(args: &[&str], stdin: &str) -> (String, String, bool) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_stackvm"))
        .args(args)
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to execute stackvm");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn assert_success(args: &[&str]) -> (String, String) {
    let (stdout, stderr, success) = stackvm(args, "");
    assert!(success, "stackvm {:?} should succeed, stderr:\n{}", args, stderr);
    (stdout, stderr)
}

fn write_source(dir: &TempDir, name: &str, source: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, source).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn test_run_source_prints_result() {
    let path = program("factorial.sasm");
    let (stdout, _) = assert_success(&["run", path.to_str().unwrap()]);
    assert_eq!(
        stdout,
        "1\n2\n6\n24\n120\n720\n5040\n40320\n362880\n3628800\nresult: 3628800\n"
    );
}

#[test]
fn test_all_jit_modes_agree() {
    let path = program("factorial.sasm");
    let path = path.to_str().unwrap();
    let (expected, _) = assert_success(&["run", path, "--jit", "off"]);
    for extra in [
        &["--jit", "on", "--jit-threshold", "2"][..],
        &["--jit", "always"][..],
        &["--jit", "always", "--no-inline"][..],
    ] {
        let mut args = vec!["run", path];
        args.extend_from_slice(extra);
        let (stdout, _) = assert_success(&args);
        assert_eq!(stdout, expected, "{:?}", extra);
    }
}

#[test]
fn test_assemble_then_run_binary() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("fact.svm");
    let source = program("factorial.sasm");
    assert_success(&[
        "asm",
        source.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
    ]);

    let bytes = std::fs::read(&output).unwrap();
    assert!(bytes.len() > 8);

    let (stdout, _) = assert_success(&["run", output.to_str().unwrap()]);
    assert!(stdout.ends_with("result: 3628800\n"), "{}", stdout);
}

#[test]
fn test_dump() {
    let path = program("globals.sasm");
    let (stdout, _) = assert_success(&["dump", path.to_str().unwrap()]);
    assert!(stdout.starts_with("; version"), "{}", stdout);
    assert!(stdout.contains(".func 0"), "{}", stdout);
    assert!(stdout.contains("store_global 0"), "{}", stdout);
}

#[test]
fn test_stdin_is_read() {
    let path = program("echo_sum.sasm");
    let (stdout, stderr, success) = stackvm(&["run", path.to_str().unwrap()], "1\n2\n3\n0\n");
    assert!(success, "{}", stderr);
    assert_eq!(stdout, "1\n2\n3\n6\nresult: 6\n");
}

#[test]
fn test_recursion_same_under_every_jit_mode() {
    let path = program("sum_rec.sasm");
    let path = path.to_str().unwrap();
    for extra in [&[][..], &["--jit", "off"][..], &["--jit", "always"][..]] {
        let mut args = vec!["run", path];
        args.extend_from_slice(extra);
        let (stdout, stderr, success) = stackvm(&args, "1000\n");
        assert!(success, "{:?}: {}", extra, stderr);
        assert_eq!(stdout, "result: 500500\n", "{:?}", extra);
    }

    // Past the default call depth limit every mode reports the same fault.
    for mode in ["off", "always"] {
        let (_, stderr, success) = stackvm(&["run", path, "--jit", mode], "5000\n");
        assert!(!success);
        assert!(stderr.contains("call stack overflow (limit 1024)"), "{}", stderr);
    }
}

#[test]
fn test_runtime_fault_exits_with_failure() {
    let path = program("fault_div.sasm");
    let (stdout, stderr, success) = stackvm(&["run", path.to_str().unwrap()], "");
    assert!(!success);
    assert!(stdout.is_empty(), "{}", stdout);
    assert!(stderr.contains("error:"), "{}", stderr);
    assert!(stderr.contains("division by zero"), "{}", stderr);
}

#[test]
fn test_bad_module_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, "junk.svm", "not a module at all");
    let (_, stderr, success) = stackvm(&["run", &path], "");
    assert!(!success);
    assert!(stderr.contains("invalid magic number"), "{}", stderr);
}

#[test]
fn test_assembler_error_reported() {
    let dir = TempDir::new().unwrap();
    let path = write_source(&dir, "bad.sasm", ".func main\n    frobnicate\n.end\n");
    let (_, stderr, success) = stackvm(&["run", &path], "");
    assert!(!success);
    assert!(stderr.starts_with("error:"), "{}", stderr);
    assert!(stderr.contains("bad.sasm"), "{}", stderr);
}

#[test]
fn test_stats_json() {
    let path = program("factorial.sasm");
    let (_, stderr) = assert_success(&[
        "run",
        path.to_str().unwrap(),
        "--jit",
        "always",
        "--stats=json",
    ]);
    let stats: serde_json::Value = serde_json::from_str(&stderr).unwrap();
    assert!(stats["gc"]["cycles"].is_u64());
    let jit = stats["jit"].as_array().unwrap();
    assert_eq!(jit.len(), 2);
    assert_eq!(jit[0]["compiled"], serde_json::Value::Bool(true));
    assert!(jit[0]["call_count"].as_u64().unwrap() >= 10);
}

#[test]
fn test_stats_human() {
    let path = program("factorial.sasm");
    let (_, stderr) = assert_success(&["run", path.to_str().unwrap(), "--stats"]);
    assert!(stderr.contains("[GC] cycles:"), "{}", stderr);
    assert!(stderr.contains("[JIT] fn 0:"), "{}", stderr);
}

#[test]
fn test_config_file_with_flag_override() {
    let dir = TempDir::new().unwrap();
    let config = write_source(&dir, "vm.toml", "jit_mode = \"always\"\ngc_stats = true\n");
    let path = program("factorial.sasm");
    let (stdout, stderr) = assert_success(&[
        "run",
        path.to_str().unwrap(),
        "--config",
        &config,
        "--jit",
        "off",
    ]);
    assert!(stdout.ends_with("result: 3628800\n"));
    assert!(stderr.contains("[GC] cycles:"), "{}", stderr);
    // The JIT never saw a call, so no function is reported.
    assert!(!stderr.contains("[JIT]"), "{}", stderr);
}

#[test]
fn test_missing_config_file() {
    let path = program("factorial.sasm");
    let (_, stderr, success) = stackvm(
        &["run", path.to_str().unwrap(), "--config", "/nonexistent/vm.toml"],
        "",
    );
    assert!(!success);
    assert!(stderr.contains("failed to read"), "{}", stderr);
}
