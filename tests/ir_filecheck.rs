//! FileCheck-style tests for the IR files under tests/ir.
//!
//! Every `.ir` file is run through the driver once per `RUN:` line and the report is matched
//! against its `CHECK` directives.

use irjit::filecheck::{TestRunner, TestSpec};
use std::fs;
use std::path::{Path, PathBuf};

fn ir_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("ir")
}

/// Discovers all .ir files in a directory recursively
fn discover_ir_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(discover_ir_files(&path));
            } else if path.extension().and_then(|s| s.to_str()) == Some("ir") {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}

fn run_file(path: &Path) -> Result<(), String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let spec = TestSpec::parse(&content)?;
    TestRunner::new(false).run_test(&spec)
}

fn run_filecheck_test(relative: &str) {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = ir_dir().join(relative);
    run_file(&path).unwrap_or_else(|e| panic!("{} failed: {}", relative, e));
}

#[test]
fn test_all_ir_files() {
    let _ = env_logger::builder().is_test(true).try_init();
    let files = discover_ir_files(&ir_dir());
    assert!(!files.is_empty(), "no .ir files found under {}", ir_dir().display());

    let failures: Vec<String> = files
        .iter()
        .filter_map(|path| run_file(path).err().map(|e| format!("{}: {}", path.display(), e)))
        .collect();

    assert!(
        failures.is_empty(),
        "{} of {} files failed:\n{}",
        failures.len(),
        files.len(),
        failures.join("\n\n")
    );
}

#[test]
fn test_add_const_store_filecheck() {
    run_filecheck_test("interpret/add_const_store.ir");
}

#[test]
fn test_conditional_exit_filecheck() {
    run_filecheck_test("interpret/conditional_exit.ir");
}

#[test]
fn test_const_prop_filecheck() {
    run_filecheck_test("passes/const_prop.ir");
}

#[test]
fn test_purge_temps_filecheck() {
    run_filecheck_test("passes/purge_temps.ir");
}

#[test]
fn test_arm64_summary_filecheck() {
    run_filecheck_test("codegen/arm64_summary.ir");
}

#[test]
fn test_missing_check_fails() {
    let spec = TestSpec::parse(
        "; RUN: irjit %s --interpret\n\
         ; CHECK: exit 0x00000000 -> 0x00000999\n\
         ExitToConst 0x10\n",
    )
    .unwrap();
    let err = TestRunner::new(false).run_test(&spec).unwrap_err();
    assert!(err.contains("not found"), "{}", err);
}

#[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
#[test]
fn test_native_run_matches_interpreter_report() {
    let source = fs::read_to_string(ir_dir().join("interpret/add_const_store.ir")).unwrap();
    let native = source.replace("--interpret", "--run");
    let spec = TestSpec::parse(&native).unwrap();
    TestRunner::new(false)
        .run_test(&spec)
        .unwrap_or_else(|e| panic!("native run failed: {}", e));
}
