//! Integration tests for the `attachpdf` binary.
//!
//! These tests invoke the compiled binary directly via `std::process::Command`.

mod common;

use std::path::Path;
use std::process::{Command, Output};

fn attachpdf_bin() -> &'static str {
    env!("CARGO_BIN_EXE_attachpdf")
}

fn run<S: AsRef<std::ffi::OsStr>>(args: &[S]) -> Output {
    Command::new(attachpdf_bin())
        .args(args)
        .output()
        .expect("failed to run attachpdf")
}

fn write_inputs(dir: &Path) -> (String, String, String) {
    let input = dir.join("in.pdf");
    let attached = dir.join("data.xml");
    std::fs::write(&input, common::minimal_pdf()).unwrap();
    std::fs::write(&attached, b"<root/>").unwrap();
    let output = dir.join("out.pdf");
    (
        input.display().to_string(),
        attached.display().to_string(),
        output.display().to_string(),
    )
}

#[test]
fn wrong_argument_count_prints_usage() {
    let dir = tempfile::tempdir().unwrap();
    let (input, attached, output) = write_inputs(dir.path());

    let (input, attached, output) = (input.as_str(), attached.as_str(), output.as_str());
    let cases: Vec<Vec<&str>> = vec![
        vec![],
        vec![input],
        vec![input, attached],
        vec![input, attached, output, "extra"],
    ];
    for args in cases {
        let out = run(&args);
        assert_eq!(out.status.code(), Some(2), "args: {args:?}");
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(stderr.contains("usage:"), "stderr: {stderr}");
        assert!(out.stdout.is_empty());
        assert!(!Path::new(output).exists());
    }
}

#[test]
fn attaches_file_and_reports_summary() {
    let dir = tempfile::tempdir().unwrap();
    let (input, attached, output) = write_inputs(dir.path());

    let out = run(&[&input, &attached, &output]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(stdout.lines().count(), 1);
    assert!(stdout.contains("data.xml"), "stdout: {stdout}");

    let bytes = std::fs::read(&output).unwrap();
    assert_eq!(
        common::lopdf_attachments(&bytes),
        vec![(b"data.xml".to_vec(), b"<root/>".to_vec())]
    );
}

#[test]
fn missing_input_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let (_, attached, output) = write_inputs(dir.path());
    let missing = dir.path().join("missing.pdf").display().to_string();

    let out = run(&[&missing, &attached, &output]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).starts_with("error:"));
    assert!(!Path::new(&output).exists());
}

#[test]
fn missing_attachment_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let (input, _, output) = write_inputs(dir.path());
    let missing = dir.path().join("nothing.bin").display().to_string();

    let out = run(&[&input, &missing, &output]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!Path::new(&output).exists());
}

#[test]
fn malformed_input_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let (input, attached, output) = write_inputs(dir.path());
    std::fs::write(&input, b"definitely not a pdf").unwrap();

    let out = run(&[&input, &attached, &output]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("malformed PDF"));
    assert!(!Path::new(&output).exists());
}
