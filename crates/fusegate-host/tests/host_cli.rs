// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(clippy::disallowed_methods)]

use std::io::Write;
use std::process::Command;

fn host() -> Command {
    Command::new(env!("CARGO_BIN_EXE_fusegate-host"))
}

#[test]
fn help_lists_the_sample_filesystems() {
    // Running with --help should not attempt a mount and must succeed
    let output = host().arg("--help").output().expect("able to execute fusegate-host");
    assert!(output.status.success(), "--help should succeed");

    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("--fs"));
    assert!(help.contains("--seed"));
    assert!(help.contains("--log-level"));
}

#[test]
fn unknown_filesystem_is_rejected() {
    let output = host().args(["/tmp/fusegate-cli", "--fs", "ntfs"]).output().expect("able to execute fusegate-host");
    assert!(!output.status.success());
}

#[test]
fn malformed_seed_fails_before_mounting() {
    let mut seed = tempfile::NamedTempFile::new().unwrap();
    write!(seed, "[1, 2, 3]").unwrap();
    let mount_point = tempfile::tempdir().unwrap();

    let output = host()
        .arg(mount_point.path())
        .arg("--seed")
        .arg(seed.path())
        .output()
        .expect("able to execute fusegate-host");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("top level must be an object"), "stderr: {stderr}");
}

#[test]
fn mirrorfs_source_must_be_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");

    let output = host()
        .arg(dir.path())
        .args(["--fs", "mirrorfs", "--source"])
        .arg(&missing)
        .output()
        .expect("able to execute fusegate-host");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot mirror"), "stderr: {stderr}");
}
