// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::process::{Command, Output};

use serde_json::Value;

fn pds_dirty(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_pds-dirty"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Expect to run pds-dirty")
}

fn json_rounds(output: &Output) -> Vec<Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).expect("Expect one JSON table per line"))
        .collect()
}

#[test]
fn test_cli_reports_writes_once() {
    let output = pds_dirty(&[
        "--range",
        "start=0x100000,size=4M",
        "--write",
        "iova=0x100000,size=8K",
        "--write",
        "iova=0x300010,size=8",
        "--window",
        "256K",
        "--max-segment",
        "4K",
        "--json",
    ]);
    assert!(output.status.success());

    let rounds = json_rounds(&output);
    assert_eq!(rounds.len(), 2);
    assert_eq!(
        rounds[0],
        serde_json::json!({
            "data": [
                { "gpa": 0x100000, "length": 0x2000 },
                { "gpa": 0x300000, "length": 0x1000 }
            ]
        })
    );
    assert_eq!(rounds[1], serde_json::json!({ "data": [] }));
}

#[test]
fn test_cli_coalesces_ranges() {
    let output = pds_dirty(&[
        "--range",
        "start=0,size=4K",
        "--range",
        "start=8K,size=4K",
        "--write",
        "iova=4K,size=1",
        "--rounds",
        "1",
        "--json",
    ]);
    assert!(output.status.success());

    let rounds = json_rounds(&output);
    assert_eq!(
        rounds,
        vec![serde_json::json!({ "data": [{ "gpa": 4096, "length": 4096 }] })]
    );
}

#[test]
fn test_cli_text_output() {
    let output = pds_dirty(&[
        "--range",
        "start=0,size=64K",
        "--write",
        "iova=0x2000,size=0x2000",
        "--rounds",
        "1",
    ]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("round 0: 1 dirty ranges, 8192 bytes"));
    assert!(stdout.contains("0x2000-0x4000"));
}

#[test]
fn test_cli_rejects_bad_parameters() {
    for args in [
        vec!["--range", "start=0"],
        vec!["--range", "start=0,size=1M", "--page-size", "3000"],
        vec!["--range", "start=0,size=1M", "--window", "4K"],
        vec!["--range", "start=0,size=1M", "--write", "iova=0"],
    ] {
        let output = pds_dirty(&args);
        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("Error: pds-dirty exited with the following"));
    }

    // Missing --range is caught by the argument parser.
    assert!(!pds_dirty(&["--json"]).status.success());
}
