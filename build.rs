// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::process::Command;

fn main() {
    let mut version = env!("CARGO_PKG_VERSION").to_string();

    // Prefer the exact revision when building from a git checkout.
    if let Ok(git_out) = Command::new("git").args(["describe", "--dirty"]).output() {
        if git_out.status.success() {
            if let Ok(git_out_str) = String::from_utf8(git_out.stdout) {
                version = git_out_str.trim().to_string();
            }
        }
    }

    // This println!() has a special behavior, as it will set the environment
    // variable BUILT_VERSION, so that it can be reused from the binary.
    // Particularly, this is used from src/main.rs to display the exact
    // version.
    println!("cargo:rustc-env=BUILT_VERSION={version}");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
