//! Build script for mri-pipe
//!
//! Stamps the planner commit into the binary; every exported plan records
//! it in its `generator` field, next to the build date shown at startup.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../.git/HEAD");
    println!("cargo:rerun-if-changed=../.git/index");

    // e.g. 3f2a9c1d or 3f2a9c1d-dirty; source tarballs have no .git
    let commit = Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=8"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let build_date = chrono::Utc::now().format("%Y-%m-%d").to_string();

    println!("cargo:rustc-env=MRI_PIPE_COMMIT={}", commit);
    println!("cargo:rustc-env=MRI_PIPE_BUILD_DATE={}", build_date);
}
