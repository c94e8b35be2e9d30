//! Command-line behaviour of the `mri-pipe` binary
//!
//! Tests:
//! - Invalid `[execution]` values fail before the measurements root is read
//! - `bids-sources` lists discovered BIDS files as JSON

mod helpers;

use helpers::touch;
use serde_json::Value;
use std::process::{Command, Output};
use tempfile::TempDir;

fn run_with_config(config: &str, args: &[&str]) -> (TempDir, Output) {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("mri-pipe.toml");
    std::fs::write(&config_path, config).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_mri-pipe"))
        .env_remove("RUST_LOG")
        .env_remove("MRI_PIPE_CONFIG")
        .env_remove("MRI_PIPE_MEASUREMENTS_ROOT")
        .arg("--config")
        .arg(&config_path)
        .args(args)
        .output()
        .unwrap();
    (dir, output)
}

#[test]
fn test_bad_ambiguity_fails_before_catalog() {
    let missing_root = "/nonexistent/mri-pipe/measurements";
    let (_dir, output) = run_with_config(
        "[execution]\nambiguity = \"bogus\"\n",
        &[
            "preprocess",
            missing_root,
            "--lite",
            "--functional-scan-types",
            "EPI_CBV_alej",
        ],
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid [execution] configuration"), "{}", stderr);
    assert!(stderr.contains("bogus"), "{}", stderr);
    assert!(!stderr.contains("Failed to catalog"), "{}", stderr);
}

#[test]
fn test_bad_plugin_fails_level1_before_catalog() {
    let (_dir, output) = run_with_config(
        "[execution]\nplugin = \"Threads\"\n",
        &[
            "level1",
            "/nonexistent/mri-pipe/measurements",
            "--template",
            "/templates/template.nii.gz",
        ],
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Threads"), "{}", stderr);
    assert!(!stderr.contains("Failed to catalog"), "{}", stderr);
}

#[test]
fn test_zero_n_procs_fails_level2_before_search() {
    let (_dir, output) = run_with_config(
        "",
        &[
            "level2",
            "/nonexistent/mri-pipe/level1",
            "--categories",
            "ERC_ofM",
            "--participants",
            "5502",
            "--mask",
            "/templates/mask.nii.gz",
            "--n-procs",
            "0",
        ],
    );

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("n_procs must be at least 1"), "{}", stderr);
    assert!(!stderr.contains("Failed to collect"), "{}", stderr);
}

#[test]
fn test_bids_sources_lists_sessions() {
    let bids = TempDir::new().unwrap();
    for (subject, session) in [("5502", "ofM"), ("5503", "ofM"), ("5502", "ofMaF")] {
        touch(&bids.path().join(format!(
            "sub-{subject}/ses-{session}/func/sub-{subject}_ses-{session}_trial-EPI_CBV_alej.nii.gz"
        )));
    }

    let bids_dir = bids.path().to_string_lossy().into_owned();
    let (_dir, output) = run_with_config("", &["bids-sources", "--bids-dir", &bids_dir, "--group-by", "session"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let listing: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listing["substitutions"].as_array().unwrap().len(), 3);
    assert_eq!(listing["substitutions"][0]["subject"], "5502");
    let sources = listing["sources"].as_array().unwrap();
    assert_eq!(sources.len(), 2);
    assert!(sources[1].as_str().unwrap().ends_with("ses-ofMaF/func/sub-*_ses-ofMaF_trial-*.nii.gz"));
}
