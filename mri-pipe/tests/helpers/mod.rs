//! Synthetic Bruker measurement trees
//!
//! Each measurement directory gets the marker files, a `subject` parameter
//! file and numbered scan directories with `visu_pars`, `acqp` and `method`.

#![allow(dead_code)]

use mri_pipe::catalog::{ScanCategory, ScanClassification};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One scan directory: (number, protocol name)
pub type ScanSpec<'a> = (u32, &'a str);

fn parameter_string(key: &str, value: &str) -> String {
    format!("##${}=( 64 )\n<{}>\n", key, value)
}

/// Write one measurement directory below `root`
pub fn write_measurement(
    root: &Path,
    name: &str,
    subject: &str,
    condition: &str,
    scans: &[ScanSpec<'_>],
) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();

    let subject_file = format!(
        "##TITLE=Parameter List\n$$ ParaVision subject file\n{}{}##END=\n",
        parameter_string("SUBJECT_id", subject),
        parameter_string("SUBJECT_study_name", condition)
    );
    fs::write(dir.join("subject"), subject_file).unwrap();
    fs::write(dir.join("AdjStatePerStudy"), "##TITLE=Parameter List\n##END=\n").unwrap();
    fs::write(dir.join("ResultState"), "##TITLE=Parameter List\n##END=\n").unwrap();

    for (number, protocol) in scans {
        write_scan(&dir, *number, protocol);
    }
    dir
}

/// Write one scan directory with a 1 s TR and 10 dummy scans of 1 s
pub fn write_scan(measurement: &Path, number: u32, protocol: &str) -> PathBuf {
    let dir = measurement.join(number.to_string());
    fs::create_dir_all(&dir).unwrap();

    fs::write(
        dir.join("visu_pars"),
        format!("##TITLE=Parameter List\n{}##END=\n", parameter_string("VisuAcquisitionProtocol", protocol)),
    )
    .unwrap();
    fs::write(
        dir.join("acqp"),
        format!(
            "##TITLE=Parameter List\n{}##$ACQ_repetition_time=( 1 )\n1000\n##END=\n",
            parameter_string("ACQ_protocol_name", protocol)
        ),
    )
    .unwrap();
    fs::write(
        dir.join("method"),
        "##TITLE=Parameter List\n##$PVM_RepetitionTime=1000\n##$PVM_DummyScans=10\n##$PVM_DummyScansDur=10000\n##END=\n",
    )
    .unwrap();
    dir
}

/// Measurement with a subject file lacking the study name
pub fn write_incomplete_measurement(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("subject"),
        format!("##TITLE=Parameter List\n{}##END=\n", parameter_string("SUBJECT_id", "9999")),
    )
    .unwrap();
    write_scan(&dir, 1, "EPI_CBV_alej");
    dir
}

pub fn classification() -> ScanClassification {
    ScanClassification::from_entries([
        ("EPI_CBV_alej", ScanCategory::Functional),
        ("EPI_CBV_jin10", ScanCategory::Functional),
        ("T2_TurboRARE", ScanCategory::Structural),
    ])
}

/// Three measurements of two subjects in two conditions plus one broken measurement
///
/// ```text
/// 20170705_5502_ofM    5502  ERC_ofM    1 Localizer, 3 T2_TurboRARE, 5 EPI_CBV_alej
/// 20170712_5503_ofM    5503  ERC_ofM    3 T2_TurboRARE, 5 EPI_CBV_alej, 7 EPI_CBV_alej
/// 20170719_5502_ofMaF  5502  ERC_ofMaF  5 EPI_CBV_alej
/// 20170801_broken      (no study name)
/// ```
pub fn measurement_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_measurement(
        dir.path(),
        "20170705_5502_ofM",
        "5502",
        "ERC_ofM",
        &[(1, "1_Localizer"), (3, "T2_TurboRARE"), (5, "EPI_CBV_alej")],
    );
    write_measurement(
        dir.path(),
        "20170712_5503_ofM",
        "5503",
        "ERC_ofM",
        &[(3, "T2_TurboRARE"), (5, "EPI_CBV_alej"), (7, "EPI_CBV_alej")],
    );
    write_measurement(
        dir.path(),
        "20170719_5502_ofMaF",
        "5502",
        "ERC_ofMaF",
        &[(5, "EPI_CBV_alej")],
    );
    write_incomplete_measurement(dir.path(), "20170801_broken");
    dir
}

/// Empty file, creating parent directories
pub fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"").unwrap();
}
