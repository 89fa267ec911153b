use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

#[test]
fn validate_reports_parsed_fields() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[CommonData]\nMachineName=box1\n\n[MonitorServiceSpec]\nName1=svcA\n"
    )
    .unwrap();

    Command::cargo_bin("wardend")
        .unwrap()
        .arg("validate")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("machine name: box1"))
        .stdout(predicate::str::contains("specific services: 1"));
}

#[test]
fn validate_bootstraps_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("monitorCfg").join("config.ini");

    Command::cargo_bin("wardend")
        .unwrap()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration valid"));

    assert!(path.exists());
}

#[test]
fn status_reports_inactive_without_systemd_unit() {
    Command::cargo_bin("wardend")
        .unwrap()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("wardend.service:"));
}
