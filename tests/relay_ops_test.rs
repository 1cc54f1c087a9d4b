use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn relay_cmd(home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("report-relay");
    cmd.current_dir(home).env("RELAY_HOME", home);
    cmd
}

#[test]
fn status_reports_stores_and_queue() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();

    relay_cmd(home)
        .arg("status")
        .assert()
        .success()
        .stdout(predicates::str::contains("reachable"))
        .stdout(predicates::str::contains("lock.quorum=1 reachable=1"))
        .stdout(predicates::str::contains("queue.import_command=unset"))
        .stdout(predicates::str::contains("ready=0 reserved=0 buried=0"))
        .stdout(predicates::str::contains("queue.ledger=0 files"));
}

#[test]
fn status_flags_misspelled_variables() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();

    relay_cmd(home)
        .env("RELAY_MAX_RETRIES", "3")
        .arg("status")
        .assert()
        .failure()
        .stdout(predicates::str::contains("env.RELAY_MAX_RETRIES=unknown"));
}

#[test]
fn status_flags_missing_import_program() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();

    relay_cmd(home)
        .env("RELAY_IMPORT_COMMAND", "/nonexistent/importer {file}")
        .arg("status")
        .assert()
        .failure()
        .stdout(predicates::str::contains("not found"));
}

#[test]
fn sweep_lists_then_deletes_incompatible_files() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    let day = home.join("processed/12/acme/2024-05-01");
    fs::create_dir_all(&day).expect("mkdir");
    fs::write(day.join("r.csv"), "a").expect("write");
    fs::write(day.join("scan.pdf"), "x").expect("write");

    relay_cmd(home)
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicates::str::contains("incompatible=1"));
    assert!(day.join("scan.pdf").exists());

    relay_cmd(home)
        .args(["sweep", "--delete"])
        .assert()
        .success()
        .stdout(predicates::str::contains("deleted=1"));
    assert!(!day.join("scan.pdf").exists());
    assert!(day.join("r.csv").exists());
}

#[test]
fn data_sources_reports_lookup_failures() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();

    relay_cmd(home)
        .env("RELAY_API_TOKEN_URL", "http://127.0.0.1:9/token")
        .env("RELAY_API_INTEGRATION_LOOKUP_URL", "http://127.0.0.1:9/ds")
        .args(["data-sources", "--publisher", "12", "--integration", "acme"])
        .assert()
        .failure()
        .stdout(predicates::str::contains("lookup failed"));
}
