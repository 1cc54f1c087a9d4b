use std::fs;
use std::path::Path;
use tempfile::tempdir;

const TUBE: &str = "unified-report-files";

fn write_script(bin_path: &Path, body: &str) {
    fs::write(bin_path, format!("#!/usr/bin/env bash\n{body}\n")).expect("write fake importer");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(bin_path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(bin_path, perms).expect("chmod");
    }
}

fn relay_cmd(home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("report-relay");
    cmd.current_dir(home).env("RELAY_HOME", home);
    cmd
}

fn count_entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|it| it.count()).unwrap_or(0)
}

fn seed_legacy_drop(home: &Path) {
    let day = home.join("watch/acme/12/20240502-20240501-20240501");
    fs::create_dir_all(&day).expect("mkdir");
    fs::write(day.join("r.csv"), "day,clicks\n2024-05-01,3\n").expect("write");
    fs::write(day.join("copy.csv"), "day,clicks\n2024-05-01,3\n").expect("write");
}

#[test]
fn enqueue_skips_content_already_queued() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    seed_legacy_drop(home);

    relay_cmd(home)
        .arg("enqueue")
        .assert()
        .success()
        .stdout(predicates::str::contains("found 1 new files and 1 duplications"));
    assert_eq!(count_entries(&home.join("queue").join(TUBE).join("ready")), 1);

    relay_cmd(home)
        .arg("enqueue")
        .assert()
        .success()
        .stdout(predicates::str::contains("found 0 new files and 2 duplications"));
    assert_eq!(count_entries(&home.join("queue").join(TUBE).join("ready")), 1);
}

#[test]
fn worker_runs_the_import_command_per_job() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    seed_legacy_drop(home);
    let log = home.join("import.log");
    let importer = home.join("importer");
    write_script(&importer, r#"echo "$@" >> "$IMPORT_LOG""#);

    relay_cmd(home).arg("enqueue").assert().success();
    relay_cmd(home)
        .env(
            "RELAY_IMPORT_COMMAND",
            format!("{} --publisher={{publisher}} {{partner}} {{file}}", importer.display()),
        )
        .env("IMPORT_LOG", &log)
        .arg("work")
        .assert()
        .success()
        .stdout(predicates::str::contains("imported=1"));

    let logged = fs::read_to_string(&log).expect("import log");
    assert!(logged.contains("--publisher=12 acme"));
    assert!(logged.contains("20240502-20240501-20240501"));
    assert_eq!(count_entries(&home.join("queue").join(TUBE).join("ready")), 0);
    assert_eq!(count_entries(&home.join("queue").join(TUBE).join("buried")), 0);
}

#[test]
fn failing_imports_are_buried() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();
    seed_legacy_drop(home);
    let importer = home.join("importer");
    write_script(&importer, "echo boom >&2\nexit 3");

    relay_cmd(home).arg("enqueue").assert().success();
    relay_cmd(home)
        .env("RELAY_IMPORT_COMMAND", format!("{} {{file}}", importer.display()))
        .arg("work")
        .assert()
        .success()
        .stdout(predicates::str::contains("buried=1"));

    let buried = home.join("queue").join(TUBE).join("buried");
    assert_eq!(count_entries(&buried), 1);
    let entry = fs::read_dir(&buried)
        .expect("read")
        .next()
        .expect("entry")
        .expect("entry");
    let raw = fs::read_to_string(entry.path()).expect("read buried");
    assert!(raw.contains("boom"));
}

#[test]
fn worker_without_import_command_fails() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path();

    relay_cmd(home)
        .arg("work")
        .assert()
        .failure()
        .stdout(predicates::str::contains("import_command is not configured"));
}
