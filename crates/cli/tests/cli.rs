//! Tests running the ozite binary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Output};

struct Env {
    td: tempfile::TempDir,
}

impl Env {
    fn new() -> Self {
        let td = tempfile::tempdir().unwrap();
        fs::create_dir(td.path().join("tmp")).unwrap();
        Self { td }
    }

    fn path(&self) -> &Path {
        self.td.path()
    }

    fn tmp_root(&self) -> std::path::PathBuf {
        self.path().join("tmp")
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_ozite"))
            .args(args)
            .current_dir(self.path())
            .env("OZITE_TMPROOT", self.tmp_root())
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }
}

#[track_caller]
fn assert_fails_with(out: &Output, needle: &str) {
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains(needle), "{stderr}");
}

#[test]
fn test_help() {
    let env = Env::new();
    let out = env.run(&["--help"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Examples:"), "{stdout}");
    assert!(stdout.contains("--upload_existing_image"), "{stdout}");
    assert!(!stdout.contains("--tmp-root"), "{stdout}");
}

#[test]
fn test_usage_errors() {
    let env = Env::new();
    fs::write(env.path().join("creds"), "OS_USERNAME=me\n").unwrap();
    let cases: &[(&[&str], &str)] = &[
        (&["-n", "demo", "-f", "vmdk"], "vmdk"),
        (&["-n", "demo"], "--image_format"),
        (&["-n", "demo", "-f", "qcow2", "-u", "-o", "beos", "-t", "p"], "beos"),
        (
            &["-n", "demo", "-f", "qcow2", "-t", "p"],
            "There is no point passing -t/--tenant",
        ),
        (
            &["-n", "demo", "-f", "qcow2", "-p"],
            "There is no point passing -p/--purge",
        ),
        (
            &["-n", "demo", "-f", "qcow2", "-u", "-o", "linux"],
            "You must set either -t/--tenant or -c/--os_credentials",
        ),
        (
            &["-n", "demo", "-f", "qcow2", "-u", "-o", "linux", "-t", "p", "-c", "creds"],
            "Don't pass -t/--tenant when supplying credentials from a file",
        ),
        (
            &["-n", "demo", "-f", "qcow2", "-u", "-t", "p"],
            "you must supply the OS in -o/--os",
        ),
        (&["-f", "qcow2"], "You must pass -n/--name"),
        (
            &["-i", "missing.qcow2", "-f", "qcow2", "-o", "linux", "-t", "p"],
            "missing.qcow2 is not a file",
        ),
        (
            &["-i", "creds", "-n", "demo", "-f", "qcow2", "-o", "linux", "-t", "p"],
            "There is no point passing --name, --repo or --local",
        ),
    ];
    for (args, needle) in cases {
        let out = env.run(args);
        assert_fails_with(&out, needle);
    }
    assert_eq!(fs::read_dir(env.tmp_root()).unwrap().count(), 0);
}

#[test]
fn test_local_template_not_found() {
    let env = Env::new();
    let out = env.run(&["-l", "-n", "demo", "-f", "rawimg"]);
    assert_fails_with(&out, "Template not found: no demo/demo.tdl");
    assert_eq!(fs::read_dir(env.tmp_root()).unwrap().count(), 0);
}

#[test]
fn test_local_build() {
    let env = Env::new();
    let templates = env.path().join("demo");
    fs::create_dir(&templates).unwrap();
    fs::write(templates.join("demo.tdl"), "<template/>").unwrap();

    let installer = env.path().join("fake-oz-install");
    fs::write(
        &installer,
        indoc::indoc! {r#"
            #!/bin/sh
            while [ $# -gt 0 ]; do
                if [ "$1" = "-s" ]; then
                    shift
                    echo rawdata > "$1"
                fi
                shift
            done
        "#},
    )
    .unwrap();
    fs::set_permissions(&installer, fs::Permissions::from_mode(0o755)).unwrap();

    let out = Command::new(env!("CARGO_BIN_EXE_ozite"))
        .args(["-l", "-n", "demo", "-f", "rawimg"])
        .current_dir(env.path())
        .env("OZITE_TMPROOT", env.tmp_root())
        .env("OZITE_INSTALLER", &installer)
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        out.status.success(),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(stdout.starts_with("New image in "), "{stdout}");

    // Only the finished image is left behind
    let entries: Vec<_> = fs::read_dir(env.tmp_root())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries.len(), 1, "{entries:?}");
    assert!(entries[0].starts_with("demo-"), "{entries:?}");
    assert!(entries[0].ends_with(".rawimg"), "{entries:?}");
    let image = env.tmp_root().join(&entries[0]);
    assert_eq!(fs::read_to_string(image).unwrap(), "rawdata\n");
}
