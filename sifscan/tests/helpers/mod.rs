// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Write an executable shell script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .unwrap_or_else(|e| panic!("failed to chmod {}: {e}", path.display()));
    path
}

/// A fake `apptainer` that serves the two calls the wrapper makes:
/// `exec <image> tar ...` streams the fixture tree given in `$SIFSCAN_TEST_FIXTURE`,
/// and `exec <image> uname -a` plays back a canned OS line.
pub fn write_fake_runtime(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "apptainer",
        r#"shift 2
case "$1" in
  tar) exec tar -cf - -C "$SIFSCAN_TEST_FIXTURE" . ;;
  uname) echo "Linux testimg 6.1.0 x86_64" ;;
  *) exit 2 ;;
esac"#,
    )
}

/// A fake engine that verifies the token arrived via the environment,
/// drops a report into the output directory, and exits 0.
pub fn write_fake_engine(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "engine",
        r#"[ -n "$QUALYS_ACCESS_TOKEN" ] || exit 9
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--output-dir" ]; then out="$2"; fi
  shift
done
echo '{"findings":[]}' > "$out/scan-report.json"
exit 0"#,
    )
}

/// A minimal container root tree the fake runtime can serialize.
pub fn write_fixture_tree(dir: &Path) -> PathBuf {
    let fixture = dir.join("fixture");
    let etc = fixture.join("etc");
    fs::create_dir_all(&etc).unwrap_or_else(|e| panic!("failed to create fixture: {e}"));
    fs::write(etc.join("os-release"), "PRETTY_NAME=\"Test OS 1.0\"\n")
        .unwrap_or_else(|e| panic!("failed to write os-release: {e}"));
    fixture
}

/// A fake `/proc` entry for a container-runtime process.
pub fn write_proc_entry(proc_root: &Path, pid: i32, cmdline_args: &[&str]) {
    let dir = proc_root.join(pid.to_string());
    fs::create_dir_all(&dir).unwrap_or_else(|e| panic!("failed to create proc entry: {e}"));
    let mut packed = cmdline_args.join("\0");
    packed.push('\0');
    fs::write(dir.join("cmdline"), packed)
        .unwrap_or_else(|e| panic!("failed to write cmdline: {e}"));
}

/// Run the sifscan binary with the given arguments and extra environment.
pub fn run_sifscan(args: &[&str], envs: &[(&str, &str)]) -> Output {
    let bin = env!("CARGO_BIN_EXE_sifscan");
    let mut cmd = Command::new(bin);
    cmd.args(args);
    // Keep the host's credentials and config out of the child so every
    // test starts from a clean slate.
    for var in [
        "QUALYS_ACCESS_TOKEN",
        "QUALYS_POD",
        "SCAN_TYPES",
        "OUTPUT_DIR",
        "XDG_CONFIG_HOME",
        "XDG_CACHE_HOME",
        "HOME",
    ] {
        cmd.env_remove(var);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.output()
        .unwrap_or_else(|e| panic!("failed to run sifscan: {e}"))
}

pub fn stdout_str(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn stderr_str(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}
