// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::config::TOKEN_ENV;
use crate::discovery::Discovery;
use crate::errors::Error;
use crate::reports::{ScanResult, find_reports};
use crate::resolver::{self, Origin, ScanTarget};
use crate::runtime::ContainerRuntime;

/// Virtual filesystem subtrees the engine must not recurse into when
/// scanning a live process root.
const LIVE_EXCLUDE_DIRS: &str = "/proc,/sys,/dev,/run";

/// Exit code recorded when a scan is cancelled (128 + SIGINT).
const CANCEL_EXIT_CODE: i32 = 130;

/// Configuration snapshot consumed by the orchestrator. Read-only; the
/// same value is reused across all targets of a batch.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub token: String,
    pub pod: String,
    pub scan_types: String,
    pub mode: String,
    pub format: String,
    pub output_dir: PathBuf,
    pub engine: PathBuf,
    pub quiet: bool,
}

pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation signal a scan invocation is bound to. Cancelling kills
/// the engine subprocess and unblocks the waiting caller.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling; never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Engine arguments derived from the options. The OS description rides
/// along as a synthetic shell-command result so the engine can do
/// advisory matching without re-probing the filesystem itself.
fn build_engine_args(opts: &ScanOptions, os_description: &str, output_dir: &Path, origin: Origin) -> Vec<String> {
    let mut args = Vec::new();

    if !opts.pod.is_empty() {
        args.push("--pod".to_string());
        args.push(opts.pod.clone());
    }
    if !opts.scan_types.is_empty() {
        args.push("--scan-types".to_string());
        args.push(opts.scan_types.clone());
    }
    if !opts.mode.is_empty() {
        args.push("--mode".to_string());
        args.push(opts.mode.clone());
    }
    if !opts.format.is_empty() {
        args.push("--format".to_string());
        args.push(opts.format.clone());
    }
    if !os_description.is_empty() {
        args.push("--shell-commands".to_string());
        args.push(format!("uname -a={os_description}"));
    }
    args.push("--output-dir".to_string());
    args.push(output_dir.display().to_string());

    if origin == Origin::LiveProcess {
        args.push("--exclude-dirs".to_string());
        args.push(LIVE_EXCLUDE_DIRS.to_string());
    }

    args
}

async fn slurp(reader: Option<impl AsyncReadExt + Unpin>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = String::new();
    let _ = reader.read_to_string(&mut buf).await;
    buf
}

async fn kill_and_reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Run the engine against a resolved root and classify the outcome into
/// `result`: exit 0 is success, a non-zero engine exit code is
/// propagated verbatim with no error message, and a failure to even
/// launch the subprocess is exit code 1 with an explicit message.
async fn run_engine(
    opts: &ScanOptions,
    args: &[String],
    rootfs: &Path,
    result: &mut ScanResult,
    cancel: &CancelToken,
) {
    // The credential travels through the environment, never argv, so it
    // cannot leak through the process table.
    let mut child = match Command::new(&opts.engine)
        .args(args)
        .arg("rootfs")
        .arg(rootfs)
        .env(TOKEN_ENV, &opts.token)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            result.record_error(1, format!("failed to start engine {}: {e}", opts.engine.display()));
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_task = tokio::spawn(slurp(stdout));
    let err_task = tokio::spawn(slurp(stderr));

    let mut cancelled = false;
    let wait_result = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.clone().cancelled() => {
            warn!("cancellation requested, terminating engine");
            kill_and_reap(&mut child).await;
            cancelled = true;
            None
        }
    };

    let mut raw = out_task.await.unwrap_or_default();
    raw.push_str(&err_task.await.unwrap_or_default());
    result.raw_output = raw;

    if cancelled {
        result.record_error(CANCEL_EXIT_CODE, "scan cancelled");
        return;
    }

    match wait_result {
        Some(Ok(status)) => match status.code() {
            Some(code) => result.exit_code = code,
            None => result.record_error(1, "engine terminated by signal"),
        },
        Some(Err(e)) => result.record_error(1, format!("failed to wait for engine: {e}")),
        None => {}
    }
}

fn image_output_dir(base: &Path, image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    base.join(stem)
}

/// One resolve-extract-scan-cleanup cycle for a packaged image. The
/// extraction directory is scoped to this call and removed on every
/// exit path, success or not.
pub async fn scan_image<R: ContainerRuntime>(
    image: &Path,
    runtime: &R,
    opts: &ScanOptions,
    cancel: &CancelToken,
) -> ScanResult {
    let mut result = ScanResult::started(image.display().to_string(), "sif");

    match resolver::resolve_image(image, runtime).await {
        Ok(resolved) => {
            result.os_description = resolved.os_description.clone();
            if !opts.quiet {
                info!("OS: {}", resolved.os_description);
            }

            let output_dir = image_output_dir(&opts.output_dir, image);
            match std::fs::create_dir_all(&output_dir) {
                Ok(()) => {
                    if !opts.quiet {
                        info!("running vulnerability scan on {}", image.display());
                    }
                    let args =
                        build_engine_args(opts, &result.os_description, &output_dir, resolved.origin);
                    run_engine(opts, &args, resolved.path(), &mut result, cancel).await;
                    result.reports = find_reports(&output_dir);
                }
                Err(e) => result.record_error(
                    1,
                    format!("failed to create output directory {}: {e}", output_dir.display()),
                ),
            }
        }
        Err(e) => result.record_error(1, e.to_string()),
    }

    result.finish();
    result
}

/// Scan a running container by PID or name pattern. The engine operates
/// directly on the live root; nothing is copied.
pub async fn scan_running(
    target: &str,
    discovery: &Discovery,
    opts: &ScanOptions,
    cancel: &CancelToken,
) -> ScanResult {
    let mut result = ScanResult::started(target.to_string(), "running");

    let pid = match ScanTarget::parse_running(target) {
        ScanTarget::ProcessId(pid) => Ok(pid),
        _ => resolver::resolve_name_pattern(discovery, target).map(|(pid, note)| {
            if let Some(note) = note {
                info!("{note}");
            }
            pid
        }),
    };

    let resolved = pid.and_then(|pid| resolver::resolve_pid(discovery, pid).map(|r| (pid, r)));
    match resolved {
        Ok((pid, resolved)) => {
            result.os_description = resolved.os_description.clone();
            if !opts.quiet {
                info!("scanning running container (PID {pid}), OS: {}", resolved.os_description);
            }

            let output_dir = opts.output_dir.join(format!("pid-{pid}"));
            match std::fs::create_dir_all(&output_dir) {
                Ok(()) => {
                    let args =
                        build_engine_args(opts, &result.os_description, &output_dir, resolved.origin);
                    run_engine(opts, &args, resolved.path(), &mut result, cancel).await;
                    result.reports = find_reports(&output_dir);
                }
                Err(e) => result.record_error(
                    1,
                    format!("failed to create output directory {}: {e}", output_dir.display()),
                ),
            }
        }
        Err(e) => result.record_error(1, e.to_string()),
    }

    result.finish();
    result
}

/// Scan a batch of images sequentially, in input order. One target's
/// failure is recorded in its result and never aborts its siblings;
/// running one extraction at a time keeps temporary disk usage and
/// external-tool contention bounded.
pub async fn scan_image_batch<R: ContainerRuntime>(
    images: &[PathBuf],
    runtime: &R,
    opts: &ScanOptions,
    cancel: &CancelToken,
) -> Vec<ScanResult> {
    let mut results = Vec::with_capacity(images.len());
    for image in images {
        if cancel.is_cancelled() {
            let mut result = ScanResult::started(image.display().to_string(), "sif");
            result.record_error(CANCEL_EXIT_CODE, "scan cancelled");
            result.finish();
            results.push(result);
            continue;
        }
        results.push(scan_image(image, runtime, opts, cancel).await);
    }
    results
}

/// Pure passthrough to the engine for registry-image and source-path
/// scans. The engine owns the terminal; we only inject the shared
/// options and the credential.
pub async fn run_direct(
    subcommand: &str,
    extra_args: &[String],
    opts: &ScanOptions,
    cancel: &CancelToken,
) -> Result<i32, Error> {
    let mut args: Vec<String> = Vec::new();
    if !opts.pod.is_empty() {
        args.push("--pod".to_string());
        args.push(opts.pod.clone());
    }
    if !opts.scan_types.is_empty() {
        args.push("--scan-types".to_string());
        args.push(opts.scan_types.clone());
    }
    if !opts.mode.is_empty() {
        args.push("--mode".to_string());
        args.push(opts.mode.clone());
    }
    if !opts.format.is_empty() {
        args.push("--format".to_string());
        args.push(opts.format.clone());
    }
    args.push("--output-dir".to_string());
    args.push(opts.output_dir.display().to_string());
    args.push(subcommand.to_string());
    args.extend_from_slice(extra_args);

    let mut child = Command::new(&opts.engine)
        .args(&args)
        .env(TOKEN_ENV, &opts.token)
        .spawn()
        .map_err(|e| Error::io(format!("failed to start engine {}", opts.engine.display()), e))?;

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| {
            Error::io(format!("failed to wait for engine {}", opts.engine.display()), e)
        })?,
        _ = cancel.clone().cancelled() => {
            warn!("cancellation requested, terminating engine");
            kill_and_reap(&mut child).await;
            return Ok(CANCEL_EXIT_CODE);
        }
    };

    Ok(status.code().unwrap_or(1))
}

/// The process-level exit status for a multi-target invocation: the
/// first non-zero exit code observed, in input order.
pub fn worst_exit_code(results: &[ScanResult]) -> i32 {
    results
        .iter()
        .map(|r| r.exit_code)
        .find(|&code| code != 0)
        .unwrap_or(0)
}

#[cfg(test)]
#[cfg(unix)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::procfs::ProcTable;
    use crate::test_utils::{FakeRuntime, write_proc_entry};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn options(engine: PathBuf, output_dir: PathBuf) -> ScanOptions {
        ScanOptions {
            token: "test-token".to_string(),
            pod: "US2".to_string(),
            scan_types: "pkg,fileinsight".to_string(),
            mode: "get-report".to_string(),
            format: String::new(),
            output_dir,
            engine,
            quiet: true,
        }
    }

    #[test]
    fn test_build_engine_args_full() {
        let opts = ScanOptions {
            token: "t".to_string(),
            pod: "US2".to_string(),
            scan_types: "pkg".to_string(),
            mode: "get-report".to_string(),
            format: "json,spdx".to_string(),
            output_dir: "/reports".into(),
            engine: "/usr/bin/qscanner".into(),
            quiet: false,
        };
        let args = build_engine_args(&opts, "Linux Ubuntu 22.04", Path::new("/reports/app"), Origin::ExtractedImage);
        assert_eq!(
            args,
            vec![
                "--pod",
                "US2",
                "--scan-types",
                "pkg",
                "--mode",
                "get-report",
                "--format",
                "json,spdx",
                "--shell-commands",
                "uname -a=Linux Ubuntu 22.04",
                "--output-dir",
                "/reports/app",
            ]
        );
    }

    #[test]
    fn test_build_engine_args_skips_empty_and_excludes_live_dirs() {
        let opts = ScanOptions {
            token: "t".to_string(),
            pod: String::new(),
            scan_types: String::new(),
            mode: String::new(),
            format: String::new(),
            output_dir: "/reports".into(),
            engine: "/usr/bin/qscanner".into(),
            quiet: false,
        };
        let args = build_engine_args(&opts, "", Path::new("/reports/pid-42"), Origin::LiveProcess);
        assert_eq!(
            args,
            vec![
                "--output-dir",
                "/reports/pid-42",
                "--exclude-dirs",
                "/proc,/sys,/dev,/run",
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_image_engine_exit_code_propagated_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("app.sif");
        fs::write(&image, "fake").unwrap();
        let engine = write_script(dir.path(), "engine", "exit 3");

        let opts = options(engine, dir.path().join("reports"));
        let (_handle, token) = cancel_pair();
        let result = scan_image(&image, &FakeRuntime::new(), &opts, &token).await;

        assert_eq!(result.exit_code, 3);
        assert!(result.error.is_empty());
        assert!(result.reports.is_empty());
    }

    #[tokio::test]
    async fn test_scan_image_collects_reports_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("app.sif");
        fs::write(&image, "fake").unwrap();
        // Engine stub: find --output-dir among the args and drop a
        // report file there.
        let engine = write_script(
            dir.path(),
            "engine",
            r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--output-dir" ]; then out="$2"; fi
  shift
done
echo '{}' > "$out/scan-report.json"
exit 0"#,
        );

        let opts = options(engine, dir.path().join("reports"));
        let (_handle, token) = cancel_pair();
        let result = scan_image(&image, &FakeRuntime::new(), &opts, &token).await;

        assert_eq!(result.exit_code, 0);
        assert!(result.succeeded());
        assert_eq!(result.target_type, "sif");
        assert_eq!(result.os_description, "Linux fake 1.0");
        assert_eq!(
            result.reports.get("json").unwrap(),
            &dir.path().join("reports").join("app").join("scan-report.json")
        );
    }

    #[tokio::test]
    async fn test_scan_image_launch_failure_is_exit_one_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("app.sif");
        fs::write(&image, "fake").unwrap();

        let opts = options("/nonexistent/engine".into(), dir.path().join("reports"));
        let (_handle, token) = cancel_pair();
        let result = scan_image(&image, &FakeRuntime::new(), &opts, &token).await;

        assert_eq!(result.exit_code, 1);
        assert!(result.error.contains("failed to start engine"));
    }

    #[tokio::test]
    async fn test_scan_image_token_passed_via_environment() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("app.sif");
        fs::write(&image, "fake").unwrap();
        let engine = write_script(
            dir.path(),
            "engine",
            r#"[ "$QUALYS_ACCESS_TOKEN" = "test-token" ] || exit 9
exit 0"#,
        );

        let opts = options(engine, dir.path().join("reports"));
        let (_handle, token) = cancel_pair();
        let result = scan_image(&image, &FakeRuntime::new(), &opts, &token).await;
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_scan_image_resolution_failure_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_script(dir.path(), "engine", "exit 0");

        let opts = options(engine, dir.path().join("reports"));
        let (_handle, token) = cancel_pair();
        let result = scan_image(
            Path::new("/nonexistent/app.sif"),
            &FakeRuntime::new(),
            &opts,
            &token,
        )
        .await;

        assert_eq!(result.exit_code, 1);
        assert!(result.error.contains("SIF file not found"));
    }

    #[tokio::test]
    async fn test_scan_image_cancellation_unblocks_caller() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("app.sif");
        fs::write(&image, "fake").unwrap();
        let engine = write_script(dir.path(), "engine", "sleep 60");

        let opts = options(engine, dir.path().join("reports"));
        let (handle, token) = cancel_pair();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            handle.cancel();
        });

        let result = scan_image(&image, &FakeRuntime::new(), &opts, &token).await;
        canceller.await.unwrap();

        assert_eq!(result.exit_code, 130);
        assert_eq!(result.error, "scan cancelled");
    }

    #[test]
    fn test_cleanup_invariant_every_exit_path() {
        let tmp = tempfile::tempdir().unwrap();
        temp_env::with_var("TMPDIR", Some(tmp.path().as_os_str()), || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let image = dir.path().join("app.sif");
                fs::write(&image, "fake").unwrap();
                let ok_engine = write_script(dir.path(), "engine", "exit 0");
                let bad_engine = PathBuf::from("/nonexistent/engine");

                let (_handle, token) = cancel_pair();

                // Success, engine-launch failure, and extraction failure.
                let opts = options(ok_engine.clone(), dir.path().join("reports"));
                scan_image(&image, &FakeRuntime::new(), &opts, &token).await;

                let opts = options(bad_engine, dir.path().join("reports"));
                scan_image(&image, &FakeRuntime::new(), &opts, &token).await;

                let opts = options(ok_engine, dir.path().join("reports"));
                scan_image(&image, &FakeRuntime::new().with_failing_extract(), &opts, &token).await;
            });

            let leftovers: Vec<_> = fs::read_dir(tmp.path())
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_str()
                        .is_some_and(|n| n.starts_with("sifscan-rootfs-"))
                })
                .collect();
            assert!(leftovers.is_empty(), "leftover extraction dirs: {leftovers:?}");
        });
    }

    #[tokio::test]
    async fn test_batch_independence() {
        let dir = tempfile::tempdir().unwrap();
        let good1 = dir.path().join("one.sif");
        let good2 = dir.path().join("two.sif");
        fs::write(&good1, "fake").unwrap();
        fs::write(&good2, "fake").unwrap();
        let engine = write_script(dir.path(), "engine", "exit 0");

        let images = vec![
            good1,
            PathBuf::from("/nonexistent/broken.sif"),
            good2,
        ];
        let opts = options(engine, dir.path().join("reports"));
        let (_handle, token) = cancel_pair();
        let results = scan_image_batch(&images, &FakeRuntime::new(), &opts, &token).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].exit_code, 0);
        assert_eq!(results[1].exit_code, 1);
        assert!(results[1].error.contains("SIF file not found"));
        assert_eq!(results[2].exit_code, 0);
        assert_eq!(worst_exit_code(&results), 1);
    }

    #[tokio::test]
    async fn test_run_direct_propagates_engine_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_script(dir.path(), "engine", "exit 4");

        let opts = options(engine, dir.path().join("reports"));
        let (_handle, token) = cancel_pair();
        let code = run_direct("image", &["registry/app:1".to_string()], &opts, &token)
            .await
            .unwrap();
        assert_eq!(code, 4);
    }

    #[tokio::test]
    async fn test_run_direct_cancellation_terminates_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = write_script(dir.path(), "engine", "sleep 60");

        let opts = options(engine, dir.path().join("reports"));
        let (handle, token) = cancel_pair();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            handle.cancel();
        });

        let code = run_direct("image", &["registry/app:1".to_string()], &opts, &token)
            .await
            .unwrap();
        canceller.await.unwrap();
        assert_eq!(code, 130);
    }

    #[tokio::test]
    async fn test_scan_running_live_root() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        write_proc_entry(&proc_root, 4242, &["apptainer", "run", "app.sif"]);
        let etc = proc_root.join("4242").join("root").join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("os-release"), "PRETTY_NAME=\"Ubuntu 22.04.1 LTS\"\n").unwrap();

        // The live path must carry the virtual-tree exclusions.
        let engine = write_script(
            dir.path(),
            "engine",
            r#"case "$*" in
  *--exclude-dirs*) exit 0 ;;
  *) exit 9 ;;
esac"#,
        );

        let discovery = Discovery::with_proc_table(ProcTable::with_root(&proc_root));
        let opts = options(engine, dir.path().join("reports"));
        let (_handle, token) = cancel_pair();
        let result = scan_running("4242", &discovery, &opts, &token).await;

        assert_eq!(result.exit_code, 0, "error: {}", result.error);
        assert_eq!(result.os_description, "Linux Ubuntu 22.04.1 LTS");
        assert_eq!(result.target_type, "running");
    }

    #[tokio::test]
    async fn test_scan_running_nonexistent_pid() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("proc");
        fs::create_dir_all(&proc_root).unwrap();
        let engine = write_script(dir.path(), "engine", "exit 0");

        let discovery = Discovery::with_proc_table(ProcTable::with_root(&proc_root));
        let opts = options(engine, dir.path().join("reports"));
        let (_handle, token) = cancel_pair();
        let result = scan_running("9999", &discovery, &opts, &token).await;

        assert_eq!(result.exit_code, 1);
        assert!(result.error.contains("does not exist"));
    }

    #[test]
    fn test_worst_exit_code_first_nonzero() {
        let mut a = ScanResult::started("a".to_string(), "sif");
        let mut b = ScanResult::started("b".to_string(), "sif");
        let c = ScanResult::started("c".to_string(), "sif");
        a.exit_code = 0;
        b.exit_code = 3;
        assert_eq!(worst_exit_code(&[a, b, c]), 3);
        assert_eq!(worst_exit_code(&[]), 0);
    }
}
