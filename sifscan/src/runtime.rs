// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, info};
use tokio::process::Command;

use crate::errors::Error;

/// Runtime candidates, in fixed detection order. First hit wins.
const RUNTIME_CANDIDATES: &[&str] = &["apptainer", "singularity"];

/// Virtual and transient trees left out of the serialized image
/// filesystem. The engine would otherwise recurse into pseudo content.
const TAR_SERIALIZE_ARGS: &[&str] = &[
    "tar",
    "-cf",
    "-",
    "--exclude=/proc",
    "--exclude=/sys",
    "--exclude=/dev",
    "--exclude=/run",
    "--exclude=/tmp",
    "/",
];

/// The two capabilities the rest of the system needs from a container
/// runtime. Exactly one concrete implementation is selected at
/// detection time; new runtimes implement these two operations instead
/// of branching on tool names throughout the codebase.
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime {
    fn name(&self) -> &str;

    /// Run a command inside the image without mutating it and return
    /// its stdout.
    async fn exec(&self, image: &Path, args: &[&str]) -> Result<Vec<u8>, Error>;

    /// Materialize the image's filesystem into `dest`. On failure the
    /// destination may hold a partial extraction and must be discarded.
    async fn extract_filesystem(&self, image: &Path, dest: &Path) -> Result<(), Error>;
}

/// Search `PATH` for an executable, the way the shell would.
pub fn lookup_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|m| m.is_file())
}

/// Find the one container-runtime tool installed on this host.
pub fn detect_runtime() -> Result<ApptainerRuntime, Error> {
    for candidate in RUNTIME_CANDIDATES {
        if let Some(binary) = lookup_path(candidate) {
            info!("detected container runtime: {}", binary.display());
            return Ok(ApptainerRuntime { binary });
        }
    }
    Err(Error::RuntimeNotFound)
}

/// Apptainer and Singularity share a CLI surface; one implementation
/// covers both, parameterized only by the detected binary.
pub struct ApptainerRuntime {
    binary: PathBuf,
}

impl ApptainerRuntime {
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        ApptainerRuntime {
            binary: binary.into(),
        }
    }
}

impl ContainerRuntime for ApptainerRuntime {
    fn name(&self) -> &str {
        self.binary
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
    }

    async fn exec(&self, image: &Path, args: &[&str]) -> Result<Vec<u8>, Error> {
        let display = format!("{} exec {} {}", self.name(), image.display(), args.join(" "));
        debug!("running: {display}");

        let output = Command::new(&self.binary)
            .arg("exec")
            .arg(image)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::io(format!("failed to run {display}"), e))?;

        if !output.status.success() {
            return Err(Error::Execution {
                command: display,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    /// Streaming extraction: the runtime serializes the image filesystem
    /// to a tar byte stream that a concurrent unpack stage writes into
    /// `dest`. The stream is the only coupling between the stages; no
    /// intermediate buffering touches disk. Per-stage exit codes are not
    /// individually surfaced (a known limitation of the piped design),
    /// so the non-empty destination check is the single correctness gate.
    async fn extract_filesystem(&self, image: &Path, dest: &Path) -> Result<(), Error> {
        let mut unpack = Command::new("tar")
            .arg("-xf")
            .arg("-")
            .arg("-C")
            .arg(dest)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Extraction {
                context: "failed to start unpack stage".to_string(),
                source: e,
            })?;

        let serialize = Command::new(&self.binary)
            .arg("exec")
            .arg(image)
            .args(TAR_SERIALIZE_ARGS)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        let mut serialize = match serialize {
            Ok(child) => child,
            Err(e) => {
                // The unpack stage is blocked on stdin; tear it down so a
                // failed serialize start does not leak a subprocess.
                let _ = unpack.start_kill();
                let _ = unpack.wait().await;
                return Err(Error::Extraction {
                    context: "failed to start serialize stage".to_string(),
                    source: e,
                });
            }
        };

        let stream_result = match (serialize.stdout.take(), unpack.stdin.take()) {
            (Some(mut out), Some(mut input)) => tokio::io::copy(&mut out, &mut input).await,
            _ => Err(std::io::Error::other("pipe endpoints unavailable")),
        };
        if let Err(e) = &stream_result {
            debug!("extraction stream ended early: {e}");
        }

        // Stage failures only become observable once both have finished;
        // the stream going quiet is not a verdict on either stage.
        let _ = serialize.wait().await;
        let _ = unpack.wait().await;

        let mut entries = fs::read_dir(dest).map_err(|e| Error::Extraction {
            context: format!("failed to read extracted directory {}", dest.display()),
            source: e,
        })?;
        if entries.next().is_none() {
            return Err(Error::EmptyExtraction {
                dest: dest.display().to_string(),
            });
        }

        Ok(())
    }
}
