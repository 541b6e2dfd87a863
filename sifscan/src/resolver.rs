// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use tempfile::TempDir;

use crate::discovery::Discovery;
use crate::errors::Error;
use crate::runtime::ContainerRuntime;

pub const UNKNOWN_OS: &str = "Linux unknown";

/// What the user asked to scan. Immutable once constructed.
#[derive(Debug, Clone)]
pub enum ScanTarget {
    ImagePath(PathBuf),
    ProcessId(i32),
    ProcessNamePattern(String),
    DirectPath(PathBuf),
}

impl ScanTarget {
    /// A `running` argument is a PID when numeric, a name pattern
    /// otherwise.
    pub fn parse_running(input: &str) -> ScanTarget {
        match input.parse::<i32>() {
            Ok(pid) => ScanTarget::ProcessId(pid),
            Err(_) => ScanTarget::ProcessNamePattern(input.to_string()),
        }
    }

    pub fn target_type(&self) -> &'static str {
        match self {
            ScanTarget::ImagePath(_) => "sif",
            ScanTarget::ProcessId(_) | ScanTarget::ProcessNamePattern(_) => "running",
            ScanTarget::DirectPath(_) => "directory",
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanTarget::ImagePath(p) | ScanTarget::DirectPath(p) => write!(f, "{}", p.display()),
            ScanTarget::ProcessId(pid) => write!(f, "{pid}"),
            ScanTarget::ProcessNamePattern(pat) => write!(f, "{pat}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    ExtractedImage,
    LiveProcess,
    Direct,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::ExtractedImage => "extracted-image",
            Origin::LiveProcess => "live-process",
            Origin::Direct => "direct",
        }
    }
}

/// Owns the extraction directory for extracted-image roots. Dropping the
/// handle removes the directory, so the cleanup happens on every exit
/// path of the scan that owns it.
#[derive(Debug)]
enum RootHandle {
    Scoped(TempDir),
    Borrowed(PathBuf),
}

/// A concrete, readable filesystem root plus identifying metadata.
/// Owned exclusively by the scan call that created it; an
/// `extracted-image` root never outlives that call.
#[derive(Debug)]
pub struct ResolvedRoot {
    handle: RootHandle,
    pub origin: Origin,
    /// Best-effort, never guaranteed accurate. Empty when no probing
    /// was performed (direct paths).
    pub os_description: String,
}

impl ResolvedRoot {
    pub fn path(&self) -> &Path {
        match &self.handle {
            RootHandle::Scoped(dir) => dir.path(),
            RootHandle::Borrowed(path) => path,
        }
    }
}

/// Extract a SIF image into a fresh scan-scoped temporary directory and
/// probe the image for its OS identity.
pub async fn resolve_image<R: ContainerRuntime>(
    image: &Path,
    runtime: &R,
) -> Result<ResolvedRoot, Error> {
    if !image.exists() {
        return Err(Error::ImageNotFound {
            path: image.display().to_string(),
        });
    }

    let dir = TempDir::with_prefix("sifscan-rootfs-")
        .map_err(|e| Error::io("failed to create extraction directory", e))?;

    info!("extracting filesystem from {}", image.display());
    runtime.extract_filesystem(image, dir.path()).await?;

    // The probe is advisory; a probe failure degrades the description,
    // never the scan.
    let os_description = match runtime.exec(image, &["uname", "-a"]).await {
        Ok(out) => {
            let s = String::from_utf8_lossy(&out).trim().to_string();
            if s.is_empty() { UNKNOWN_OS.to_string() } else { s }
        }
        Err(e) => {
            debug!("OS probe failed for {}: {e}", image.display());
            UNKNOWN_OS.to_string()
        }
    };

    Ok(ResolvedRoot {
        handle: RootHandle::Scoped(dir),
        origin: Origin::ExtractedImage,
        os_description,
    })
}

/// Resolve a live process: no copy, no extraction; the scan operates
/// directly on the process's filesystem root.
pub fn resolve_pid(discovery: &Discovery, pid: i32) -> Result<ResolvedRoot, Error> {
    let proc = discovery.proc_table();
    // A process that vanished between discovery and resolution is
    // indistinguishable from one that never existed; both fold into
    // the same not-found error.
    if !proc.exists(pid) {
        return Err(Error::NoSuchProcess { pid });
    }

    let root = proc.root_dir(pid);
    if !root.join("etc").exists() {
        return Err(Error::RootNotAccessible {
            root: root.display().to_string(),
        });
    }

    let os_description = os_description_from_root(&root);

    Ok(ResolvedRoot {
        handle: RootHandle::Borrowed(root),
        origin: Origin::LiveProcess,
        os_description,
    })
}

/// Look a name pattern up in the process table. With multiple matches
/// the first by discovery order wins and the ambiguity is surfaced as
/// an informational note so the operator can disambiguate next time.
pub fn resolve_name_pattern(
    discovery: &Discovery,
    pattern: &str,
) -> Result<(i32, Option<String>), Error> {
    let matches = discovery.find_by_name(pattern)?;

    let Some(first) = matches.first() else {
        return Err(Error::TargetNotFound {
            pattern: pattern.to_string(),
        });
    };

    let note = if matches.len() > 1 {
        let pids: Vec<String> = matches.iter().map(|c| c.pid.to_string()).collect();
        Some(format!(
            "multiple containers match '{}' (PIDs {}); using first match (PID {})",
            pattern,
            pids.join(", "),
            first.pid
        ))
    } else {
        None
    };

    Ok((first.pid, note))
}

/// Caller-supplied context is assumed sufficient; no OS probing.
pub fn resolve_direct(path: &Path) -> Result<ResolvedRoot, Error> {
    let meta = fs::metadata(path)
        .map_err(|e| Error::io(format!("cannot access {}", path.display()), e))?;
    if !meta.is_dir() {
        return Err(Error::NotADirectory {
            path: path.display().to_string(),
        });
    }

    Ok(ResolvedRoot {
        handle: RootHandle::Borrowed(path.to_path_buf()),
        origin: Origin::Direct,
        os_description: String::new(),
    })
}

/// Build the OS description from the root's os-release file:
/// PRETTY_NAME preferred, NAME as fallback, `Linux unknown` when the
/// file is absent or carries neither.
pub fn os_description_from_root(root: &Path) -> String {
    let Ok(data) = fs::read_to_string(root.join("etc").join("os-release")) else {
        return UNKNOWN_OS.to_string();
    };

    for key in ["PRETTY_NAME=", "NAME="] {
        for line in data.lines() {
            if let Some(value) = line.strip_prefix(key) {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    return format!("Linux {value}");
                }
            }
        }
    }

    UNKNOWN_OS.to_string()
}
