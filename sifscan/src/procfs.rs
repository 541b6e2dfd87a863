// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Environment override for the proc root, in the spirit of HOST_PROC.
/// Lets tests (and containerized deployments that bind-mount the host's
/// /proc) point discovery at an arbitrary proc-shaped tree.
pub const PROC_ROOT_ENV: &str = "SIFSCAN_PROC_ROOT";

/// A view of a proc filesystem rooted at an explicit path. No state is
/// cached; every read reflects the current process table.
#[derive(Debug, Clone)]
pub struct ProcTable {
    root: PathBuf,
    overridden: bool,
}

impl ProcTable {
    /// The host's proc table, honoring the `SIFSCAN_PROC_ROOT` override.
    pub fn host() -> Self {
        match env::var(PROC_ROOT_ENV) {
            Ok(v) => ProcTable {
                root: v.into(),
                overridden: true,
            },
            Err(_) => ProcTable {
                root: "/proc".into(),
                overridden: false,
            },
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        ProcTable {
            root: root.into(),
            overridden: true,
        }
    }

    /// True when pointed somewhere other than the real /proc. Platform
    /// checks are skipped for overridden tables so tests run anywhere.
    pub fn is_overridden(&self) -> bool {
        self.overridden
    }

    /// All live PIDs, in directory order. Entries that are not numeric
    /// (self, net, sys, ...) are skipped.
    pub fn pids(&self) -> Result<Vec<i32>, io::Error> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && let Ok(pid) = name.parse::<i32>()
            {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    pub fn exists(&self, pid: i32) -> bool {
        self.root.join(pid.to_string()).exists()
    }

    /// The process's command line as a single display string. Proc packs
    /// arguments with null bytes and may leave trailing nulls if the
    /// process rewrote its own command line.
    pub fn cmdline(&self, pid: i32) -> Result<String, io::Error> {
        let path = self.root.join(pid.to_string()).join("cmdline");
        let mut raw = fs::read_to_string(path)?;
        let trim_len = raw.trim_end_matches('\0').len();
        raw.truncate(trim_len);
        Ok(raw.replace('\0', " "))
    }

    /// Owner of the process, from the proc directory's metadata.
    #[cfg(unix)]
    pub fn uid(&self, pid: i32) -> Result<u32, io::Error> {
        use std::os::unix::fs::MetadataExt;
        let meta = fs::metadata(self.root.join(pid.to_string()))?;
        Ok(meta.uid())
    }

    /// The filesystem root exposed for the process. For a containerized
    /// process this is the container's view, including any writable
    /// overlay modifications.
    pub fn root_dir(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string()).join("root")
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}
