// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::PathBuf;

use log::debug;
use serde::Serialize;

use crate::errors::Error;
use crate::procfs::ProcTable;

const CMDLINE_DISPLAY_LEN: usize = 200;

/// A live process recognized as a container-runtime instance. Produced
/// fresh on every discovery call; the process table is transient, so
/// nothing here is ever cached.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerProcessInfo {
    pub pid: i32,
    pub user: String,
    pub command: String,
    pub accessible: bool,
    pub rootfs: PathBuf,
}

/// One rule of the runtime-signature heuristic: the command line must
/// contain one of `names` and one of `markers` (both lowercase). The
/// rule set is data, so new runtime signatures are added here without
/// touching the discovery loop.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub names: &'static [&'static str],
    pub markers: &'static [&'static str],
}

impl Signature {
    fn matches(&self, lower_cmdline: &str) -> bool {
        self.names.iter().any(|n| lower_cmdline.contains(n))
            && self.markers.iter().any(|m| lower_cmdline.contains(m))
    }
}

/// Best-effort by construction: unusual invocations will be missed, and
/// unrelated processes can rarely be misclassified. Missing a container
/// is preferred over pointing an operator at the wrong process.
pub const DEFAULT_SIGNATURES: &[Signature] = &[
    // Runtime CLI with an active subcommand.
    Signature {
        names: &["apptainer", "singularity"],
        markers: &[" run ", " exec ", " shell ", " instance "],
    },
    // The privileged launcher does not carry the runtime name in argv[0],
    // so accept it together with an image suffix or a runtime token.
    Signature {
        names: &["starter-suid", "starter"],
        markers: &[".sif", "singularity", "apptainer"],
    },
];

pub struct Discovery {
    proc: ProcTable,
    signatures: &'static [Signature],
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    pub fn new() -> Self {
        Discovery {
            proc: ProcTable::host(),
            signatures: DEFAULT_SIGNATURES,
        }
    }

    pub fn with_proc_table(proc: ProcTable) -> Self {
        Discovery {
            proc,
            signatures: DEFAULT_SIGNATURES,
        }
    }

    pub fn proc_table(&self) -> &ProcTable {
        &self.proc
    }

    /// Walk the process table and report every process matching the
    /// runtime-signature heuristic. Processes whose metadata cannot be
    /// read (permission denied, vanished mid-scan) are skipped silently;
    /// partial visibility is normal on multi-tenant hosts.
    pub fn list_containers(&self) -> Result<Vec<ContainerProcessInfo>, Error> {
        if !self.proc.is_overridden() && !cfg!(target_os = "linux") {
            return Err(Error::PlatformUnsupported);
        }

        let pids = self.proc.pids().map_err(Error::Discovery)?;

        let mut containers = Vec::new();
        for pid in pids {
            let Ok(cmdline) = self.proc.cmdline(pid) else {
                continue;
            };
            if cmdline.is_empty() {
                continue;
            }

            let lower = cmdline.to_lowercase();
            if !self.signatures.iter().any(|sig| sig.matches(&lower)) {
                continue;
            }

            let rootfs = self.proc.root_dir(pid);
            let accessible = rootfs.join("etc").exists();
            debug!("container candidate pid={pid} accessible={accessible}");

            containers.push(ContainerProcessInfo {
                pid,
                user: self.username_for(pid),
                command: truncate_display(&cmdline, CMDLINE_DISPLAY_LEN),
                accessible,
                rootfs,
            });
        }

        Ok(containers)
    }

    /// Case-insensitive substring match against the candidates' command
    /// lines. An empty result means "not found"; enumeration failure is
    /// the only error path.
    pub fn find_by_name(&self, pattern: &str) -> Result<Vec<ContainerProcessInfo>, Error> {
        let pattern = pattern.to_lowercase();
        let matches = self
            .list_containers()?
            .into_iter()
            .filter(|c| c.command.to_lowercase().contains(&pattern))
            .collect();
        Ok(matches)
    }

    #[cfg(unix)]
    fn username_for(&self, pid: i32) -> String {
        self.proc
            .uid(pid)
            .ok()
            .and_then(|uid| uzers::get_user_by_uid(uid))
            .and_then(|u| u.name().to_str().map(String::from))
            .unwrap_or_else(|| "unknown".to_string())
    }

    #[cfg(not(unix))]
    fn username_for(&self, _pid: i32) -> String {
        "unknown".to_string()
    }
}

fn truncate_display(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
