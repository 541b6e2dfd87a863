// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use sha2::{Digest, Sha256};

use crate::errors::Error;
use crate::runtime::is_executable;

/// Explicit cache for the scanning-engine binary. No process-wide
/// state: callers own an instance and tests inject an isolated
/// directory per run. Installs are keyed by the payload's content
/// fingerprint and placed with an atomic rename, so concurrent first
/// users either install separately and converge, or observe a
/// consistent end state.
#[derive(Debug, Clone)]
pub struct EngineCache {
    dir: PathBuf,
}

impl EngineCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        EngineCache { dir: dir.into() }
    }

    /// `$XDG_CACHE_HOME/sifscan`, falling back to `~/.cache/sifscan`,
    /// then to the system temp directory.
    pub fn default_location() -> Self {
        let base = env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
            .unwrap_or_else(env::temp_dir);
        EngineCache {
            dir: base.join("sifscan"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Install the engine payload, reusing a previous install with the
    /// same fingerprint. The payload is written to a scratch file and
    /// renamed into place; when the rename fails across devices, a
    /// copy-and-remove takes over.
    pub fn install(&self, payload: &[u8]) -> Result<PathBuf, Error> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::io(format!("failed to create cache directory {}", self.dir.display()), e))?;

        let final_path = self.dir.join(format!("qscanner-{}", fingerprint(payload)));
        if is_executable(&final_path) {
            debug!("reusing cached engine at {}", final_path.display());
            return Ok(final_path);
        }

        let scratch = tempfile::Builder::new()
            .prefix("qscanner-install-")
            .tempfile_in(&self.dir)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(payload)?;
                Ok(f)
            })
            .map_err(|e| Error::io("failed to stage engine payload", e))?;

        set_executable(scratch.path())?;

        let (_, scratch_path) = scratch
            .keep()
            .map_err(|e| Error::io("failed to keep staged engine payload", e.error))?;

        if let Err(rename_err) = fs::rename(&scratch_path, &final_path) {
            debug!("rename into cache failed ({rename_err}), copying instead");
            fs::copy(&scratch_path, &final_path)
                .map_err(|e| Error::io("failed to copy engine into cache", e))?;
            set_executable(&final_path)?;
            let _ = fs::remove_file(&scratch_path);
        }

        Ok(final_path)
    }

    /// Install from an engine payload shipped on disk (a bundled
    /// distribution next to the wrapper, for example).
    pub fn install_from(&self, source: &Path) -> Result<PathBuf, Error> {
        let payload = fs::read(source)
            .map_err(|e| Error::io(format!("failed to read engine bundle {}", source.display()), e))?;
        self.install(&payload)
    }
}

fn fingerprint(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::io("failed to set executable permission", e))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<(), Error> {
    Ok(())
}
