// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::cache::EngineCache;
use crate::errors::Error;
use crate::runtime::lookup_path;

pub const TOKEN_ENV: &str = "QUALYS_ACCESS_TOKEN";
pub const POD_ENV: &str = "QUALYS_POD";
pub const SCAN_TYPES_ENV: &str = "SCAN_TYPES";
pub const OUTPUT_DIR_ENV: &str = "OUTPUT_DIR";

pub const DEFAULT_SCAN_TYPES: &str = "pkg,fileinsight";
pub const DEFAULT_MODE: &str = "get-report";
pub const DEFAULT_OUTPUT_DIR: &str = "./reports";

/// Name the engine is looked up under in PATH when neither an explicit
/// path nor a bundle is configured.
const ENGINE_BINARY_NAME: &str = "qscanner";

/// On-disk configuration, all fields optional. Unknown keys are
/// rejected so a typo fails loudly instead of silently falling back to
/// a default.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub qualys: QualysSection,
    pub defaults: DefaultsSection,
    pub engine: EngineSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualysSection {
    pub token: String,
    pub pod: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsSection {
    pub scan_types: String,
    pub mode: String,
    pub format: String,
    pub output_dir: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    pub path: Option<PathBuf>,
    pub bundle: Option<PathBuf>,
}

impl FileConfig {
    /// `$XDG_CONFIG_HOME/sifscan/config.yaml`, falling back to
    /// `~/.config/sifscan/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        let base = env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
        Some(base.join("sifscan").join("config.yaml"))
    }

    /// Load from `path` when given (missing file is an error), otherwise
    /// from the default location (missing file means empty config).
    pub fn load(path: Option<&Path>) -> Result<FileConfig, Error> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(FileConfig::default()),
            },
        };

        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config file at {}", path.display());
                return Ok(FileConfig::default());
            }
            Err(e) => {
                return Err(Error::io(
                    format!("failed to read config file {}", path.display()),
                    e,
                ));
            }
        };

        serde_yaml::from_str(&data).map_err(|e| Error::ConfigParse {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// Command-line values that participate in layering. `None` means the
/// flag was not given.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub token: Option<String>,
    pub pod: Option<String>,
    pub scan_types: Option<String>,
    pub mode: Option<String>,
    pub format: Option<String>,
    pub output_dir: Option<String>,
    pub engine: Option<PathBuf>,
}

/// The effective configuration after layering: flags over environment
/// over config file over built-in defaults. Computed once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub token: String,
    pub pod: String,
    pub scan_types: String,
    pub mode: String,
    pub format: String,
    pub output_dir: PathBuf,
    pub engine_path: Option<PathBuf>,
    pub engine_bundle: Option<PathBuf>,
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn layer(flag: Option<String>, env_name: &str, file: String, default: &str) -> String {
    flag.or_else(|| env_nonempty(env_name))
        .or_else(|| if file.is_empty() { None } else { Some(file) })
        .unwrap_or_else(|| default.to_string())
}

impl Settings {
    pub fn resolve(file: FileConfig, flags: Overrides) -> Settings {
        Settings {
            token: layer(flags.token, TOKEN_ENV, file.qualys.token, ""),
            pod: layer(flags.pod, POD_ENV, file.qualys.pod, ""),
            scan_types: layer(
                flags.scan_types,
                SCAN_TYPES_ENV,
                file.defaults.scan_types,
                DEFAULT_SCAN_TYPES,
            ),
            mode: flags
                .mode
                .or_else(|| {
                    if file.defaults.mode.is_empty() {
                        None
                    } else {
                        Some(file.defaults.mode)
                    }
                })
                .unwrap_or_else(|| DEFAULT_MODE.to_string()),
            format: flags.format.unwrap_or(file.defaults.format),
            output_dir: PathBuf::from(layer(
                flags.output_dir,
                OUTPUT_DIR_ENV,
                file.defaults.output_dir,
                DEFAULT_OUTPUT_DIR,
            )),
            engine_path: flags.engine.or(file.engine.path),
            engine_bundle: file.engine.bundle,
        }
    }

    /// Inventory-only mode runs entirely offline and needs no platform
    /// credentials.
    pub fn inventory_only(&self) -> bool {
        self.mode == "inventory-only"
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.inventory_only() {
            return Ok(());
        }
        if self.token.is_empty() {
            return Err(Error::MissingSetting("access token"));
        }
        if self.pod.is_empty() {
            return Err(Error::MissingSetting("platform pod"));
        }
        Ok(())
    }

    /// Locate the engine binary: an explicit path wins, then a
    /// configured bundle installed through the cache, then a PATH
    /// lookup.
    pub fn locate_engine(&self, cache: &EngineCache) -> Result<PathBuf, Error> {
        if let Some(path) = &self.engine_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(Error::io(
                format!("engine binary {}", path.display()),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        if let Some(bundle) = &self.engine_bundle {
            return cache.install_from(bundle);
        }

        lookup_path(ENGINE_BINARY_NAME).ok_or(Error::EngineNotFound)
    }
}
