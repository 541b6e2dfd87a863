// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("container discovery only works on Linux")]
    PlatformUnsupported,

    #[error("could not enumerate processes: {0}")]
    Discovery(#[source] std::io::Error),

    #[error("neither apptainer nor singularity found in PATH")]
    RuntimeNotFound,

    #[error("{command} failed: {status} (stderr: {stderr})")]
    Execution {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("extraction produced no files in {dest}")]
    EmptyExtraction { dest: String },

    #[error("extraction failed: {context}")]
    Extraction {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no running container found matching: {pattern}")]
    TargetNotFound { pattern: String },

    #[error("process {pid} does not exist")]
    NoSuchProcess { pid: i32 },

    #[error("cannot access {root}: permission denied (try running as root or the same user)")]
    RootNotAccessible { root: String },

    #[error("SIF file not found: {path}")]
    ImageNotFound { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0} is required (flag, environment, or config file)")]
    MissingSetting(&'static str),

    #[error("scanning engine not found: no --engine path, no bundle, and no qscanner in PATH")]
    EngineNotFound,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}
