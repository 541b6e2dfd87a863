// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use glob_match::glob_match;
use log::debug;
use time::OffsetDateTime;

/// Filename patterns identifying produced artifacts, per known format.
/// First pattern with a match wins for its format.
const REPORT_PATTERNS: &[(&str, &[&str])] = &[
    ("json", &["*.json"]),
    ("spdx", &["*spdx*.json", "*.spdx"]),
    ("cyclonedx", &["*cyclonedx*.json", "*cdx*.json"]),
    ("sarif", &["*.sarif", "*sarif*.json"]),
];

/// The normalized record of one scan attempt, uniform across all
/// resolution paths. Built once per attempt and immutable afterwards as
/// far as callers are concerned.
#[derive(Debug)]
pub struct ScanResult {
    pub target: String,
    pub target_type: &'static str,
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
    pub duration_seconds: f64,
    pub exit_code: i32,
    pub error: String,
    pub os_description: String,
    pub reports: BTreeMap<String, PathBuf>,
    /// Combined engine stdout+stderr, kept for diagnostics only and
    /// excluded from any serialized or shared output.
    pub raw_output: String,
}

impl ScanResult {
    pub fn started(target: String, target_type: &'static str) -> Self {
        let now = OffsetDateTime::now_utc();
        ScanResult {
            target,
            target_type,
            start_time: now,
            end_time: now,
            duration_seconds: 0.0,
            exit_code: 0,
            error: String::new(),
            os_description: String::new(),
            reports: BTreeMap::new(),
            raw_output: String::new(),
        }
    }

    pub(crate) fn finish(&mut self) {
        self.end_time = OffsetDateTime::now_utc();
        self.duration_seconds = (self.end_time - self.start_time).as_seconds_f64();
    }

    /// Record a wrapper-level failure. A non-empty error always carries
    /// a non-zero exit code; an engine-reported failure (non-zero exit,
    /// no wrapper error) sets `exit_code` directly instead.
    pub(crate) fn record_error(&mut self, exit_code: i32, error: impl Into<String>) {
        self.exit_code = if exit_code != 0 { exit_code } else { 1 };
        self.error = error.into();
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Walk the output directory and identify produced artifacts by
/// filename pattern. Missing formats are simply absent; the engine may
/// have been configured to skip them. An unreadable directory yields an
/// empty mapping, never an error.
pub fn find_reports(output_dir: &Path) -> BTreeMap<String, PathBuf> {
    let mut reports = BTreeMap::new();

    let Ok(entries) = fs::read_dir(output_dir) else {
        debug!("output directory {} not readable", output_dir.display());
        return reports;
    };

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .collect();
    names.sort();

    for (format, patterns) in REPORT_PATTERNS {
        'format: for pattern in *patterns {
            for name in &names {
                if glob_match(pattern, name) {
                    reports.insert(format.to_string(), output_dir.join(name));
                    break 'format;
                }
            }
        }
    }

    reports
}
