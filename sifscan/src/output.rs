// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::collections::BTreeMap;
use std::fmt::Write;

use colored::Colorize;
use serde::Serialize;

use crate::discovery::ContainerProcessInfo;
use crate::reports::ScanResult;

/// Stable machine-readable view of a scan result. Raw engine output and
/// wall-clock timestamps stay out of it; consumers get the duration and
/// the classification, not the noise.
#[derive(Serialize)]
struct JsonResult<'a> {
    target: &'a str,
    target_type: &'a str,
    os: &'a str,
    exit_code: i32,
    #[serde(skip_serializing_if = "str::is_empty")]
    error: &'a str,
    duration_seconds: f64,
    reports: BTreeMap<&'a str, String>,
}

impl<'a> From<&'a ScanResult> for JsonResult<'a> {
    fn from(result: &'a ScanResult) -> Self {
        JsonResult {
            target: &result.target,
            target_type: result.target_type,
            os: &result.os_description,
            exit_code: result.exit_code,
            error: &result.error,
            duration_seconds: result.duration_seconds,
            reports: result
                .reports
                .iter()
                .map(|(format, path)| (format.as_str(), path.display().to_string()))
                .collect(),
        }
    }
}

/// A single result serializes as one object, a batch as an array.
pub fn results_json(results: &[ScanResult]) -> serde_json::Result<String> {
    match results {
        [only] => serde_json::to_string_pretty(&JsonResult::from(only)),
        many => {
            let views: Vec<JsonResult<'_>> = many.iter().map(JsonResult::from).collect();
            serde_json::to_string_pretty(&views)
        }
    }
}

pub fn results_table(results: &[ScanResult]) -> String {
    let mut out = String::new();
    for (i, result) in results.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }

        let status = if result.succeeded() {
            "SUCCESS".green().bold().to_string()
        } else {
            format!("FAILED (exit {})", result.exit_code).red().bold().to_string()
        };

        let _ = writeln!(out, "{}  {} ({})", "Target:".bold(), result.target, result.target_type);
        if !result.os_description.is_empty() {
            let _ = writeln!(out, "{}      {}", "OS:".bold(), result.os_description);
        }
        let _ = writeln!(out, "{}  {}", "Status:".bold(), status);
        let _ = writeln!(out, "{}  {:.1}s", "Elapsed:".bold(), result.duration_seconds);
        if !result.error.is_empty() {
            let _ = writeln!(out, "{}   {}", "Error:".bold(), result.error.red());
        }
        if !result.reports.is_empty() {
            let _ = writeln!(out, "{}", "Reports:".bold());
            for (format, path) in &result.reports {
                let _ = writeln!(out, "  {:<10} {}", format, path.display());
            }
        }
    }
    out
}

pub fn containers_json(containers: &[ContainerProcessInfo]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(containers)
}

pub fn containers_table(containers: &[ContainerProcessInfo]) -> String {
    if containers.is_empty() {
        return "no running containers found\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}",
        format!("{:<8} {:<12} {:<12} COMMAND", "PID", "USER", "ACCESS").bold()
    );
    for c in containers {
        let access = if c.accessible {
            "ok".green().to_string()
        } else {
            "denied".red().to_string()
        };
        let _ = writeln!(out, "{:<8} {:<12} {:<12} {}", c.pid, c.user, access, c.command);
    }
    out
}
