// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod cache;
pub mod config;
pub mod discovery;
mod errors;
pub mod output;
pub mod procfs;
pub mod reports;
pub mod resolver;
pub mod runtime;
pub mod scan;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_utils;

// Re-export the public API
pub use discovery::ContainerProcessInfo;
pub use errors::Error;
pub use reports::ScanResult;
pub use resolver::{Origin, ResolvedRoot, ScanTarget};
pub use runtime::{ContainerRuntime, detect_runtime};
pub use scan::{CancelHandle, CancelToken, ScanOptions, cancel_pair};
