// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::fs;
use std::path::Path;

use crate::errors::Error;
use crate::runtime::ContainerRuntime;

pub(crate) fn write_proc_entry(proc_root: &Path, pid: i32, cmdline_args: &[&str]) {
    let dir = proc_root.join(pid.to_string());
    fs::create_dir_all(&dir).unwrap();
    let mut packed = cmdline_args.join("\0");
    packed.push('\0');
    fs::write(dir.join("cmdline"), packed).unwrap();
}

/// In-process stand-in for the detected container runtime. Extraction
/// writes a tiny but plausible root tree; exec plays back a canned
/// uname line.
pub(crate) struct FakeRuntime {
    uname: String,
    exec_fails: bool,
    extract_fails: bool,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        FakeRuntime {
            uname: "Linux fake 1.0".to_string(),
            exec_fails: false,
            extract_fails: false,
        }
    }

    pub(crate) fn with_uname(mut self, uname: &str) -> Self {
        self.uname = uname.to_string();
        self
    }

    pub(crate) fn with_failing_exec(mut self) -> Self {
        self.exec_fails = true;
        self
    }

    pub(crate) fn with_failing_extract(mut self) -> Self {
        self.extract_fails = true;
        self
    }
}

impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake-runtime"
    }

    async fn exec(&self, image: &Path, args: &[&str]) -> Result<Vec<u8>, Error> {
        if self.exec_fails {
            return Err(Error::Execution {
                command: format!("fake-runtime exec {} {}", image.display(), args.join(" ")),
                status: "exit status: 1".to_string(),
                stderr: "probe failed".to_string(),
            });
        }
        Ok(self.uname.clone().into_bytes())
    }

    async fn extract_filesystem(&self, _image: &Path, dest: &Path) -> Result<(), Error> {
        if self.extract_fails {
            return Err(Error::EmptyExtraction {
                dest: dest.display().to_string(),
            });
        }
        let etc = dest.join("etc");
        fs::create_dir_all(&etc).map_err(|e| Error::io("fake extract", e))?;
        fs::write(etc.join("os-release"), "PRETTY_NAME=\"Fake OS 1.0\"\n")
            .map_err(|e| Error::io("fake extract", e))?;
        fs::write(dest.join("fake-bin"), "#!/bin/sh\n").map_err(|e| Error::io("fake extract", e))?;
        Ok(())
    }
}
