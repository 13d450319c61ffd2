/*
 * SPDX-FileCopyrightText: 2025 The tabox developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Wrapper around the external AVB signing tool.
//!
//! All cryptographic operations are delegated to an `avbtool`-compatible
//! executable. tabox never parses or produces AVB binary structures itself;
//! the external tool is treated as the source of truth for signature
//! correctness and this module only speaks its CLI contract.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Output},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to spawn AVB tool: {0:?}")]
    Spawn(PathBuf, #[source] io::Error),
    #[error("avbtool {operation} failed with {status}: {stderr}")]
    CommandFailed {
        operation: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("avbtool {0} produced non-UTF-8 output")]
    NonUtf8Output(&'static str, #[source] std::string::FromUtf8Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Invocation prefix for the external AVB tool. This is either a native
/// `avbtool` executable or an interpreter plus the path to `avbtool.py`
/// (eg. `python3 tools/avbtool.py`).
#[derive(Clone, Debug)]
pub struct Avbtool {
    program: PathBuf,
    prefix_args: Vec<OsString>,
}

impl Avbtool {
    pub fn new<P, I, A>(program: P, prefix_args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            prefix_args: prefix_args.into_iter().map(Into::into).collect(),
        }
    }

    /// Run one avbtool operation to completion and capture its output.
    /// A nonzero exit is an error that carries the captured stderr.
    pub fn invoke(&self, operation: &'static str, args: &[OsString]) -> Result<Output> {
        let mut command = Command::new(&self.program);
        command.args(&self.prefix_args);
        command.arg(operation);
        command.args(args);

        debug!("Running: {command:?}");

        let output = command
            .output()
            .map_err(|e| Error::Spawn(self.program.clone(), e))?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                operation,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(output)
    }

    /// Run `info_image` and return the textual report.
    pub fn info_image(&self, image: &Path) -> Result<String> {
        let args = ["--image".into(), image.into()];
        let output = self.invoke("info_image", &args)?;

        String::from_utf8(output.stdout).map_err(|e| Error::NonUtf8Output("info_image", e))
    }

    /// Run `add_hash_footer` with prebuilt flag arguments. The tool mutates
    /// the image named by `--image` in place.
    pub fn add_hash_footer(&self, args: &[OsString]) -> Result<()> {
        self.invoke("add_hash_footer", args)?;

        Ok(())
    }

    /// Run `make_vbmeta_image` with prebuilt flag arguments. The tool writes
    /// the image named by `--output`.
    pub fn make_vbmeta_image(&self, args: &[OsString]) -> Result<()> {
        self.invoke("make_vbmeta_image", args)?;

        Ok(())
    }
}
