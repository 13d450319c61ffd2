/*
 * SPDX-FileCopyrightText: 2025 The tabox developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

/// Get the non-empty parent of a path. If the path has no parent in the
/// string, then `.` is returned. This does not perform any filesystem
/// operations.
pub fn parent_path(path: &Path) -> &Path {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            return parent;
        }
    }

    Path::new(".")
}

/// Fail with [`io::ErrorKind::Interrupted`] if the cancel signal was raised.
/// Multi-step flows call this between subprocess invocations so that a ctrl-c
/// never leaves a half-patched output directory behind unnoticed.
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}
