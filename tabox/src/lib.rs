/*
 * SPDX-FileCopyrightText: 2025 The tabox developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! tabox is primarily an application, not a library. The semver versioning
//! covers the CLI only; all Rust APIs can change at any time, even in patch
//! releases.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod avbtool;
pub mod cli;
pub mod config;
pub mod patch;
pub mod util;
