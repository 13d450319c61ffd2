/*
 * SPDX-FileCopyrightText: 2025 The tabox developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Rollback index reconciliation for AVB-signed boot chain images.
//!
//! The bootloader refuses to verify an image whose embedded rollback index is
//! below the value it has provisioned. When new firmware carries a different
//! index than the device, the affected images have to be re-signed at the
//! provisioned index with the matching test key while keeping every other
//! piece of signed metadata intact, so that the vbmeta descriptors referencing
//! them still form a coherent chain.

use std::{
    ffi::OsString,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    avbtool::{self, Avbtool},
    config::KeyMap,
};

/// Padding size used when regenerating a top-level vbmeta image. Matches the
/// alignment of the factory images.
pub const VBMETA_PADDING_SIZE: u64 = 8192;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing AVB field {field:?} in {path:?}")]
    MissingField { field: &'static str, path: PathBuf },
    #[error("No private key known for public key fingerprint {fingerprint} in {path:?}")]
    UnknownKey { fingerprint: String, path: PathBuf },
    #[error("AVB tool error")]
    Avbtool(#[from] avbtool::Error),
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

static PARTITION_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Image size:\s*(\d+)\s*bytes").unwrap());
static DATA_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Original image size:\s*(\d+)\s*bytes").unwrap());
static DESC_DATA_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s+Image Size:\s*(\d+)\s*bytes").unwrap());
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Partition Name:\s*(\S+)").unwrap());
static SALT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Salt:\s*([0-9a-fA-F]+)").unwrap());
static ALGORITHM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Algorithm:\s*(\S+)").unwrap());
static PUBKEY_SHA1_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Public key \(sha1\):\s*([0-9a-fA-F]+)").unwrap());
static ROLLBACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Rollback Index:\s*(\d+)").unwrap());
static FLAGS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Flags:\s*(\d+)").unwrap());
static PROP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Prop:\s*(\S+)\s*->\s*'(.*)'").unwrap());

/// A single AVB property descriptor (`Prop: <key> -> '<value>'`).
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Property {
    pub key: String,
    pub value: String,
}

/// Structured result of inspecting one signed partition image.
///
/// All fields are optional at this level because a blank or corrupt image
/// yields a partial report. The patch entry points validate the fields they
/// actually need before using the record to re-sign anything.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct ImageAvbInfo {
    /// Bytes reserved for the partition, including the footer.
    pub partition_size: Option<u64>,
    /// Bytes of payload before the footer.
    pub data_size: Option<u64>,
    /// AVB partition name recorded in the footer or descriptor.
    pub name: Option<String>,
    /// Salt of the original hash/hashtree descriptor, as lowercase hex.
    pub salt: Option<String>,
    /// Signing algorithm identifier, eg. `SHA256_RSA4096`.
    pub algorithm: Option<String>,
    /// Rollback index embedded in the vbmeta header.
    pub rollback: Option<u64>,
    /// vbmeta header flags bitmask. Absence means the flags must not be
    /// altered on re-sign.
    pub flags: Option<u64>,
    /// SHA-1 fingerprint of the embedded public key. Absent for unsigned
    /// images that are only vouched for by a chain descriptor.
    pub pubkey_sha1: Option<String>,
    /// Custom AVB properties in report order. Some downstream consumers are
    /// positionally sensitive, so insertion order is preserved.
    pub properties: Vec<Property>,
}

fn capture_u64(re: &Regex, text: &str) -> Option<u64> {
    re.captures(text).and_then(|c| c[1].parse().ok())
}

fn capture_string(re: &Regex, text: &str) -> Option<String> {
    re.captures(text).map(|c| c[1].to_owned())
}

/// Parse the textual report produced by `avbtool info_image`.
pub fn parse_info_report(report: &str) -> ImageAvbInfo {
    // Rollback index and flags also appear inside descriptor sections, so
    // those two are only matched against the header portion of the report.
    let header = report
        .split_once("Descriptors:")
        .map_or(report, |(header, _)| header);

    // Appended images report the payload size as "Original image size".
    // Images without a footer only carry the descriptor's "Image Size".
    let data_size = capture_u64(&DATA_SIZE_RE, report)
        .or_else(|| capture_u64(&DESC_DATA_SIZE_RE, report));

    let properties = PROP_RE
        .captures_iter(report)
        .map(|c| Property {
            key: c[1].to_owned(),
            value: c[2].to_owned(),
        })
        .collect();

    ImageAvbInfo {
        partition_size: capture_u64(&PARTITION_SIZE_RE, report),
        data_size,
        name: capture_string(&NAME_RE, report),
        salt: capture_string(&SALT_RE, report),
        algorithm: capture_string(&ALGORITHM_RE, report),
        rollback: capture_u64(&ROLLBACK_RE, header),
        flags: capture_u64(&FLAGS_RE, header),
        pubkey_sha1: capture_string(&PUBKEY_SHA1_RE, report),
        properties,
    }
}

/// Inspect a signed image via the external tool. Tool failures propagate
/// unchanged; fields that are absent from the report are left as `None`.
pub fn extract_info(avbtool: &Avbtool, image: &Path) -> Result<ImageAvbInfo> {
    let report = avbtool.info_image(image)?;
    let info = parse_info_report(&report);

    debug!("AVB info for {image:?}: {info:?}");

    Ok(info)
}

fn require<'a, T>(field: &'a Option<T>, name: &'static str, path: &Path) -> Result<&'a T> {
    field.as_ref().ok_or_else(|| Error::MissingField {
        field: name,
        path: path.to_owned(),
    })
}

fn resolve_key<'a>(keys: &'a KeyMap, fingerprint: &str, path: &Path) -> Result<&'a Path> {
    keys.get(fingerprint).ok_or_else(|| Error::UnknownKey {
        fingerprint: fingerprint.to_owned(),
        path: path.to_owned(),
    })
}

fn copy_image(source: &Path, target: &Path) -> Result<()> {
    fs::copy(source, target).map_err(|e| Error::File(target.to_owned(), e))?;

    Ok(())
}

/// Append a new hash footer to `image` in place, re-using the original
/// metadata from `info` except for the rollback index when an override is
/// given.
///
/// When `key` is `None`, the footer is left unsigned (no `--key` and no
/// `--algorithm`); this is only valid for images whose trust comes from a
/// descriptor in a rebuilt vbmeta rather than their own signature.
pub fn apply_hash_footer(
    avbtool: &Avbtool,
    image: &Path,
    info: &ImageAvbInfo,
    key: Option<&Path>,
    override_rollback: Option<u64>,
) -> Result<()> {
    let rollback = match override_rollback {
        Some(index) => index,
        None => *require(&info.rollback, "rollback", image)?,
    };
    let partition_size = require(&info.partition_size, "partition_size", image)?;
    let name = require(&info.name, "name", image)?;
    let salt = require(&info.salt, "salt", image)?;

    debug!(
        "Adding hash footer to {image:?}: partition {name:?}, rollback index {rollback}, \
         {} properties",
        info.properties.len(),
    );

    let mut args: Vec<OsString> = vec!["--image".into(), image.into()];

    if let Some(key) = key {
        let algorithm = require(&info.algorithm, "algorithm", image)?;

        args.push("--key".into());
        args.push(key.into());
        args.push("--algorithm".into());
        args.push(algorithm.into());
    }

    args.push("--partition_size".into());
    args.push(partition_size.to_string().into());
    args.push("--partition_name".into());
    args.push(name.into());
    args.push("--rollback_index".into());
    args.push(rollback.to_string().into());
    args.push("--salt".into());
    args.push(salt.into());

    for property in &info.properties {
        args.push("--prop".into());
        args.push(format!("{}:{}", property.key, property.value).into());
    }

    // Omitting the original flags would change verified boot enforcement
    // behavior on the device, so they are propagated whenever present.
    if let Some(flags) = info.flags {
        args.push("--flags".into());
        args.push(flags.to_string().into());
    }

    Ok(avbtool.add_hash_footer(&args)?)
}

/// Bring a hash-footer-signed boot chain image (eg. `boot`) in line with the
/// rollback index the device currently trusts.
///
/// If the candidate already carries exactly `current_index`, it is copied to
/// `output` unmodified. Otherwise the candidate is pinned to `current_index`
/// by re-signing it with the test key matching its embedded public key,
/// preserving all other signed metadata.
pub fn patch_chained_image(
    avbtool: &Avbtool,
    keys: &KeyMap,
    label: &str,
    current_index: u64,
    new_image: &Path,
    output: &Path,
) -> Result<()> {
    let info = extract_info(avbtool, new_image)?;
    let new_index = info.rollback.unwrap_or(0);

    debug!("{label}: candidate rollback index {new_index}, provisioned {current_index}");

    if new_index == current_index {
        return copy_image(new_image, output);
    }

    require(&info.partition_size, "partition_size", new_image)?;
    require(&info.name, "name", new_image)?;
    require(&info.salt, "salt", new_image)?;
    require(&info.algorithm, "algorithm", new_image)?;
    let fingerprint = require(&info.pubkey_sha1, "pubkey_sha1", new_image)?;
    let key = resolve_key(keys, fingerprint, new_image)?;

    copy_image(new_image, output)?;

    apply_hash_footer(avbtool, output, &info, Some(key), Some(current_index))
}

/// Bring a vbmeta-class image (eg. `vbmeta_system`) in line with the rollback
/// index the device currently trusts.
///
/// vbmeta partitions are pure metadata containers without a footer of their
/// own, so instead of patching in place, the image is regenerated wholesale
/// with its original descriptors copied over.
pub fn patch_vbmeta_image(
    avbtool: &Avbtool,
    keys: &KeyMap,
    label: &str,
    current_index: u64,
    new_image: &Path,
    output: &Path,
) -> Result<()> {
    let info = extract_info(avbtool, new_image)?;
    let new_index = info.rollback.unwrap_or(0);

    debug!("{label}: candidate rollback index {new_index}, provisioned {current_index}");

    if new_index == current_index {
        return copy_image(new_image, output);
    }

    let algorithm = require(&info.algorithm, "algorithm", new_image)?;
    let fingerprint = require(&info.pubkey_sha1, "pubkey_sha1", new_image)?;
    let key = resolve_key(keys, fingerprint, new_image)?;

    let args: Vec<OsString> = vec![
        "--output".into(),
        output.into(),
        "--key".into(),
        key.into(),
        "--algorithm".into(),
        algorithm.into(),
        "--rollback_index".into(),
        current_index.to_string().into(),
        "--flags".into(),
        info.flags.unwrap_or(0).to_string().into(),
        "--include_descriptors_from_image".into(),
        new_image.into(),
    ];

    Ok(avbtool.make_vbmeta_image(&args)?)
}

/// Rebuild a top-level vbmeta image so that it describes one or more modified
/// chained images while keeping the untouched descriptors from the original.
///
/// Descriptors are included from `original_vbmeta` first and then from each
/// image in `chained_images` in order. For a partition described by both, the
/// later argument supersedes the stale descriptor copied from the original;
/// this ordering is what lets a re-signed `vendor_boot` take precedence.
pub fn rebuild_vbmeta(
    avbtool: &Avbtool,
    keys: &KeyMap,
    output: &Path,
    original_vbmeta: &Path,
    chained_images: &[PathBuf],
    padding_size: u64,
) -> Result<()> {
    let info = extract_info(avbtool, original_vbmeta)?;

    let algorithm = require(&info.algorithm, "algorithm", original_vbmeta)?;
    let fingerprint = require(&info.pubkey_sha1, "pubkey_sha1", original_vbmeta)?;
    let key = resolve_key(keys, fingerprint, original_vbmeta)?;

    let mut args: Vec<OsString> = vec![
        "--output".into(),
        output.into(),
        "--key".into(),
        key.into(),
        "--algorithm".into(),
        algorithm.into(),
        "--padding_size".into(),
        padding_size.to_string().into(),
        "--flags".into(),
        info.flags.unwrap_or(0).to_string().into(),
        "--rollback_index".into(),
        info.rollback.unwrap_or(0).to_string().into(),
        "--include_descriptors_from_image".into(),
        original_vbmeta.into(),
    ];

    for image in chained_images {
        args.push("--include_descriptors_from_image".into());
        args.push(image.into());
    }

    Ok(avbtool.make_vbmeta_image(&args)?)
}

/// Outcome of comparing device-provisioned rollback indices against a
/// candidate firmware's images.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RollbackStatus {
    /// Indices are equal; no patch required.
    Match,
    /// Indices differ; the candidate images must be re-signed at the
    /// provisioned indices before flashing.
    NeedsPatch,
    /// Candidate image files are absent; a patch cannot proceed.
    MissingNew,
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Match => "MATCH",
            Self::NeedsPatch => "NEEDS_PATCH",
            Self::MissingNew => "MISSING_NEW",
        };

        f.write_str(status)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RollbackComparison {
    pub status: RollbackStatus,
    /// Rollback index provisioned for `boot`, from the dumped image.
    pub boot_index: u64,
    /// Rollback index provisioned for the vbmeta partition, from the dumped
    /// image.
    pub vbmeta_index: u64,
}

/// Compare the rollback indices of freshly dumped device images against a
/// candidate firmware's images.
///
/// The result is never cached across device sessions; the device's actual
/// indices can change between runs, so every flashing attempt starts with a
/// fresh read. Extraction failure on either side is an error, not a status.
pub fn compare_rollback(
    avbtool: &Avbtool,
    dumped_boot: &Path,
    dumped_vbmeta: &Path,
    new_boot: &Path,
    new_vbmeta: &Path,
) -> Result<RollbackComparison> {
    let boot_index = extract_info(avbtool, dumped_boot)?.rollback.unwrap_or(0);
    let vbmeta_index = extract_info(avbtool, dumped_vbmeta)?.rollback.unwrap_or(0);

    debug!("Provisioned rollback indices: boot {boot_index}, vbmeta {vbmeta_index}");

    if !new_boot.exists() || !new_vbmeta.exists() {
        return Ok(RollbackComparison {
            status: RollbackStatus::MissingNew,
            boot_index: 0,
            vbmeta_index: 0,
        });
    }

    let new_boot_index = extract_info(avbtool, new_boot)?.rollback.unwrap_or(0);
    let new_vbmeta_index = extract_info(avbtool, new_vbmeta)?.rollback.unwrap_or(0);

    debug!("Candidate rollback indices: boot {new_boot_index}, vbmeta {new_vbmeta_index}");

    let status = if new_boot_index == boot_index && new_vbmeta_index == vbmeta_index {
        RollbackStatus::Match
    } else {
        RollbackStatus::NeedsPatch
    };

    Ok(RollbackComparison {
        status,
        boot_index,
        vbmeta_index,
    })
}
