/*
 * SPDX-FileCopyrightText: 2025 The tabox developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tempfile::TempDir;

use crate::{
    cli::{status, warning},
    config::Config,
    patch::{
        avb::{VBMETA_PADDING_SIZE, apply_hash_footer, extract_info, rebuild_vbmeta},
        region::{COUNTRY_CODES, PatchOutcome, detect_region_code, patch_region_code,
            patch_vendor_boot},
    },
    util,
};

fn read_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read image: {path:?}"))
}

fn write_image(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("Failed to write image: {path:?}"))
}

fn detect_subcommand(cli: &DetectCli) -> Result<()> {
    for path in &cli.input {
        let data = read_image(path)?;

        match detect_region_code(&data) {
            Some(code) => {
                let name = COUNTRY_CODES.get(code).copied().unwrap_or("unknown");
                status!("{path:?}: region {code} ({name})");
            }
            None => {
                warning!("{path:?}: no known region marker found");
            }
        }
    }

    Ok(())
}

fn patch_subcommand(cli: &PatchCli) -> Result<()> {
    let code = cli.code.to_ascii_uppercase();
    if !COUNTRY_CODES.contains_key(code.as_str()) {
        bail!("Unknown region code: {code}");
    }

    let mut data = read_image(&cli.input)?;

    let current = match &cli.current {
        Some(c) => c.to_ascii_uppercase(),
        None => match detect_region_code(&data) {
            Some(c) => c.to_owned(),
            None => bail!("No known region marker found in: {:?}", cli.input),
        },
    };

    match patch_region_code(&mut data, &current, &code)? {
        PatchOutcome::Patched { count } => {
            status!("Replaced {count} region marker(s): {current} -> {code}");
        }
        PatchOutcome::AlreadyTarget => {
            status!("Image already carries region {code}");
        }
        PatchOutcome::NotFound => {
            bail!("No region marker for {current} found in: {:?}", cli.input);
        }
    }

    write_image(&cli.output, &data)?;

    status!("Wrote patched image: {:?}", cli.output);

    Ok(())
}

fn convert_subcommand(cli: &ConvertCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    let avbtool = config.avbtool();
    let keys = config.key_map();

    fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output_dir))?;

    // Stage inside the output directory so the final renames never cross a
    // filesystem boundary.
    let staging = TempDir::new_in(&cli.output_dir)
        .with_context(|| format!("Failed to create staging directory in: {:?}", cli.output_dir))?;

    status!("Patching region magic in: {:?}", cli.vendor_boot);

    let mut data = read_image(&cli.vendor_boot)?;

    match patch_vendor_boot(&mut data) {
        PatchOutcome::Patched { count } => {
            status!("Replaced {count} ROW magic occurrence(s) with PRC");
        }
        PatchOutcome::AlreadyTarget => {
            status!("Image already carries PRC region magic");
        }
        PatchOutcome::NotFound => {
            bail!("No region magic found in: {:?}", cli.vendor_boot);
        }
    }

    let staged_vendor_boot = staging.path().join("vendor_boot.img");
    write_image(&staged_vendor_boot, &data)?;

    util::check_cancel(cancel_signal)?;

    status!("Re-adding hash footer to patched vendor_boot");

    let mut info = extract_info(&avbtool, &cli.vendor_boot)
        .with_context(|| format!("Failed to inspect image: {:?}", cli.vendor_boot))?;

    // Dumps taken without the surrounding partition report no total image
    // size; fall back to the payload size.
    if info.partition_size.is_none() {
        info.partition_size = info.data_size;
    }

    // The footer is left unsigned. Trust for vendor_boot comes from its hash
    // descriptor in the rebuilt vbmeta, not from its own signature.
    apply_hash_footer(&avbtool, &staged_vendor_boot, &info, None, None)
        .context("Failed to re-add vendor_boot hash footer")?;

    util::check_cancel(cancel_signal)?;

    status!("Rebuilding vbmeta around patched vendor_boot");

    let staged_vbmeta = staging.path().join("vbmeta.img");

    rebuild_vbmeta(
        &avbtool,
        &keys,
        &staged_vbmeta,
        &cli.vbmeta,
        std::slice::from_ref(&staged_vendor_boot),
        VBMETA_PADDING_SIZE,
    )
    .with_context(|| format!("Failed to rebuild vbmeta image: {:?}", cli.vbmeta))?;

    let final_vendor_boot = cli.output_dir.join("vendor_boot.img");
    let final_vbmeta = cli.output_dir.join("vbmeta.img");

    fs::rename(&staged_vendor_boot, &final_vendor_boot)
        .with_context(|| format!("Failed to move into place: {final_vendor_boot:?}"))?;
    fs::rename(&staged_vbmeta, &final_vbmeta)
        .with_context(|| format!("Failed to move into place: {final_vbmeta:?}"))?;

    status!("Converted images ready in: {:?}", cli.output_dir);

    Ok(())
}

pub fn region_main(cli: &RegionCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        RegionCommand::Detect(c) => detect_subcommand(c),
        RegionCommand::Patch(c) => patch_subcommand(c),
        RegionCommand::Convert(c) => convert_subcommand(c, config, cancel_signal),
    }
}

/// Detect the region code embedded in devinfo/persist images.
#[derive(Debug, Parser)]
struct DetectCli {
    /// Paths to input images.
    #[arg(short, long, value_name = "FILE", value_parser, required = true)]
    input: Vec<PathBuf>,
}

/// Swap the region code marker in a devinfo/persist image.
#[derive(Debug, Parser)]
struct PatchCli {
    /// Path to input image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Region code to patch in (two letters, eg. CN).
    #[arg(short, long, value_name = "CODE")]
    code: String,

    /// Region code currently in the image. Auto-detected if not given.
    #[arg(long, value_name = "CODE")]
    current: Option<String>,
}

/// Convert a ROW vendor_boot to PRC and rebuild the vbmeta chain.
///
/// The vendor_boot payload is byte-patched, re-footered with its original
/// AVB metadata, and a new top-level vbmeta is generated that keeps the
/// original's descriptors except for the patched vendor_boot's.
#[derive(Debug, Parser)]
struct ConvertCli {
    /// Path to the original vendor_boot image.
    #[arg(long, value_name = "FILE", value_parser)]
    vendor_boot: PathBuf,

    /// Path to the original vbmeta image.
    #[arg(long, value_name = "FILE", value_parser)]
    vbmeta: PathBuf,

    /// Path to the output directory for converted images.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RegionCommand {
    Detect(DetectCli),
    Patch(PatchCli),
    Convert(ConvertCli),
}

/// Detect and convert device region restrictions.
#[derive(Debug, Parser)]
pub struct RegionCli {
    #[command(subcommand)]
    command: RegionCommand,
}
