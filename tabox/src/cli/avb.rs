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
use clap::{Args, Parser, Subcommand};

use crate::{
    cli::{status, warning},
    config::Config,
    patch::avb::{
        RollbackStatus, VBMETA_PADDING_SIZE, compare_rollback, extract_info, patch_chained_image,
        patch_vbmeta_image, rebuild_vbmeta,
    },
    util,
};

fn image_label(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image")
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    let parent = util::parent_path(path);
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {parent:?}"))?;

    Ok(())
}

fn info_subcommand(cli: &InfoCli, config: &Config) -> Result<()> {
    let avbtool = config.avbtool();
    let info = extract_info(&avbtool, &cli.input)
        .with_context(|| format!("Failed to inspect image: {:?}", cli.input))?;

    println!("{info:#?}");

    Ok(())
}

fn compare_subcommand(cli: &CompareCli, config: &Config) -> Result<()> {
    let avbtool = config.avbtool();
    let new_boot = cli.new_dir.join("boot.img");
    let new_vbmeta = cli.new_dir.join("vbmeta_system.img");

    let comparison = match compare_rollback(
        &avbtool,
        &cli.dumps.boot_dump,
        &cli.dumps.vbmeta_dump,
        &new_boot,
        &new_vbmeta,
    ) {
        Ok(c) => c,
        Err(e) => {
            warning!("Rollback comparison result: ERROR");
            return Err(e).context("Failed to compare rollback indices");
        }
    };

    match comparison.status {
        RollbackStatus::Match | RollbackStatus::NeedsPatch => {
            status!(
                "Provisioned rollback indices: boot {}, vbmeta {}",
                comparison.boot_index,
                comparison.vbmeta_index,
            );
        }
        RollbackStatus::MissingNew => {
            warning!("Candidate firmware images not found in: {:?}", cli.new_dir);
        }
    }

    status!("Rollback comparison result: {}", comparison.status);

    Ok(())
}

fn patch_rollback_subcommand(
    cli: &PatchRollbackCli,
    config: &Config,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let avbtool = config.avbtool();
    let keys = config.key_map();
    let new_boot = cli.new_dir.join("boot.img");
    let new_vbmeta = cli.new_dir.join("vbmeta_system.img");

    let comparison = compare_rollback(
        &avbtool,
        &cli.dumps.boot_dump,
        &cli.dumps.vbmeta_dump,
        &new_boot,
        &new_vbmeta,
    )
    .context("Failed to compare rollback indices")?;

    match comparison.status {
        RollbackStatus::Match => {
            status!("Rollback indices already match; nothing to patch");
            return Ok(());
        }
        RollbackStatus::MissingNew => {
            bail!("Candidate firmware images not found in: {:?}", cli.new_dir);
        }
        RollbackStatus::NeedsPatch => {}
    }

    status!(
        "Patching candidate images to rollback indices: boot {}, vbmeta {}",
        comparison.boot_index,
        comparison.vbmeta_index,
    );

    // Start from an empty directory so a previous run's output can never be
    // mistaken for this one's.
    if cli.output.exists() {
        fs::remove_dir_all(&cli.output)
            .with_context(|| format!("Failed to remove directory: {:?}", cli.output))?;
    }
    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output))?;

    let result = (|| -> Result<()> {
        patch_chained_image(
            &avbtool,
            &keys,
            "boot",
            comparison.boot_index,
            &new_boot,
            &cli.output.join("boot.img"),
        )
        .context("Failed to patch boot image")?;

        util::check_cancel(cancel_signal)?;

        patch_vbmeta_image(
            &avbtool,
            &keys,
            "vbmeta_system",
            comparison.vbmeta_index,
            &new_vbmeta,
            &cli.output.join("vbmeta_system.img"),
        )
        .context("Failed to patch vbmeta_system image")?;

        Ok(())
    })();

    // A partially written output set is unusable; do not leave it around.
    if result.is_err() {
        let _ = fs::remove_dir_all(&cli.output);
        return result;
    }

    status!("Patched images ready in: {:?}", cli.output);

    Ok(())
}

fn patch_chained_subcommand(cli: &PatchChainedCli, config: &Config) -> Result<()> {
    let avbtool = config.avbtool();
    let keys = config.key_map();
    let label = image_label(&cli.input);

    ensure_parent_dir(&cli.output)?;

    patch_chained_image(
        &avbtool,
        &keys,
        label,
        cli.rollback_index,
        &cli.input,
        &cli.output,
    )
    .with_context(|| format!("Failed to patch image: {:?}", cli.input))?;

    status!("Wrote patched image: {:?}", cli.output);

    Ok(())
}

fn patch_vbmeta_subcommand(cli: &PatchVbmetaCli, config: &Config) -> Result<()> {
    let avbtool = config.avbtool();
    let keys = config.key_map();
    let label = image_label(&cli.input);

    ensure_parent_dir(&cli.output)?;

    patch_vbmeta_image(
        &avbtool,
        &keys,
        label,
        cli.rollback_index,
        &cli.input,
        &cli.output,
    )
    .with_context(|| format!("Failed to patch vbmeta image: {:?}", cli.input))?;

    status!("Wrote patched image: {:?}", cli.output);

    Ok(())
}

fn rebuild_subcommand(cli: &RebuildCli, config: &Config) -> Result<()> {
    let avbtool = config.avbtool();
    let keys = config.key_map();

    ensure_parent_dir(&cli.output)?;

    rebuild_vbmeta(
        &avbtool,
        &keys,
        &cli.output,
        &cli.input,
        &cli.include,
        cli.padding_size,
    )
    .with_context(|| format!("Failed to rebuild vbmeta image: {:?}", cli.input))?;

    status!("Wrote rebuilt vbmeta image: {:?}", cli.output);

    Ok(())
}

pub fn avb_main(cli: &AvbCli, config: &Config, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        AvbCommand::Info(c) => info_subcommand(c, config),
        AvbCommand::Compare(c) => compare_subcommand(c, config),
        AvbCommand::PatchRollback(c) => patch_rollback_subcommand(c, config, cancel_signal),
        AvbCommand::PatchChained(c) => patch_chained_subcommand(c, config),
        AvbCommand::PatchVbmeta(c) => patch_vbmeta_subcommand(c, config),
        AvbCommand::Rebuild(c) => rebuild_subcommand(c, config),
    }
}

#[derive(Debug, Args)]
struct DumpGroup {
    /// Path to the boot image dumped from the device.
    #[arg(long, value_name = "FILE", value_parser)]
    boot_dump: PathBuf,

    /// Path to the vbmeta image dumped from the device.
    #[arg(long, value_name = "FILE", value_parser)]
    vbmeta_dump: PathBuf,
}

/// Display AVB metadata extracted from a signed image.
#[derive(Debug, Parser)]
struct InfoCli {
    /// Path to input AVB image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Compare device-provisioned rollback indices against candidate firmware.
///
/// The provisioned indices are read from freshly dumped boot and vbmeta
/// images; the candidates are `boot.img` and `vbmeta_system.img` inside the
/// firmware directory. The result is MATCH, NEEDS_PATCH, or MISSING_NEW.
#[derive(Debug, Parser)]
struct CompareCli {
    #[command(flatten)]
    dumps: DumpGroup,

    /// Path to the candidate firmware image directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    new_dir: PathBuf,
}

/// Patch candidate firmware to the device-provisioned rollback indices.
///
/// Compares like `compare` and, when a patch is required, writes re-signed
/// `boot.img` and `vbmeta_system.img` into the output directory. The output
/// directory is removed again if any step fails.
#[derive(Debug, Parser)]
struct PatchRollbackCli {
    #[command(flatten)]
    dumps: DumpGroup,

    /// Path to the candidate firmware image directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    new_dir: PathBuf,

    /// Path to the output directory for patched images.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output: PathBuf,
}

/// Re-sign a hash-footer image at an explicit rollback index.
///
/// If the image already carries exactly the given index, it is copied to the
/// output unmodified. Otherwise a new hash footer is added with the original
/// partition name, size, salt, properties, and flags, signed with the test
/// key matching the image's embedded public key.
#[derive(Debug, Parser)]
struct PatchChainedCli {
    /// Path to input AVB image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output AVB image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Rollback index to stamp into the output image.
    #[arg(short, long, value_name = "INDEX")]
    rollback_index: u64,
}

/// Regenerate a vbmeta-class image at an explicit rollback index.
///
/// vbmeta images carry no footer of their own, so the image is rebuilt from
/// its own descriptors rather than patched in place.
#[derive(Debug, Parser)]
struct PatchVbmetaCli {
    /// Path to input vbmeta image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output vbmeta image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Rollback index to stamp into the output image.
    #[arg(short, long, value_name = "INDEX")]
    rollback_index: u64,
}

/// Rebuild a top-level vbmeta image around modified chained images.
///
/// Descriptors are copied from the original vbmeta first and then from each
/// --include image in order, so a modified chained image's descriptor
/// supersedes the stale one from the original.
#[derive(Debug, Parser)]
struct RebuildCli {
    /// Path to the original vbmeta image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output vbmeta image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Chained images to include descriptors from, in order.
    #[arg(long, value_name = "FILE", value_parser)]
    include: Vec<PathBuf>,

    /// Padding size for the output image.
    #[arg(long, value_name = "BYTES", default_value_t = VBMETA_PADDING_SIZE)]
    padding_size: u64,
}

#[derive(Debug, Subcommand)]
enum AvbCommand {
    #[command(alias = "dump")]
    Info(InfoCli),
    Compare(CompareCli),
    PatchRollback(PatchRollbackCli),
    PatchChained(PatchChainedCli),
    PatchVbmeta(PatchVbmetaCli),
    Rebuild(RebuildCli),
}

/// Inspect and rollback-patch AVB-protected images.
#[derive(Debug, Parser)]
pub struct AvbCli {
    #[command(subcommand)]
    command: AvbCommand,
}
