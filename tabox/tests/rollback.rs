/*
 * SPDX-FileCopyrightText: 2025 The tabox developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Rollback patching tests against a fake avbtool.
//!
//! The fake is a shell script that logs every invocation, serves canned
//! `info_image` reports from `<image>.info` fixture files, and performs
//! observable mutations for the signing operations.

#![cfg(unix)]

use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};

use assert_matches::assert_matches;
use tempfile::TempDir;

use tabox::{
    avbtool::{self, Avbtool},
    config::KeyMap,
    patch::avb::{
        Error, RollbackStatus, compare_rollback, patch_chained_image, patch_vbmeta_image,
        rebuild_vbmeta,
    },
};

const PUBKEY_RSA4096: &str = "2597c218aae470a130f61162feaae70afd97f011";
const PUBKEY_RSA2048: &str = "cdbb77177f731920bbe0a0f94f84d9038ae0617d";

struct Oracle {
    temp_dir: TempDir,
    avbtool: Avbtool,
    log: PathBuf,
}

impl Oracle {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("avbtool.sh");
        let log = temp_dir.path().join("calls.log");

        let content = format!(
            r#"#!/bin/sh
printf '%s\n' "$*" >> "{log}"
op="$1"
shift
img=
out=
rb=
while [ "$#" -gt 0 ]; do
    case "$1" in
        --image) img="$2"; shift 2 ;;
        --output) out="$2"; shift 2 ;;
        --rollback_index) rb="$2"; shift 2 ;;
        *) shift ;;
    esac
done
case "$op" in
    info_image)
        if [ -f "$img.info" ]; then
            cat "$img.info"
        else
            echo "avbtool: cannot read $img" >&2
            exit 1
        fi
        ;;
    add_hash_footer)
        printf 'FOOTER rb=%s' "$rb" >> "$img"
        ;;
    make_vbmeta_image)
        printf 'VBMETA rb=%s' "$rb" > "$out"
        ;;
esac
"#,
            log = log.display(),
        );

        fs::write(&script, content).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let avbtool = Avbtool::new("/bin/sh", [&script]);

        Self {
            temp_dir,
            avbtool,
            log,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    fn write_image(&self, name: &str, data: &[u8], report: &str) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, data).unwrap();
        fs::write(path.with_file_name(format!("{name}.info")), report).unwrap();
        path
    }

    fn calls(&self) -> Vec<String> {
        match fs::read_to_string(&self.log) {
            Ok(data) => data.lines().map(str::to_owned).collect(),
            Err(_) => vec![],
        }
    }

    fn key_map(&self) -> (KeyMap, PathBuf) {
        let key_path = self.path("testkey_rsa4096.pem");
        fs::write(&key_path, "KEY").unwrap();

        let mut keys = KeyMap::default();
        keys.insert(PUBKEY_RSA4096, &key_path);
        keys.insert(PUBKEY_RSA2048, &key_path);

        (keys, key_path)
    }
}

fn boot_report(rollback: u64, pubkey: &str, salt: Option<&str>) -> String {
    let salt_line = match salt {
        Some(s) => format!("      Salt:                  {s}\n"),
        None => String::new(),
    };

    format!(
        "\
Footer version:           1.0
Image size:               100663296 bytes
Original image size:      25165824 bytes
VBMeta offset:            25165824
VBMeta size:              1600 bytes
--
Minimum libavb version:   1.0
Public key (sha1):        {pubkey}
Algorithm:                SHA256_RSA4096
Rollback Index:           {rollback}
Flags:                    2
Rollback Index Location:  0
Release String:           'avbtool 1.2.0'
Descriptors:
    Hash descriptor:
      Image Size:            25165824 bytes
      Hash Algorithm:        sha256
      Partition Name:        boot
{salt_line}      Digest:                deadbeefdeadbeef
      Flags:                 0
    Prop: com.android.build.boot.os_version -> '14'
    Prop: com.android.build.boot.fingerprint -> 'Lenovo/TB321FU/14'
"
    )
}

fn vbmeta_report(rollback: u64, pubkey: &str) -> String {
    format!(
        "\
Minimum libavb version:   1.0
Public key (sha1):        {pubkey}
Algorithm:                SHA256_RSA2048
Rollback Index:           {rollback}
Flags:                    0
Rollback Index Location:  0
Release String:           'avbtool 1.2.0'
Descriptors:
    Hash descriptor:
      Image Size:            8454144 bytes
      Hash Algorithm:        sha256
      Partition Name:        vendor_boot
      Salt:                  aabbccdd
      Digest:                cafebabecafebabe
      Flags:                 0
"
    )
}

#[test]
fn chained_image_with_matching_index_is_copied_unmodified() {
    let oracle = Oracle::new();
    let (keys, _) = oracle.key_map();

    let input = oracle.write_image("boot.img", b"BOOTDATA", &boot_report(3, PUBKEY_RSA4096, Some("d00df00d")));
    let output = oracle.path("boot.patched.img");

    patch_chained_image(&oracle.avbtool, &keys, "boot", 3, &input, &output).unwrap();

    assert_eq!(fs::read(&output).unwrap(), b"BOOTDATA");

    // Only the inspection ran; no re-sign was invoked.
    let calls = oracle.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("info_image "));
}

#[test]
fn chained_image_is_resigned_at_provisioned_index() {
    let oracle = Oracle::new();
    let (keys, key_path) = oracle.key_map();

    // Candidate carries rollback 2 but the device has provisioned 3.
    let input = oracle.write_image("boot.img", b"BOOTDATA", &boot_report(2, PUBKEY_RSA4096, Some("d00df00d")));
    let output = oracle.path("boot.patched.img");

    patch_chained_image(&oracle.avbtool, &keys, "boot", 3, &input, &output).unwrap();

    // The copy was re-footered in place at the provisioned index.
    assert_eq!(fs::read(&output).unwrap(), b"BOOTDATAFOOTER rb=3");

    let calls = oracle.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1],
        format!(
            "add_hash_footer --image {} --key {} --algorithm SHA256_RSA4096 \
             --partition_size 100663296 --partition_name boot --rollback_index 3 \
             --salt d00df00d --prop com.android.build.boot.os_version:14 \
             --prop com.android.build.boot.fingerprint:Lenovo/TB321FU/14 --flags 2",
            output.display(),
            key_path.display(),
        ),
    );
}

#[test]
fn chained_image_with_higher_index_is_pinned_down() {
    let oracle = Oracle::new();
    let (keys, _) = oracle.key_map();

    // The candidate's index is ahead of the device. It is still pinned to
    // exactly the provisioned value.
    let input = oracle.write_image("boot.img", b"BOOTDATA", &boot_report(5, PUBKEY_RSA4096, Some("d00df00d")));
    let output = oracle.path("boot.patched.img");

    patch_chained_image(&oracle.avbtool, &keys, "boot", 3, &input, &output).unwrap();

    assert_eq!(fs::read(&output).unwrap(), b"BOOTDATAFOOTER rb=3");
}

#[test]
fn chained_image_with_unknown_key_is_rejected() {
    let oracle = Oracle::new();
    let (keys, _) = oracle.key_map();

    let unknown = "0000000000000000000000000000000000000000";
    let input = oracle.write_image("boot.img", b"BOOTDATA", &boot_report(2, unknown, Some("d00df00d")));
    let output = oracle.path("boot.patched.img");

    let result = patch_chained_image(&oracle.avbtool, &keys, "boot", 3, &input, &output);

    assert_matches!(result, Err(Error::UnknownKey { fingerprint, .. }) if fingerprint == unknown);
    assert!(!output.exists());
}

#[test]
fn chained_image_with_missing_salt_is_rejected() {
    let oracle = Oracle::new();
    let (keys, _) = oracle.key_map();

    let input = oracle.write_image("boot.img", b"BOOTDATA", &boot_report(2, PUBKEY_RSA4096, None));
    let output = oracle.path("boot.patched.img");

    let result = patch_chained_image(&oracle.avbtool, &keys, "boot", 3, &input, &output);

    assert_matches!(result, Err(Error::MissingField { field: "salt", .. }));
    assert!(!output.exists());
}

#[test]
fn vbmeta_image_with_matching_index_is_copied_unmodified() {
    let oracle = Oracle::new();
    let (keys, _) = oracle.key_map();

    let input = oracle.write_image("vbmeta_system.img", b"VBMETADATA", &vbmeta_report(5, PUBKEY_RSA2048));
    let output = oracle.path("vbmeta_system.patched.img");

    patch_vbmeta_image(&oracle.avbtool, &keys, "vbmeta_system", 5, &input, &output).unwrap();

    assert_eq!(fs::read(&output).unwrap(), b"VBMETADATA");
    assert_eq!(oracle.calls().len(), 1);
}

#[test]
fn vbmeta_image_is_regenerated_at_provisioned_index() {
    let oracle = Oracle::new();
    let (keys, key_path) = oracle.key_map();

    let input = oracle.write_image("vbmeta_system.img", b"VBMETADATA", &vbmeta_report(2, PUBKEY_RSA2048));
    let output = oracle.path("vbmeta_system.patched.img");

    patch_vbmeta_image(&oracle.avbtool, &keys, "vbmeta_system", 5, &input, &output).unwrap();

    assert_eq!(fs::read(&output).unwrap(), b"VBMETA rb=5");

    let calls = oracle.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1],
        format!(
            "make_vbmeta_image --output {} --key {} --algorithm SHA256_RSA2048 \
             --rollback_index 5 --flags 0 --include_descriptors_from_image {}",
            output.display(),
            key_path.display(),
            input.display(),
        ),
    );
}

#[test]
fn rebuild_includes_descriptors_in_order() {
    let oracle = Oracle::new();
    let (keys, key_path) = oracle.key_map();

    let original = oracle.write_image("vbmeta.img", b"VBMETADATA", &vbmeta_report(4, PUBKEY_RSA2048));
    let vendor_boot = oracle.path("vendor_boot_prc.img");
    fs::write(&vendor_boot, b"VENDORBOOT").unwrap();
    let output = oracle.path("vbmeta.new.img");

    rebuild_vbmeta(
        &oracle.avbtool,
        &keys,
        &output,
        &original,
        std::slice::from_ref(&vendor_boot),
        8192,
    )
    .unwrap();

    let calls = oracle.calls();
    assert_eq!(calls.len(), 2);

    // The patched chained image comes after the original so that its
    // descriptor supersedes the stale one.
    assert_eq!(
        calls[1],
        format!(
            "make_vbmeta_image --output {} --key {} --algorithm SHA256_RSA2048 \
             --padding_size 8192 --flags 0 --rollback_index 4 \
             --include_descriptors_from_image {} --include_descriptors_from_image {}",
            output.display(),
            key_path.display(),
            original.display(),
            vendor_boot.display(),
        ),
    );
}

#[test]
fn compare_reports_match() {
    let oracle = Oracle::new();

    let dumped_boot = oracle.write_image("boot.bak.img", b"B", &boot_report(3, PUBKEY_RSA4096, Some("d00df00d")));
    let dumped_vbmeta = oracle.write_image("vbmeta.bak.img", b"V", &vbmeta_report(5, PUBKEY_RSA2048));
    let new_boot = oracle.write_image("boot.img", b"B2", &boot_report(3, PUBKEY_RSA4096, Some("d00df00d")));
    let new_vbmeta = oracle.write_image("vbmeta_system.img", b"V2", &vbmeta_report(5, PUBKEY_RSA2048));

    let comparison = compare_rollback(
        &oracle.avbtool,
        &dumped_boot,
        &dumped_vbmeta,
        &new_boot,
        &new_vbmeta,
    )
    .unwrap();

    assert_eq!(comparison.status, RollbackStatus::Match);
    assert_eq!(comparison.boot_index, 3);
    assert_eq!(comparison.vbmeta_index, 5);
}

#[test]
fn compare_reports_needs_patch() {
    let oracle = Oracle::new();

    let dumped_boot = oracle.write_image("boot.bak.img", b"B", &boot_report(3, PUBKEY_RSA4096, Some("d00df00d")));
    let dumped_vbmeta = oracle.write_image("vbmeta.bak.img", b"V", &vbmeta_report(5, PUBKEY_RSA2048));
    let new_boot = oracle.write_image("boot.img", b"B2", &boot_report(2, PUBKEY_RSA4096, Some("d00df00d")));
    let new_vbmeta = oracle.write_image("vbmeta_system.img", b"V2", &vbmeta_report(5, PUBKEY_RSA2048));

    let comparison = compare_rollback(
        &oracle.avbtool,
        &dumped_boot,
        &dumped_vbmeta,
        &new_boot,
        &new_vbmeta,
    )
    .unwrap();

    assert_eq!(comparison.status, RollbackStatus::NeedsPatch);
    assert_eq!(comparison.boot_index, 3);
    assert_eq!(comparison.vbmeta_index, 5);
}

#[test]
fn compare_reports_missing_candidates() {
    let oracle = Oracle::new();

    let dumped_boot = oracle.write_image("boot.bak.img", b"B", &boot_report(3, PUBKEY_RSA4096, Some("d00df00d")));
    let dumped_vbmeta = oracle.write_image("vbmeta.bak.img", b"V", &vbmeta_report(5, PUBKEY_RSA2048));

    let comparison = compare_rollback(
        &oracle.avbtool,
        &dumped_boot,
        &dumped_vbmeta,
        &oracle.path("boot.img"),
        &oracle.path("vbmeta_system.img"),
    )
    .unwrap();

    assert_eq!(comparison.status, RollbackStatus::MissingNew);
}

#[test]
fn compare_propagates_extraction_failure() {
    let oracle = Oracle::new();

    // No .info fixture for the dumped boot image, so the fake tool fails.
    let dumped_boot = oracle.path("boot.bak.img");
    fs::write(&dumped_boot, b"B").unwrap();
    let dumped_vbmeta = oracle.write_image("vbmeta.bak.img", b"V", &vbmeta_report(5, PUBKEY_RSA2048));

    let result = compare_rollback(
        &oracle.avbtool,
        &dumped_boot,
        &dumped_vbmeta,
        &oracle.path("boot.img"),
        &oracle.path("vbmeta_system.img"),
    );

    assert_matches!(
        result,
        Err(Error::Avbtool(avbtool::Error::CommandFailed { stderr, .. }))
            if stderr.contains("cannot read")
    );
}
