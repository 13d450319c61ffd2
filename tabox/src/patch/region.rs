/*
 * SPDX-FileCopyrightText: 2025 The tabox developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Region code patching for `vendor_boot`, `devinfo`, and `persist` images.
//!
//! The supported devices encode their sales region twice: as `.ROW`/`IROW`
//! magic inside `vendor_boot` and as `\0\0\0{CC}XX\0\0\0` country markers
//! inside the `devinfo` and `persist` partitions. Converting a device from
//! the ROW (rest of world) firmware to PRC involves swapping both, after
//! which `vendor_boot` must be re-footered and the vbmeta chain rebuilt.

use memchr::memmem;
use phf::phf_map;
use thiserror::Error;

const ROW_MAGIC: [(&[u8], &[u8]); 2] = [(b".ROW", b".PRC"), (b"IROW", b"IPRC")];
const PRC_MAGIC: [&[u8]; 2] = [b".PRC", b"IPRC"];

/// Country codes that may appear in `devinfo`/`persist` region markers.
pub static COUNTRY_CODES: phf::Map<&'static str, &'static str> = phf_map! {
    "AE" => "United Arab Emirates",
    "AM" => "Armenia",
    "AR" => "Argentina",
    "AT" => "Austria",
    "AU" => "Australia",
    "AZ" => "Azerbaijan",
    "BE" => "Belgium",
    "BG" => "Bulgaria",
    "BH" => "Bahrain",
    "BR" => "Brazil",
    "CA" => "Canada",
    "CH" => "Switzerland",
    "CL" => "Chile",
    "CN" => "China",
    "CO" => "Colombia",
    "CR" => "Costa Rica",
    "CY" => "Cyprus",
    "CZ" => "Czech Republic",
    "DE" => "Germany",
    "DK" => "Denmark",
    "EC" => "Ecuador",
    "EE" => "Estonia",
    "EG" => "Egypt",
    "ES" => "Spain",
    "FI" => "Finland",
    "FR" => "France",
    "GB" => "United Kingdom",
    "GE" => "Georgia",
    "GH" => "Ghana",
    "GR" => "Greece",
    "GT" => "Guatemala",
    "HK" => "Hong Kong",
    "HR" => "Croatia",
    "HU" => "Hungary",
    "ID" => "Indonesia",
    "IL" => "Israel",
    "IN" => "India",
    "IS" => "Iceland",
    "IT" => "Italy",
    "JO" => "Jordan",
    "JP" => "Japan",
    "KE" => "Kenya",
    "KG" => "Kyrgyzstan",
    "KR" => "Korea",
    "KW" => "Kuwait",
    "KZ" => "Kazakhstan",
    "LB" => "Lebanon",
    "LT" => "Lithuania",
    "LV" => "Latvia",
    "MA" => "Morocco",
    "MD" => "Moldova",
    "MX" => "Mexico",
    "MY" => "Malaysia",
    "MZ" => "Mozambique",
    "NG" => "Nigeria",
    "NL" => "Netherlands",
    "NO" => "Norway",
    "NZ" => "New Zealand",
    "OM" => "Oman",
    "PA" => "Panama",
    "PE" => "Peru",
    "PH" => "Philippines",
    "PK" => "Pakistan",
    "PL" => "Poland",
    "PT" => "Portugal",
    "QA" => "Qatar",
    "RO" => "Romania",
    "RS" => "Serbia",
    "RU" => "Russia",
    "SA" => "Saudi Arabia",
    "SE" => "Sweden",
    "SG" => "Singapore",
    "SI" => "Slovenia",
    "SK" => "Slovakia",
    "SV" => "El Salvador",
    "TH" => "Thailand",
    "TJ" => "Tajikistan",
    "TN" => "Tunisia",
    "TR" => "Turkey",
    "TW" => "Taiwan",
    "TZ" => "Tanzania",
    "UA" => "Ukraine",
    "UG" => "Uganda",
    "US" => "United States of America",
    "UY" => "Uruguay",
    "UZ" => "Uzbekistan",
    "VE" => "Venezuela",
    "VN" => "Vietnam",
    "ZA" => "South Africa",
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid region code: {0:?}")]
    InvalidCode(String),
}

type Result<T> = std::result::Result<T, Error>;

/// Outcome of an in-place byte patch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PatchOutcome {
    /// `count` occurrences were replaced.
    Patched { count: usize },
    /// The data already carries the target region; nothing to do.
    AlreadyTarget,
    /// No known region marker was found.
    NotFound,
}

fn replace_in_place(data: &mut [u8], target: &[u8], replacement: &[u8]) -> usize {
    assert_eq!(target.len(), replacement.len());

    let finder = memmem::Finder::new(target);
    let mut count = 0;
    let mut pos = 0;

    while let Some(offset) = finder.find(&data[pos..]) {
        let start = pos + offset;
        data[start..start + replacement.len()].copy_from_slice(replacement);
        pos = start + replacement.len();
        count += 1;
    }

    count
}

/// Swap the ROW region magic inside a `vendor_boot` payload to PRC.
pub fn patch_vendor_boot(data: &mut [u8]) -> PatchOutcome {
    let mut count = 0;

    for (target, replacement) in ROW_MAGIC {
        count += replace_in_place(data, target, replacement);
    }

    if count > 0 {
        return PatchOutcome::Patched { count };
    }

    if PRC_MAGIC.iter().any(|m| memmem::find(data, m).is_some()) {
        PatchOutcome::AlreadyTarget
    } else {
        PatchOutcome::NotFound
    }
}

fn validated_code(code: &str) -> Result<&str> {
    if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(Error::InvalidCode(code.to_owned()));
    }

    Ok(code)
}

/// The marker is padded with zero bytes on both sides so that a country code
/// appearing in ordinary string data is not mistaken for the region field.
fn region_marker(code: &str) -> Vec<u8> {
    let mut marker = Vec::with_capacity(10);
    marker.extend_from_slice(b"\x00\x00\x00");
    marker.extend_from_slice(code.as_bytes());
    marker.extend_from_slice(b"XX");
    marker.extend_from_slice(b"\x00\x00\x00");
    marker
}

/// Swap every `current` region marker in a `devinfo`/`persist` payload for
/// `replacement`. Codes must be two uppercase ASCII letters.
pub fn patch_region_code(data: &mut [u8], current: &str, replacement: &str) -> Result<PatchOutcome> {
    let current = validated_code(current)?;
    let replacement = validated_code(replacement)?;

    if current == replacement {
        return Ok(PatchOutcome::AlreadyTarget);
    }

    let target = region_marker(current);
    let new = region_marker(replacement);

    let count = replace_in_place(data, &target, &new);
    if count > 0 {
        Ok(PatchOutcome::Patched { count })
    } else {
        Ok(PatchOutcome::NotFound)
    }
}

/// Scan a `devinfo`/`persist` payload for a region marker of any known
/// country code.
pub fn detect_region_code(data: &[u8]) -> Option<&'static str> {
    COUNTRY_CODES
        .keys()
        .find(|code| memmem::find(data, &region_marker(code)).is_some())
        .copied()
}

/// Check whether a payload carries a region marker for `code`.
pub fn contains_region_code(data: &[u8], code: &str) -> Result<bool> {
    let code = validated_code(code)?;

    Ok(memmem::find(data, &region_marker(code)).is_some())
}
