/*
 * SPDX-FileCopyrightText: 2025 The tabox developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::avbtool::Avbtool;

/// AOSP test keys used to sign the boot chain on retail firmware for the
/// supported devices, keyed by the SHA-1 fingerprint of the embedded public
/// key. Paths are relative to `key_dir`.
const DEFAULT_KEYS: &[(&str, &str)] = &[
    (
        "2597c218aae470a130f61162feaae70afd97f011",
        "testkey_rsa4096.pem",
    ),
    (
        "cdbb77177f731920bbe0a0f94f84d9038ae0617d",
        "testkey_rsa2048.pem",
    ),
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config file: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse config file: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// How to invoke the external AVB tool.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AvbtoolConfig {
    pub program: PathBuf,
    /// Leading arguments inserted before the operation name, eg. the path to
    /// `avbtool.py` when `program` is a Python interpreter.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AvbtoolConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("avbtool"),
            args: vec![],
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub avbtool: AvbtoolConfig,
    /// Directory that relative private key paths are resolved against.
    pub key_dir: Option<PathBuf>,
    /// Extra fingerprint -> private key entries. These extend and override
    /// the built-in test key table.
    pub keys: BTreeMap<String, PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;
        let config = toml_edit::de::from_str(&data).map_err(|e| Error::Parse(path.to_owned(), e))?;

        Ok(config)
    }

    pub fn avbtool(&self) -> Avbtool {
        Avbtool::new(&self.avbtool.program, &self.avbtool.args)
    }

    /// Build the effective fingerprint -> key file table.
    pub fn key_map(&self) -> KeyMap {
        let key_dir = self.key_dir.as_deref().unwrap_or(Path::new("."));

        let mut map = KeyMap::default();

        for (fingerprint, path) in DEFAULT_KEYS {
            map.insert(*fingerprint, key_dir.join(path));
        }
        for (fingerprint, path) in &self.keys {
            map.insert(fingerprint, key_dir.join(path));
        }

        map
    }
}

/// Static mapping from public key SHA-1 fingerprints to the matching private
/// test key files. An unknown fingerprint means there is no way to produce a
/// validly signed replacement image, so lookups are fallible and callers must
/// treat a miss as fatal.
#[derive(Clone, Debug, Default)]
pub struct KeyMap {
    keys: BTreeMap<String, PathBuf>,
}

impl KeyMap {
    pub fn insert(&mut self, fingerprint: impl Into<String>, path: impl Into<PathBuf>) {
        self.keys.insert(fingerprint.into(), path.into());
    }

    pub fn get(&self, fingerprint: &str) -> Option<&Path> {
        self.keys.get(fingerprint).map(PathBuf::as_path)
    }
}

impl<F: Into<String>, P: Into<PathBuf>> FromIterator<(F, P)> for KeyMap {
    fn from_iter<T: IntoIterator<Item = (F, P)>>(iter: T) -> Self {
        Self {
            keys: iter
                .into_iter()
                .map(|(f, p)| (f.into(), p.into()))
                .collect(),
        }
    }
}
