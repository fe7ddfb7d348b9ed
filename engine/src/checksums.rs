//! Digests for post-copy verification.
//!
//! Files are hashed in a streaming fashion so that memory use does not grow
//! with file size. CRC32 is the cheap option; SHA-256 is the default.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Digest algorithm used to compare a copy with its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Crc32,
    Md5,
    Sha256,
    Blake3,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 4] = [
        ChecksumAlgorithm::Crc32,
        ChecksumAlgorithm::Md5,
        ChecksumAlgorithm::Sha256,
        ChecksumAlgorithm::Blake3,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                format!(
                    "unknown checksum algorithm '{}' (expected crc32, md5, sha256 or blake3)",
                    wanted
                )
            })
    }
}

/// Lowercase hex digest tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Running state of one digest.
pub enum Hasher {
    Crc32(crc32fast::Hasher),
    Md5(md5::Context),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Crc32(h) => h.update(data),
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finish(self) -> ChecksumValue {
        let (algorithm, hex) = match self {
            Hasher::Crc32(h) => (ChecksumAlgorithm::Crc32, format!("{:08x}", h.finalize())),
            Hasher::Md5(ctx) => (ChecksumAlgorithm::Md5, format!("{:x}", ctx.compute())),
            Hasher::Sha256(h) => (ChecksumAlgorithm::Sha256, format!("{:x}", h.finalize())),
            Hasher::Blake3(h) => (ChecksumAlgorithm::Blake3, h.finalize().to_hex().to_string()),
        };
        ChecksumValue::new(algorithm, hex)
    }
}

/// Hash the file at `path`, reading at least 4 KiB per call.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    buffer_size: usize,
) -> Result<ChecksumValue> {
    let read_error = |source: io::Error| EngineError::ReadError {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_error)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; buffer_size.max(4096)];

    loop {
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e)),
        };
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finish())
}
