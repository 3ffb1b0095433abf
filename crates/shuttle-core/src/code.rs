// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Transfer codes
//
// Six characters a person can read aloud and type without confusing 0/O or 1/I/L.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::types::ShuttleError;

/// Length of a transfer code
pub const CODE_LEN: usize = 6;

/// Uppercase letters and digits without the visually confusable ones
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// A validated transfer code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransferCode(String);

impl TransferCode {
    /// Draw a fresh random code from the thread-local CSPRNG
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parse user input. Only surrounding whitespace is forgiven.
    pub fn parse(input: &str) -> Result<Self, ShuttleError> {
        let trimmed = input.trim();
        let valid = trimmed.len() == CODE_LEN
            && trimmed.bytes().all(|b| CODE_ALPHABET.contains(&b));
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ShuttleError::InvalidCodeFormat(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Public fingerprint of the code used by discovery and the relay.
    ///
    /// Peers can match on it without the code itself crossing the network.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"lan-shuttle/v1:");
        hasher.update(self.0.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }
}

impl fmt::Display for TransferCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TransferCode {
    type Err = ShuttleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TransferCode {
    type Error = ShuttleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TransferCode> for String {
    fn from(code: TransferCode) -> Self {
        code.0
    }
}
