// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Card number tokenization.
//!
//! Tokens are HMAC-SHA256 digests of the normalized card number under a secret
//! key. The same number always yields the same token, so uniqueness and lookup
//! work on tokens alone, and nothing stored can be turned back into the number.

use crate::error::LedgerError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Shortest key accepted for the tokenizer, in bytes.
pub const MIN_KEY_LEN: usize = 16;

/// Secret key material. Never printed.
#[derive(Clone)]
pub struct TokenizerKey(Vec<u8>);

impl TokenizerKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, LedgerError> {
        let bytes = bytes.into();
        if bytes.len() < MIN_KEY_LEN {
            return Err(LedgerError::Validation(format!(
                "tokenizer key must be at least {MIN_KEY_LEN} bytes"
            )));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for TokenizerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenizerKey(<redacted>)")
    }
}

/// A validated raw card number. Lives only for the duration of a request.
pub struct CardNumber(String);

impl CardNumber {
    /// Strips spaces and dashes, then checks length (13..=19 digits) and the Luhn checksum.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let digits: String = raw.chars().filter(|c| *c != ' ' && *c != '-').collect();
        if !(13..=19).contains(&digits.len()) || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(LedgerError::Validation(
                "card number must be 13 to 19 digits".to_string(),
            ));
        }
        if !luhn_valid(&digits) {
            return Err(LedgerError::Validation(
                "card number fails checksum".to_string(),
            ));
        }
        Ok(Self(digits))
    }

    /// Display form kept alongside the token, e.g. `**** 1111`.
    pub fn masked(&self) -> String {
        let last4 = &self.0[self.0.len() - 4..];
        format!("**** {last4}")
    }
}

impl fmt::Debug for CardNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CardNumber({})", self.masked())
    }
}

fn luhn_valid(digits: &str) -> bool {
    let sum: u32 = digits
        .bytes()
        .rev()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// One-way token standing in for a card number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardToken(pub String);

impl CardToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keyed, deterministic card tokenizer.
#[derive(Clone)]
pub struct Tokenizer {
    mac: HmacSha256,
}

impl Tokenizer {
    pub fn new(key: &TokenizerKey) -> Result<Self, LedgerError> {
        let mac = HmacSha256::new_from_slice(&key.0)
            .map_err(|_| LedgerError::Internal("invalid tokenizer key".to_string()))?;
        Ok(Self { mac })
    }

    pub fn tokenize(&self, number: &CardNumber) -> CardToken {
        let mut mac = self.mac.clone();
        mac.update(number.0.as_bytes());
        CardToken(hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Tokenizer { .. }")
    }
}
