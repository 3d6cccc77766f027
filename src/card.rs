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

//! Card rows. Cards are never deleted, only blocked.

use crate::base::{AccountId, CardId};
use crate::error::LedgerError;
use crate::tokenizer::CardToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum CardStatus {
    Active,
    Blocked,
}

impl CardStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "BLOCKED" => Ok(Self::Blocked),
            _ => Err(LedgerError::Validation(format!("unknown card status '{s}'"))),
        }
    }
}

/// Snapshot of a card row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Card {
    pub id: CardId,
    pub account_id: AccountId,
    /// Internal lookup key; never part of the public projection.
    #[serde(skip)]
    pub token: CardToken,
    pub masked: String,
    pub status: CardStatus,
    pub created_at: DateTime<Utc>,
}

impl Card {
    pub fn is_blocked(&self) -> bool {
        self.status == CardStatus::Blocked
    }
}

/// Values needed to insert a card row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCard {
    pub account_id: AccountId,
    pub token: CardToken,
    pub masked: String,
}

impl NewCard {
    pub fn into_card(self, id: CardId, created_at: DateTime<Utc>) -> Card {
        Card {
            id,
            account_id: self.account_id,
            token: self.token,
            masked: self.masked,
            status: CardStatus::Active,
            created_at,
        }
    }
}
