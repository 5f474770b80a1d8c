use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_NAME_CHARS: usize = 25;
pub const DEFAULT_LEVEL: i32 = 1;
pub const DEFAULT_FUNDS: i64 = 0;

/// Seniority label on a profile, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Rank {
    #[default]
    #[serde(rename = "Rct.")]
    Recruit,
    #[serde(rename = "Pvt.")]
    Private,
    #[serde(rename = "L/Cpl.")]
    LanceCorporal,
    #[serde(rename = "Cpl.")]
    Corporal,
    #[serde(rename = "Sgt.")]
    Sergeant,
    #[serde(rename = "S/Sgt.")]
    StaffSergeant,
    #[serde(rename = "2 Lt.")]
    SecondLieutenant,
    #[serde(rename = "Lt.")]
    Lieutenant,
    #[serde(rename = "Capt.")]
    Captain,
    #[serde(rename = "Maj.")]
    Major,
}

impl Rank {
    pub const ALL: [Rank; 10] = [
        Self::Recruit,
        Self::Private,
        Self::LanceCorporal,
        Self::Corporal,
        Self::Sergeant,
        Self::StaffSergeant,
        Self::SecondLieutenant,
        Self::Lieutenant,
        Self::Captain,
        Self::Major,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recruit => "Rct.",
            Self::Private => "Pvt.",
            Self::LanceCorporal => "L/Cpl.",
            Self::Corporal => "Cpl.",
            Self::Sergeant => "Sgt.",
            Self::StaffSergeant => "S/Sgt.",
            Self::SecondLieutenant => "2 Lt.",
            Self::Lieutenant => "Lt.",
            Self::Captain => "Capt.",
            Self::Major => "Maj.",
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rank label: {0}")]
pub struct UnknownRank(pub String);

impl FromStr for Rank {
    type Err = UnknownRank;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|rank| rank.as_str() == raw)
            .ok_or_else(|| UnknownRank(raw.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub external_id: String,
    pub rank: Rank,
    pub first_name: String,
    pub surname: String,
    pub level: i32,
    pub funds: i64,
    pub is_nco: bool,
    pub is_officer: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// `"Rct. J. Smith"`: rank, first initial, surname.
    #[must_use]
    pub fn display_name(&self) -> String {
        let initial = self
            .first_name
            .trim()
            .chars()
            .next()
            .map(|c| c.to_uppercase().collect::<String>())
            .unwrap_or_default();
        format!("{} {initial}. {}", self.rank, self.surname)
    }
}

/// Insert payload; names are expected to be normalized already.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub external_id: String,
    pub first_name: String,
    pub surname: String,
}

/// Trims, then upper-cases the first character and lower-cases the rest.
#[must_use]
pub fn capitalize_name(raw: &str) -> String {
    let mut chars = raw.trim().chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}
