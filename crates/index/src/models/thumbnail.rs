use crate::error::{Error, ErrorKind};
use crate::models::{from_millis, size_from_db};
use derive_more::Display;
use std::str::FromStr;
use time::UtcDateTime;

/// Rendered size of a thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Tier {
    #[display("small")]
    Small,
    #[display("medium")]
    Medium,
    #[display("large")]
    Large,
}
impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Small, Tier::Medium, Tier::Large];

    /// Column holding this tier's bytes.
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}
impl FromStr for Tier {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "small" => Self::Small,
            "medium" => Self::Medium,
            "large" => Self::Large,
            _ => exn::bail!(ErrorKind::InvalidData("thumbnail tier")),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ThumbnailRow {
    pub(crate) content_hash: String,
    pub(crate) source_hash: String,
    pub(crate) source_size: i64,
    pub(crate) small: Option<Vec<u8>>,
    pub(crate) medium: Option<Vec<u8>>,
    pub(crate) large: Option<Vec<u8>>,
    pub(crate) created_at: i64,
}

/// Rendered thumbnails for one piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRecord {
    pub content_hash: String,
    pub source_hash: String,
    /// Size of the file the tiers were rendered from.
    pub source_size: u64,
    pub small: Option<Vec<u8>>,
    pub medium: Option<Vec<u8>>,
    pub large: Option<Vec<u8>>,
    pub created_at: UtcDateTime,
}
impl ThumbnailRecord {
    /// Bytes of a tier, if rendered and non-empty.
    pub fn tier(&self, tier: Tier) -> Option<&[u8]> {
        let bytes = match tier {
            Tier::Small => self.small.as_deref(),
            Tier::Medium => self.medium.as_deref(),
            Tier::Large => self.large.as_deref(),
        };
        bytes.filter(|b| !b.is_empty())
    }
}

impl TryFrom<ThumbnailRow> for ThumbnailRecord {
    type Error = Error;
    fn try_from(row: ThumbnailRow) -> Result<Self, Self::Error> {
        Ok(Self {
            content_hash: row.content_hash,
            source_hash: row.source_hash,
            source_size: size_from_db(row.source_size)?,
            small: row.small,
            medium: row.medium,
            large: row.large,
            created_at: from_millis(row.created_at)?,
        })
    }
}
