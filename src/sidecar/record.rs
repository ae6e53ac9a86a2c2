//! The identity record kept next to every image.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::scanner::PerceptualHash;

/// Stable identity and caption data for one image file.
///
/// `uuid` never changes once minted and is the join key with the metadata
/// store. Fields written by newer versions are kept in `extra` so a rewrite
/// does not drop them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub uuid: Uuid,
    /// 16 hex nibbles, `None` when the pixels could not be decoded.
    #[serde(rename = "pHash", default)]
    pub p_hash: Option<String>,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IdentityRecord {
    /// Mint a fresh identity with an empty caption and no tags.
    pub fn new(p_hash: Option<PerceptualHash>) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            p_hash: p_hash.map(|h| h.to_string()),
            caption: String::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            extra: Map::new(),
        }
    }

    pub fn perceptual_hash(&self) -> Option<PerceptualHash> {
        self.p_hash.as_deref().and_then(|h| h.parse().ok())
    }

    /// Repair records whose timestamps went backwards.
    pub(crate) fn normalize(mut self) -> Self {
        if self.updated_at < self.created_at {
            self.updated_at = self.created_at;
        }
        self
    }
}

/// Fields to change in an [`IdentityRecord`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub caption: Option<String>,
    pub tags: Option<Vec<String>>,
    pub p_hash: Option<String>,
}

impl RecordPatch {
    pub fn caption(caption: impl Into<String>) -> Self {
        Self {
            caption: Some(caption.into()),
            ..Default::default()
        }
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: Some(tags.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.caption.is_none() && self.tags.is_none() && self.p_hash.is_none()
    }

    /// Fold `later` over `self`, later values winning.
    pub fn merge(mut self, later: RecordPatch) -> Self {
        if later.caption.is_some() {
            self.caption = later.caption;
        }
        if later.tags.is_some() {
            self.tags = later.tags;
        }
        if later.p_hash.is_some() {
            self.p_hash = later.p_hash;
        }
        self
    }
}

/// Return a copy of `existing` with `patch` applied and `updated_at` moved
/// forward. `created_at` and `uuid` are carried over untouched.
pub fn update(existing: &IdentityRecord, patch: &RecordPatch) -> IdentityRecord {
    let mut next = existing.clone();
    if let Some(caption) = &patch.caption {
        next.caption = caption.clone();
    }
    if let Some(tags) = &patch.tags {
        next.tags = tags.clone();
    }
    if let Some(p_hash) = &patch.p_hash {
        next.p_hash = Some(p_hash.clone());
    }

    let now = Utc::now();
    next.updated_at = if now > existing.updated_at {
        now
    } else {
        existing.updated_at + Duration::microseconds(1)
    };
    next
}
