//! Session Record and Message Types
//!
//! The versioned state owned by a session actor, plus the commands and
//! queries that mutate or read it. All mutation rules live here as plain
//! methods so the version/conflict/expiry invariants are testable without
//! spinning up a runtime.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit session identifier. The nil id is reserved as the
/// empty-record sentinel and never addresses a real session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Ordinal replica role for a session. Slot 1 is the primary: the only
/// slot that accepts a brand-new session and the only one that initiates
/// persistence and replication fan-out.
pub type ReplicaSlot = u8;

pub const PRIMARY_SLOT: ReplicaSlot = 1;

/// One named, independently versioned payload within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRecord {
    pub data: Vec<u8>,
    pub version: i64,
}

/// One section write inside an `UpdateCommand`. `version` is the version
/// the caller believes the section currently has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionWrite {
    pub key: String,
    pub data: Vec<u8>,
    pub version: i64,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateCommand {
    pub sections: Vec<SectionWrite>,
    /// Absolute deadline. Required when the target record is empty.
    pub expiration_unix_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct GetQuery {
    /// Section keys to return. Empty means all sections.
    pub sections: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InvalidateCommand {
    pub reason: String,
}

/// Deletion fact handed from an actor to the write-behind pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDeletion {
    pub session_id: SessionId,
    pub reason: String,
}

/// Read-side view of a record: the full versioned state, optionally
/// filtered to requested sections. Also the payload of a replication
/// delivery, where it is applied wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub expiration_unix_seconds: i64,
    pub version: i64,
    pub sections: HashMap<String, SectionRecord>,
}

/// Versioned session state owned by exactly one actor instance per slot.
///
/// The empty record (nil id) means "nothing loaded for this replica slot
/// yet". Invalidation does not produce it on the read path; it makes the
/// content immediately eligible for deletion instead, so a stale replica
/// cannot resurrect invalidated data as a fresh-looking miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub expiration_unix_seconds: i64,
    pub version: i64,
    pub sections: HashMap<String, SectionRecord>,
}

impl SessionRecord {
    pub fn empty() -> Self {
        Self {
            id: SessionId::nil(),
            expiration_unix_seconds: 0,
            version: 0,
            sections: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_nil()
    }

    pub fn is_expired(&self, now_unix_seconds: i64) -> bool {
        self.expiration_unix_seconds <= now_unix_seconds
    }

    /// First accepted update for an empty record: every given section
    /// starts at version 1 and the record itself at version 1.
    pub fn create(id: SessionId, expiration_unix_seconds: i64, sections: &[SectionWrite]) -> Self {
        Self {
            id,
            expiration_unix_seconds,
            version: 1,
            sections: sections
                .iter()
                .map(|section| {
                    (
                        section.key.clone(),
                        SectionRecord {
                            data: section.data.clone(),
                            version: 1,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Replaces the expiration, bumping the record version when the value
    /// actually changes.
    pub fn set_expiration(&mut self, expiration_unix_seconds: i64) {
        if self.expiration_unix_seconds == expiration_unix_seconds {
            return;
        }
        self.expiration_unix_seconds = expiration_unix_seconds;
        self.version += 1;
    }

    /// Applies a batch of section writes and returns the keys that failed
    /// the optimistic version check.
    ///
    /// Sections without a conflict are applied even when other sections in
    /// the same batch conflict; the caller decides what to do with the
    /// returned keys. A write to an existing section bumps that section's
    /// version; a new section starts at version 1 and bumps the record
    /// version (section-set change).
    pub fn apply_sections(
        &mut self,
        sections: &[SectionWrite],
        check_versions: bool,
    ) -> Vec<String> {
        let mut conflicting = Vec::new();

        for section in sections {
            match self.sections.get_mut(&section.key) {
                Some(existing) => {
                    if check_versions && section.version != existing.version {
                        conflicting.push(section.key.clone());
                    } else {
                        existing.data = section.data.clone();
                        existing.version += 1;
                    }
                }
                None => {
                    self.sections.insert(
                        section.key.clone(),
                        SectionRecord {
                            data: section.data.clone(),
                            version: 1,
                        },
                    );
                    self.version += 1;
                }
            }
        }

        conflicting
    }

    /// View of the record filtered to `keys` (empty = all sections).
    pub fn snapshot(&self, keys: &[String]) -> SessionSnapshot {
        let sections = if keys.is_empty() {
            self.sections.clone()
        } else {
            keys.iter()
                .filter_map(|key| {
                    self.sections
                        .get(key)
                        .map(|section| (key.clone(), section.clone()))
                })
                .collect()
        };

        SessionSnapshot {
            expiration_unix_seconds: self.expiration_unix_seconds,
            version: self.version,
            sections,
        }
    }

    /// Adopts a full snapshot wholesale, versions included. Used when a
    /// replica hydrates from a read-through response or applies an
    /// authoritative replication delivery.
    pub fn hydrate(id: SessionId, snapshot: &SessionSnapshot) -> Self {
        Self {
            id,
            expiration_unix_seconds: snapshot.expiration_unix_seconds,
            version: snapshot.version,
            sections: snapshot.sections.clone(),
        }
    }
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
