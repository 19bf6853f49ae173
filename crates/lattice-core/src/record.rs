//! Record kinds understood by the indexer.
//!
//! [`RecordKind`] is the closed set of collections with indexing handlers;
//! [`Record`] is the decoded payload for each. Decoding is structural only:
//! it checks the fields the indexer projects, not the full lexicon.

use crate::error::{Error, Result};
use crate::frame::parse_at_uri;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace shared by all Lattice record collections.
pub const RECORD_NAMESPACE: &str = "pub.lattice";

/// Maximum length of a user-supplied tag or keyword.
pub const MAX_TAG_LEN: usize = 64;

/// Known record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Preprint,
    Review,
    Endorsement,
    UserTag,
}

impl RecordKind {
    /// All known kinds, in registry order.
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Preprint,
        RecordKind::Review,
        RecordKind::Endorsement,
        RecordKind::UserTag,
    ];

    /// Collection NSID for this kind.
    pub fn nsid(&self) -> &'static str {
        match self {
            Self::Preprint => "pub.lattice.preprint",
            Self::Review => "pub.lattice.review",
            Self::Endorsement => "pub.lattice.endorsement",
            Self::UserTag => "pub.lattice.tag",
        }
    }

    /// Look up a kind by collection NSID.
    pub fn from_nsid(nsid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.nsid() == nsid)
    }

    /// Short name used in logs, metrics labels and store rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preprint => "preprint",
            Self::Review => "review",
            Self::Endorsement => "endorsement",
            Self::UserTag => "tag",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to another record by URI and content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

/// An author entry on a preprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    /// Author's DID, when they have an account.
    #[serde(default)]
    pub did: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprintRecord {
    pub title: String,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub subject: StrongRef,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndorsementRecord {
    pub subject: StrongRef,
    /// Contribution types being endorsed (e.g., "methodology").
    #[serde(default)]
    pub contributions: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTagRecord {
    pub subject: StrongRef,
    pub tag: String,
    pub created_at: String,
}

/// Decoded record payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Preprint(PreprintRecord),
    Review(ReviewRecord),
    Endorsement(EndorsementRecord),
    UserTag(UserTagRecord),
}

impl Record {
    /// Decode and structurally validate a record body of the given kind.
    pub fn decode(kind: RecordKind, body: &serde_json::Value) -> Result<Self> {
        let record = match kind {
            RecordKind::Preprint => Self::Preprint(decode_body(kind, body)?),
            RecordKind::Review => Self::Review(decode_body(kind, body)?),
            RecordKind::Endorsement => Self::Endorsement(decode_body(kind, body)?),
            RecordKind::UserTag => Self::UserTag(decode_body(kind, body)?),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Preprint(_) => RecordKind::Preprint,
            Self::Review(_) => RecordKind::Review,
            Self::Endorsement(_) => RecordKind::Endorsement,
            Self::UserTag(_) => RecordKind::UserTag,
        }
    }

    /// The record this one points at, if any.
    pub fn subject(&self) -> Option<&StrongRef> {
        match self {
            Self::Preprint(_) => None,
            Self::Review(r) => Some(&r.subject),
            Self::Endorsement(r) => Some(&r.subject),
            Self::UserTag(r) => Some(&r.subject),
        }
    }

    pub fn created_at(&self) -> &str {
        match self {
            Self::Preprint(r) => &r.created_at,
            Self::Review(r) => &r.created_at,
            Self::Endorsement(r) => &r.created_at,
            Self::UserTag(r) => &r.created_at,
        }
    }

    fn validate(&self) -> Result<()> {
        let kind = self.kind().as_str();
        let invalid = |reason: String| Error::InvalidRecord { kind, reason };

        if let Some(subject) = self.subject() {
            parse_at_uri(&subject.uri)
                .map_err(|_| invalid(format!("subject '{}' is not an AT-URI", subject.uri)))?;
        }

        match self {
            Self::Preprint(r) => {
                if r.title.trim().is_empty() {
                    return Err(invalid("title is empty".to_string()));
                }
                if let Some(k) = r.keywords.iter().find(|k| k.chars().count() > MAX_TAG_LEN) {
                    return Err(invalid(format!("keyword too long: '{k}'")));
                }
            }
            Self::Review(r) => {
                if r.text.trim().is_empty() {
                    return Err(invalid("text is empty".to_string()));
                }
            }
            Self::Endorsement(_) => {}
            Self::UserTag(r) => {
                let tag = r.tag.trim();
                if tag.is_empty() || tag.chars().count() > MAX_TAG_LEN {
                    return Err(invalid(format!("tag length out of range: '{}'", r.tag)));
                }
            }
        }

        Ok(())
    }
}

fn decode_body<T: for<'de> Deserialize<'de>>(
    kind: RecordKind,
    body: &serde_json::Value,
) -> Result<T> {
    T::deserialize(body).map_err(|e| Error::InvalidRecord {
        kind: kind.as_str(),
        reason: e.to_string(),
    })
}

/// Normalize a free-text tag into its canonical label.
///
/// Lowercases, trims and collapses internal whitespace to single hyphens so
/// "Machine  Learning" and "machine-learning" land on the same graph node.
pub fn normalize_tag(tag: &str) -> String {
    tag.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}
