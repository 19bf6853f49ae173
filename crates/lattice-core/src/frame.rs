//! Commit frames and entity references.
//!
//! A [`CommitFrame`] is one repository write as delivered by the relay. An
//! [`EntityReference`] is the content-addressed key derived from the frame's
//! `(did, collection, rkey)` triple; every store uses it as primary key, which
//! makes replays idempotent.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum DID length accepted by the protocol.
const MAX_DID_LEN: usize = 2048;

/// Maximum NSID length accepted by the protocol.
const MAX_NSID_LEN: usize = 317;

/// Maximum record key length accepted by the protocol.
const MAX_RKEY_LEN: usize = 512;

/// Repository operation carried by a commit frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidField {
                field: "operation",
                reason: format!("unknown operation '{other}'"),
            }),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validated repository commit received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitFrame {
    /// Relay-assigned, strictly increasing sequence number.
    pub seq: u64,
    /// Repository DID.
    pub did: String,
    /// Record collection NSID.
    pub collection: String,
    /// Record key within the collection.
    pub rkey: String,
    pub operation: OperationKind,
    /// Content hash of the record (absent on delete).
    pub cid: Option<String>,
    /// Record body (absent on delete).
    pub record: Option<serde_json::Value>,
    /// Repository revision, when the relay supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

impl CommitFrame {
    /// The entity this frame writes to.
    pub fn entity_ref(&self) -> EntityReference {
        EntityReference::new(&self.did, &self.collection, &self.rkey)
    }

    /// Structural validation: identifiers are well formed and create/update
    /// frames carry both a CID and a record body.
    pub fn validate(&self) -> Result<()> {
        validate_did(&self.did)?;
        validate_nsid(&self.collection)?;
        validate_rkey(&self.rkey)?;

        match self.operation {
            OperationKind::Create | OperationKind::Update => {
                let cid = self.cid.as_deref().ok_or(Error::MissingField("cid"))?;
                validate_cid(cid)?;
                match &self.record {
                    Some(serde_json::Value::Object(_)) => {}
                    Some(_) => {
                        return Err(Error::InvalidField {
                            field: "record",
                            reason: "record body must be a JSON object".to_string(),
                        });
                    }
                    None => return Err(Error::MissingField("record")),
                }
            }
            OperationKind::Delete => {}
        }

        Ok(())
    }
}

/// Stable, content-addressed identifier for an indexed record.
///
/// The `id` is the hex SHA-256 of the record's AT-URI, so the same
/// `(did, collection, rkey)` always maps to the same key in every store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityReference {
    id: String,
    uri: String,
}

impl EntityReference {
    /// Derive the reference for a record.
    pub fn new(did: &str, collection: &str, rkey: &str) -> Self {
        let uri = format!("at://{did}/{collection}/{rkey}");
        let id = hex::encode(Sha256::digest(uri.as_bytes()));
        Self { id, uri }
    }

    /// Derive the reference from a full AT-URI.
    pub fn from_at_uri(uri: &str) -> Result<Self> {
        let (did, collection, rkey) = parse_at_uri(uri)?;
        Ok(Self::new(did, collection, rkey))
    }

    /// Hex-encoded key used as primary key in all stores.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The record's AT-URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Stable 64-bit hash of the key, used for lane partitioning.
    pub fn partition_hash(&self) -> u64 {
        u64::from_str_radix(&self.id[..16], 16).unwrap_or(0)
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Split `at://did/collection/rkey` into its parts, validating each.
pub fn parse_at_uri(uri: &str) -> Result<(&str, &str, &str)> {
    let rest = uri
        .strip_prefix("at://")
        .ok_or_else(|| Error::InvalidAtUri(uri.to_string()))?;

    let mut parts = rest.splitn(3, '/');
    let (Some(did), Some(collection), Some(rkey)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::InvalidAtUri(uri.to_string()));
    };

    validate_did(did).map_err(|_| Error::InvalidAtUri(uri.to_string()))?;
    validate_nsid(collection).map_err(|_| Error::InvalidAtUri(uri.to_string()))?;
    validate_rkey(rkey).map_err(|_| Error::InvalidAtUri(uri.to_string()))?;

    Ok((did, collection, rkey))
}

/// Validate a DID of the form `did:<method>:<identifier>`.
pub fn validate_did(did: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidField {
        field: "did",
        reason: format!("{reason}: '{did}'"),
    };

    if did.len() > MAX_DID_LEN {
        return Err(invalid("too long"));
    }

    let mut parts = did.splitn(3, ':');
    if parts.next() != Some("did") {
        return Err(invalid("must start with 'did:'"));
    }

    let method = parts.next().unwrap_or_default();
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_lowercase()) {
        return Err(invalid("method must be lowercase letters"));
    }

    let identifier = parts.next().unwrap_or_default();
    if identifier.is_empty() || identifier.ends_with(':') {
        return Err(invalid("missing identifier"));
    }
    if !identifier
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b':' | b'%' | b'-'))
    {
        return Err(invalid("identifier contains invalid characters"));
    }

    Ok(())
}

/// Validate a namespaced identifier such as `pub.lattice.preprint`.
pub fn validate_nsid(nsid: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidField {
        field: "collection",
        reason: format!("{reason}: '{nsid}'"),
    };

    if nsid.len() > MAX_NSID_LEN {
        return Err(invalid("too long"));
    }

    let segments: Vec<&str> = nsid.split('.').collect();
    if segments.len() < 3 {
        return Err(invalid("needs at least three segments"));
    }

    for segment in &segments {
        if segment.is_empty() || segment.len() > 63 {
            return Err(invalid("segment length out of range"));
        }
        if segment.starts_with('-') || segment.ends_with('-') {
            return Err(invalid("segment may not start or end with '-'"));
        }
        if !segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid("segment contains invalid characters"));
        }
    }

    let name = segments[segments.len() - 1];
    if !name.bytes().all(|b| b.is_ascii_alphanumeric()) || name.as_bytes()[0].is_ascii_digit() {
        return Err(invalid("name segment must be alphanumeric and not start with a digit"));
    }

    Ok(())
}

/// Validate a record key.
pub fn validate_rkey(rkey: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidField {
        field: "rkey",
        reason: format!("{reason}: '{rkey}'"),
    };

    if rkey.is_empty() || rkey.len() > MAX_RKEY_LEN {
        return Err(invalid("length out of range"));
    }
    if rkey == "." || rkey == ".." {
        return Err(invalid("reserved key"));
    }
    if !rkey
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':' | b'~'))
    {
        return Err(invalid("contains invalid characters"));
    }

    Ok(())
}

/// Loose CID check: base32 multibase string of plausible length.
pub fn validate_cid(cid: &str) -> Result<()> {
    if cid.len() < 8 || cid.len() > 256 || !cid.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(Error::InvalidField {
            field: "cid",
            reason: format!("malformed content hash '{cid}'"),
        });
    }
    Ok(())
}
