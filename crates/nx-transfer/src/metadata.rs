/// Transfer metadata record and its JSON wire encoding.
///
/// ```text
/// {"name":"report.pdf","size":48213,"hash":"9e107d9d372bb6826bd81d3542a419d6"}
/// ```
///
/// Sent as exactly one transport unit (one datagram, or one stream write)
/// ahead of the payload.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::digest::compute_digest;
use crate::error::TransferError;
use crate::protocol::{METADATA_MAX, describe_payload};

/// Name, size and digest of the file being transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    pub size: u64,
    /// Lowercase hex MD5 of the complete file.
    #[serde(rename = "hash")]
    pub digest: String,
}

impl TransferMetadata {
    pub fn new(name: impl Into<String>, size: u64, digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            digest: digest.into(),
        }
    }

    /// Build metadata from the file's current on-disk state.
    pub fn from_path(path: &Path) -> Result<Self, TransferError> {
        let size = std::fs::metadata(path)
            .map_err(|e| TransferError::file(path, e))?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TransferError::InvalidConfig(format!("{} has no file name", path.display()))
            })?;
        let digest = compute_digest(path)?;
        Ok(Self { name, size, digest })
    }

    /// Encode to one self-contained unit no larger than [`METADATA_MAX`].
    pub fn encode(&self) -> Result<Vec<u8>, TransferError> {
        let bytes = serde_json::to_vec(self).map_err(|e| TransferError::MetadataDecode {
            reason: e.to_string(),
            raw: String::new(),
        })?;
        if bytes.len() > METADATA_MAX {
            return Err(TransferError::MetadataTooLarge {
                len: bytes.len(),
                max: METADATA_MAX,
            });
        }
        Ok(bytes)
    }

    /// Decode a received unit. Missing fields, wrong types and malformed
    /// JSON are all decode errors.
    pub fn decode(data: &[u8]) -> Result<Self, TransferError> {
        serde_json::from_slice(data).map_err(|e| TransferError::MetadataDecode {
            reason: e.to_string(),
            raw: describe_payload(data),
        })
    }

    /// Whether the peer-supplied name stays inside the destination directory
    /// when joined to it.
    pub fn has_safe_name(&self) -> bool {
        let path = Path::new(&self.name);
        let mut components = path.components();
        matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        )
    }
}
