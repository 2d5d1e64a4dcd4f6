//! Scale records and the identifier scheme

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::scale_parameters::ScaleParameters;
use crate::errors::PersistenceError;

/// One cached rendition of the original image.
///
/// Immutable once built; `size` is derived from `data` so the two can
/// never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleRecord {
    id: String,
    dimensions: (u32, u32),
    mimetype: String,
    data: Bytes,
    parameters: ScaleParameters,
    created_at: DateTime<Utc>,
}

/// Persisted description of a record, stored beside its data blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRecordMetadata {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub mimetype: String,
    pub size: u64,
    pub parameters: ScaleParameters,
    pub created_at: DateTime<Utc>,
}

impl ScaleRecord {
    pub fn new(
        id: String,
        dimensions: (u32, u32),
        mimetype: String,
        data: Bytes,
        parameters: ScaleParameters,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            dimensions,
            mimetype,
            data,
            parameters,
            created_at,
        }
    }

    /// Rebuild a record from its stored halves, rejecting size mismatches
    pub fn from_parts(metadata: ScaleRecordMetadata, data: Bytes) -> Result<Self, PersistenceError> {
        if metadata.size != data.len() as u64 {
            return Err(PersistenceError::corrupt(
                metadata.id,
                format!(
                    "recorded size {} does not match {} stored bytes",
                    metadata.size,
                    data.len()
                ),
            ));
        }

        Ok(Self {
            id: metadata.id,
            dimensions: (metadata.width, metadata.height),
            mimetype: metadata.mimetype,
            data,
            parameters: metadata.parameters,
            created_at: metadata.created_at,
        })
    }

    pub fn metadata(&self) -> ScaleRecordMetadata {
        ScaleRecordMetadata {
            id: self.id.clone(),
            width: self.dimensions.0,
            height: self.dimensions.1,
            mimetype: self.mimetype.clone(),
            size: self.size(),
            parameters: self.parameters.clone(),
            created_at: self.created_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Actual pixel size, which may differ from the requested box
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    pub fn mimetype(&self) -> &str {
        &self.mimetype
    }

    /// Byte length of the encoded data
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn parameters(&self) -> &ScaleParameters {
        &self.parameters
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Display for ScaleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}x{} {} ({} bytes) [{}]",
            self.id,
            self.dimensions.0,
            self.dimensions.1,
            self.mimetype,
            self.size(),
            self.parameters
        )
    }
}

/// Monotonic identifier counter persisted with the scale index.
///
/// Identifiers are decimal strings starting at "1" and are never handed
/// out twice, even after the record they named is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSequence {
    next: u64,
}

impl Default for IdSequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdSequence {
    /// Allocate the next identifier for which `is_taken` is false
    pub fn generate(&mut self, is_taken: impl Fn(&str) -> bool) -> String {
        loop {
            let candidate = self.next.to_string();
            self.next += 1;
            if !is_taken(&candidate) {
                return candidate;
            }
        }
    }

    /// The value the next call to `generate` starts from
    pub fn peek(&self) -> u64 {
        self.next
    }
}

/// Hex SHA-256 of the original image bytes
pub fn source_digest(original: &[u8]) -> String {
    hex::encode(Sha256::digest(original))
}
