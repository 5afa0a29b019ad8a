//! JSON wire schemas for the key-service bus subjects.
//!
//! Each subject gets its own request/response pair; nothing is shared across
//! subjects beyond [`ErrorResponse`], which any handler may substitute for its
//! normal reply.

use serde::{Deserialize, Serialize};

pub const SUBJECT_DECRYPT_BATCH: &str = "eyed.key.decrypt_batch";
pub const SUBJECT_DECRYPT_TEMPLATE: &str = "eyed.key.decrypt_template";
pub const SUBJECT_HEALTH: &str = "eyed.key.health";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DecryptBatchRequest {
    /// Match threshold override; [`crate::DEFAULT_MATCH_THRESHOLD`] if absent.
    #[serde(default)]
    pub threshold: Option<f64>,
    pub entries: Vec<BatchEntry>,
}

/// One gallery candidate: encrypted inner products against the probe plus the
/// cleartext popcounts needed to recover the XOR-bit count.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BatchEntry {
    pub template_id: String,
    pub identity_id: String,
    #[serde(default)]
    pub identity_name: Option<String>,
    /// One serialized ciphertext per iris-code component (typically 2:
    /// real + imaginary).
    pub enc_inner_products_b64: Vec<String>,
    pub probe_iris_popcount: Vec<i64>,
    pub gallery_iris_popcount: Vec<i64>,
    /// Accepted for wire compatibility; masked distance is not computed.
    #[serde(default)]
    pub probe_mask_popcount: Option<Vec<i64>>,
    #[serde(default)]
    pub gallery_mask_popcount: Option<Vec<i64>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MatchResponse {
    pub is_match: bool,
    pub hamming_distance: f64,
    /// Null unless `is_match`.
    pub matched_identity_id: Option<String>,
    pub matched_identity_name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DecryptTemplateRequest {
    #[serde(default)]
    pub iris_codes_b64: Option<Vec<String>>,
    #[serde(default)]
    pub mask_codes_b64: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DecryptTemplateResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iris_codes: Option<Vec<Vec<i64>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_codes: Option<Vec<Vec<i64>>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    NotReady,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub ring_dimension: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(kind: &str, detail: impl std::fmt::Display) -> Self {
        Self {
            error: format!("{kind}: {detail}"),
        }
    }
}
