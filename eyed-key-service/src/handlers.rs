//! Request handlers for the three key-service subjects.
//!
//! Distance math: the engine homomorphically reduces
//! `popcount(probe AND gallery)` per component; with the cleartext
//! popcounts the XOR-bit count follows from
//! `popcount(a XOR b) = popcount(a) + popcount(b) - 2 * popcount(a AND b)`.
//! Distances are unmasked (all 8192 bits of every component count); masked
//! distance would cost one more multiplicative depth, so masks are accepted
//! on the wire and ignored. Tune the match threshold with that in mind.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use itertools::izip;
use thiserror::Error;

use eyed_common::wire::{
    BatchEntry, DecryptBatchRequest, DecryptTemplateRequest, DecryptTemplateResponse,
    HealthResponse, HealthStatus, MatchResponse,
};
use eyed_common::{DEFAULT_MATCH_THRESHOLD, IRIS_CODE_SLOTS};

use crate::he_context::{HeContext, HeError};

#[derive(Error, Debug)]
pub enum HandlerError {
    /// Ciphertext and popcount lists must be index-aligned.
    #[error("entry {template_id}: ciphertext and popcount lists differ in length")]
    LengthMismatch { template_id: String },
    /// A ciphertext payload was not valid base64.
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    /// Decryption failed.
    #[error(transparent)]
    He(#[from] HeError),
}

struct MatchCandidate<'a> {
    entry: &'a BatchEntry,
    hamming_distance: f64,
}

/// Decrypt every entry's inner products, compute fractional Hamming
/// distances, and return the argmin if it clears the threshold. Ties keep
/// the first entry seen (strict `<` maintains the minimum).
pub fn handle_decrypt_batch(
    ctx: &HeContext,
    req: &DecryptBatchRequest,
) -> Result<MatchResponse, HandlerError> {
    let threshold = req.threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD);

    let mut best: Option<MatchCandidate<'_>> = None;
    for entry in &req.entries {
        let fhd = entry_distance(ctx, entry)?;
        if best.as_ref().is_none_or(|b| fhd < b.hamming_distance) {
            best = Some(MatchCandidate {
                entry,
                hamming_distance: fhd,
            });
        }
    }

    let hamming_distance = best.as_ref().map_or(1.0, |b| b.hamming_distance);
    let is_match = best.is_some() && hamming_distance < threshold;
    let matched = if is_match { best } else { None };

    Ok(MatchResponse {
        is_match,
        hamming_distance,
        matched_identity_id: matched.as_ref().map(|b| b.entry.identity_id.clone()),
        matched_identity_name: matched
            .as_ref()
            .and_then(|b| b.entry.identity_name.clone()),
    })
}

/// Unmasked fractional Hamming distance for one gallery entry, aggregated
/// over its K components (typically 2: real + imaginary).
fn entry_distance(ctx: &HeContext, entry: &BatchEntry) -> Result<f64, HandlerError> {
    let k = entry.enc_inner_products_b64.len();
    if entry.probe_iris_popcount.len() != k || entry.gallery_iris_popcount.len() != k {
        return Err(HandlerError::LengthMismatch {
            template_id: entry.template_id.clone(),
        });
    }
    if k == 0 {
        return Ok(1.0);
    }

    let mut total_xor: i64 = 0;
    for (ct_b64, &pop_a, &pop_b) in izip!(
        &entry.enc_inner_products_b64,
        &entry.probe_iris_popcount,
        &entry.gallery_iris_popcount,
    ) {
        let ct_bytes = BASE64.decode(ct_b64)?;
        let inner_product = ctx.decrypt_scalar(&ct_bytes)?;
        total_xor += pop_a + pop_b - 2 * inner_product;
    }

    let total_bits = (k * IRIS_CODE_SLOTS) as f64;
    Ok(total_xor as f64 / total_bits)
}

/// Admin visualization: decrypt full templates back to slot vectors. No
/// thresholding.
pub fn handle_decrypt_template(
    ctx: &HeContext,
    req: &DecryptTemplateRequest,
) -> Result<DecryptTemplateResponse, HandlerError> {
    let decrypt_all = |list: &Vec<String>| -> Result<Vec<Vec<i64>>, HandlerError> {
        list.iter()
            .map(|b64| {
                let ct_bytes = BASE64.decode(b64)?;
                Ok(ctx.decrypt_vector(&ct_bytes)?)
            })
            .collect()
    };

    Ok(DecryptTemplateResponse {
        iris_codes: req.iris_codes_b64.as_ref().map(decrypt_all).transpose()?,
        mask_codes: req.mask_codes_b64.as_ref().map(decrypt_all).transpose()?,
    })
}

pub fn handle_health(ctx: &HeContext) -> HealthResponse {
    HealthResponse {
        status: if ctx.is_ready() {
            HealthStatus::Ok
        } else {
            HealthStatus::NotReady
        },
        ring_dimension: ctx.ring_dimension(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::he_context::test_support::{context, encrypt_slots};
    use eyed_common::wire::BatchEntry;
    use rand::Rng;

    /// Build an entry whose decrypted arithmetic lands exactly on `fhd`
    /// targets by choosing inner products and popcounts directly.
    fn entry_with(
        template_id: &str,
        identity_id: &str,
        identity_name: Option<&str>,
        inner_products: &[i64],
        probe_pops: &[i64],
        gallery_pops: &[i64],
    ) -> BatchEntry {
        let ctx = context();
        BatchEntry {
            template_id: template_id.to_string(),
            identity_id: identity_id.to_string(),
            identity_name: identity_name.map(str::to_string),
            enc_inner_products_b64: inner_products
                .iter()
                .map(|&ip| BASE64.encode(encrypt_slots(ctx, &[ip])))
                .collect(),
            probe_iris_popcount: probe_pops.to_vec(),
            gallery_iris_popcount: gallery_pops.to_vec(),
            probe_mask_popcount: None,
            gallery_mask_popcount: None,
        }
    }

    /// Entry with a single component tuned to the requested distance:
    /// pop_a = pop_b = x and ip such that 2(x - ip) = fhd * 8192.
    fn entry_with_fhd(id: &str, fhd: f64) -> BatchEntry {
        let xor = (fhd * IRIS_CODE_SLOTS as f64).round() as i64;
        let pop = 4096;
        let ip = pop - xor / 2;
        entry_with(&format!("t-{id}"), id, Some(id), &[ip], &[pop], &[pop])
    }

    #[test]
    fn xor_identity_matches_a_plaintext_reference() {
        let mut rng = rand::thread_rng();
        let a: Vec<i64> = (0..IRIS_CODE_SLOTS).map(|_| rng.gen_range(0..2)).collect();
        let b: Vec<i64> = (0..IRIS_CODE_SLOTS).map(|_| rng.gen_range(0..2)).collect();

        let pop_a: i64 = a.iter().sum();
        let pop_b: i64 = b.iter().sum();
        let ip: i64 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        let xor_ref: i64 = a.iter().zip(&b).map(|(x, y)| x ^ y).sum();

        assert_eq!(pop_a + pop_b - 2 * ip, xor_ref);

        // The handler fed the encrypted inner product must agree with the
        // plaintext formula.
        let entry = entry_with("t-0", "i-0", None, &[ip], &[pop_a], &[pop_b]);
        let req = DecryptBatchRequest {
            threshold: Some(1.0),
            entries: vec![entry],
        };
        let resp = handle_decrypt_batch(context(), &req).unwrap();
        let expected = xor_ref as f64 / IRIS_CODE_SLOTS as f64;
        assert!((resp.hamming_distance - expected).abs() < 1e-9);
    }

    #[test]
    fn batch_arithmetic_on_documented_values() {
        // ip {3000, 2900}, probe {4100, 4050}, gallery {4200, 4080}
        // => (2300 + 2330) / 16384 ~= 0.2827
        let entry = entry_with(
            "t-1",
            "i-1",
            Some("Alice"),
            &[3000, 2900],
            &[4100, 4050],
            &[4200, 4080],
        );
        let req = DecryptBatchRequest {
            threshold: None,
            entries: vec![entry],
        };

        let resp = handle_decrypt_batch(context(), &req).unwrap();
        assert!((resp.hamming_distance - 4630.0 / 16384.0).abs() < 1e-9);
        assert!(resp.is_match); // 0.2827 < default 0.39
        assert_eq!(resp.matched_identity_id.as_deref(), Some("i-1"));
        assert_eq!(resp.matched_identity_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn argmin_under_threshold_wins_and_above_threshold_matches_nothing() {
        let entries = vec![
            entry_with_fhd("e1", 0.42),
            entry_with_fhd("e2", 0.35),
            entry_with_fhd("e3", 0.51),
        ];

        let resp = handle_decrypt_batch(
            context(),
            &DecryptBatchRequest {
                threshold: Some(0.39),
                entries: entries.clone(),
            },
        )
        .unwrap();
        assert!(resp.is_match);
        assert!((resp.hamming_distance - 0.35).abs() < 1e-3);
        assert_eq!(resp.matched_identity_id.as_deref(), Some("e2"));

        // Same gallery, tighter threshold: the minimum is still reported but
        // nothing matches.
        let resp = handle_decrypt_batch(
            context(),
            &DecryptBatchRequest {
                threshold: Some(0.30),
                entries,
            },
        )
        .unwrap();
        assert!(!resp.is_match);
        assert!((resp.hamming_distance - 0.35).abs() < 1e-3);
        assert_eq!(resp.matched_identity_id, None);
        assert_eq!(resp.matched_identity_name, None);
    }

    #[test]
    fn equal_distances_keep_the_first_entry() {
        let resp = handle_decrypt_batch(
            context(),
            &DecryptBatchRequest {
                threshold: Some(0.39),
                entries: vec![entry_with_fhd("first", 0.2), entry_with_fhd("second", 0.2)],
            },
        )
        .unwrap();
        assert_eq!(resp.matched_identity_id.as_deref(), Some("first"));
    }

    #[test]
    fn empty_gallery_reports_no_match_at_distance_one() {
        let resp = handle_decrypt_batch(
            context(),
            &DecryptBatchRequest {
                threshold: None,
                entries: vec![],
            },
        )
        .unwrap();
        assert!(!resp.is_match);
        assert_eq!(resp.hamming_distance, 1.0);
        assert_eq!(resp.matched_identity_id, None);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut entry = entry_with_fhd("e1", 0.2);
        entry.probe_iris_popcount.push(4100);

        let err = handle_decrypt_batch(
            context(),
            &DecryptBatchRequest {
                threshold: None,
                entries: vec![entry],
            },
        )
        .unwrap_err();
        assert!(matches!(err, HandlerError::LengthMismatch { .. }));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let mut entry = entry_with_fhd("e1", 0.2);
        entry.enc_inner_products_b64[0] = "not base64 !!!".to_string();

        let err = handle_decrypt_batch(
            context(),
            &DecryptBatchRequest {
                threshold: None,
                entries: vec![entry],
            },
        )
        .unwrap_err();
        assert!(matches!(err, HandlerError::Base64(_)));
    }

    #[test]
    fn decrypt_template_returns_parallel_arrays() {
        let ctx = context();
        let code: Vec<i64> = (0..IRIS_CODE_SLOTS).map(|i| (i % 2) as i64).collect();
        let mask: Vec<i64> = vec![1; IRIS_CODE_SLOTS];

        let req = DecryptTemplateRequest {
            iris_codes_b64: Some(vec![BASE64.encode(encrypt_slots(ctx, &code))]),
            mask_codes_b64: Some(vec![BASE64.encode(encrypt_slots(ctx, &mask))]),
        };
        let resp = handle_decrypt_template(ctx, &req).unwrap();
        assert_eq!(resp.iris_codes.unwrap(), vec![code]);
        assert_eq!(resp.mask_codes.unwrap(), vec![mask]);
    }

    #[test]
    fn decrypt_template_with_no_lists_is_empty() {
        let resp = handle_decrypt_template(context(), &DecryptTemplateRequest::default()).unwrap();
        assert!(resp.iris_codes.is_none());
        assert!(resp.mask_codes.is_none());
    }

    #[test]
    fn health_is_idempotent() {
        let first = handle_health(context());
        let second = handle_health(context());
        assert_eq!(first, second);
        assert_eq!(first.status, HealthStatus::Ok);
        assert_eq!(first.ring_dimension, context().ring_dimension());
    }
}
