//! Scalar quantization (SQ8): per-vector min/max mapped to 256 evenly
//! spaced `u8` levels.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An SQ8-encoded vector: the per-vector `(min, max)` used to
/// reconstruct it, plus one byte per dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sq8Code {
    /// Minimum component value observed in the source vector.
    pub min: f32,
    /// Maximum component value observed in the source vector.
    pub max: f32,
    /// One quantized byte per dimension.
    pub bytes: Vec<u8>,
}

/// Encode `v` to an [`Sq8Code`].
///
/// `byte[i] = round(255 * (v[i] - min) / (max - min))`. When `max ==
/// min` (a constant vector) every byte is `0`, and decode reproduces
/// `min` for every component.
pub fn encode(v: &[f32]) -> Result<Sq8Code> {
    let min = v.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = v.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;

    let bytes = if span.abs() < 1e-12 {
        vec![0u8; v.len()]
    } else {
        v.iter()
            .map(|&x| (255.0 * (x - min) / span).round().clamp(0.0, 255.0) as u8)
            .collect()
    };

    Ok(Sq8Code { min, max, bytes })
}

/// Decode an [`Sq8Code`] back to `f32`, inverting the linear scaling
/// used by [`encode`].
pub fn decode(code: &Sq8Code) -> Vec<f32> {
    let span = code.max - code.min;
    if span.abs() < 1e-12 {
        return vec![code.min; code.bytes.len()];
    }
    code.bytes
        .iter()
        .map(|&b| code.min + (b as f32 / 255.0) * span)
        .collect()
}

/// Asymmetric score: raw `f32` query against a decoded SQ8 candidate.
/// This is the scoring path used during candidate ranking so the
/// store never has to re-materialize all decoded vectors up front.
pub fn asymmetric_dot(query: &[f32], code: &Sq8Code) -> f32 {
    let span = code.max - code.min;
    if span.abs() < 1e-12 {
        return query.iter().map(|&q| q * code.min).sum();
    }
    query
        .iter()
        .zip(&code.bytes)
        .map(|(&q, &b)| q * (code.min + (b as f32 / 255.0) * span))
        .sum()
}

/// Expected per-coordinate reconstruction MSE bound for a uniform
/// distribution over `[min, max]`: `((max - min) / 255)^2 / 12`.
pub fn expected_mse_bound(min: f32, max: f32) -> f32 {
    let step = (max - min) / 255.0;
    step * step / 12.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_reconstructs_within_bound() {
        let v: Vec<f32> = (0..384).map(|i| (i as f32 * 0.01).sin()).collect();
        let code = encode(&v).unwrap();
        let decoded = decode(&code);
        let mse: f32 = v
            .iter()
            .zip(&decoded)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            / v.len() as f32;
        let bound = expected_mse_bound(code.min, code.max) * 4.0; // slack for finite-sample variance
        assert!(mse <= bound, "mse {mse} exceeded bound {bound}");
    }

    #[test]
    fn constant_vector_round_trips_exactly() {
        let v = vec![3.0; 16];
        let code = encode(&v).unwrap();
        let decoded = decode(&code);
        assert!(decoded.iter().all(|&x| (x - 3.0).abs() < 1e-6));
    }

    #[test]
    fn code_has_one_byte_per_dimension() {
        let v = vec![0.1, 0.5, 0.9, -0.3];
        let code = encode(&v).unwrap();
        assert_eq!(code.bytes.len(), v.len());
    }

    #[test]
    fn asymmetric_dot_matches_decoded_dot() {
        let v = vec![1.0, -2.0, 3.5, 0.25];
        let q = vec![0.5, 0.5, 0.5, 0.5];
        let code = encode(&v).unwrap();
        let decoded = decode(&code);
        let expected: f32 = q.iter().zip(&decoded).map(|(a, b)| a * b).sum();
        let got = asymmetric_dot(&q, &code);
        assert!((expected - got).abs() < 1e-3);
    }
}
