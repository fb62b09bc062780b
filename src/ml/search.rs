//! Vector similarity scoring
//!
//! Every metric is reported as a similarity: higher means closer.

use crate::config::DistanceMetric;
use serde::{Deserialize, Serialize};

/// One ranked hit from the vector index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

impl DistanceMetric {
    /// Similarity between two equal-length vectors under this metric
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => cosine_similarity(a, b),
            DistanceMetric::DotProduct => dot_product(a, b),
            DistanceMetric::Euclidean => 1.0 / (1.0 + euclidean_distance(a, b)),
        }
    }

    /// Stable one-byte tag used in the persisted index header
    pub fn tag(&self) -> u8 {
        match self {
            DistanceMetric::Cosine => 0,
            DistanceMetric::DotProduct => 1,
            DistanceMetric::Euclidean => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DistanceMetric::Cosine),
            1 => Some(DistanceMetric::DotProduct),
            2 => Some(DistanceMetric::Euclidean),
            _ => None,
        }
    }
}

/// Cosine similarity; zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot = dot_product(a, b);
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Dot product
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Euclidean distance (L2)
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Scale a vector to unit length in place (no-op for zero vectors)
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for val in vector.iter_mut() {
            *val /= norm;
        }
    }
}
