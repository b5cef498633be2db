//! Dense vector math: distance metrics and normalization.
//!
//! Free functions for the three supported metrics, matching the sign
//! convention the index engine needs (lower-is-better for `l2`,
//! higher-is-better for `ip`/`cosine`).

use serde::{Deserialize, Serialize};

pub type Dense = Vec<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    L2,
    Ip,
    Cosine,
}

impl Distance {
    /// True when the metric requires ingest/query-time L2 normalization.
    pub fn requires_normalize(self) -> bool {
        matches!(self, Distance::Cosine)
    }

    /// Whether the sparse contribution is subtracted (`l2`) or added
    /// (`ip`/`cosine`) when combining hybrid scores.
    pub fn sparse_sign(self) -> f32 {
        match self {
            Distance::L2 => -1.0,
            Distance::Ip | Distance::Cosine => 1.0,
        }
    }

    /// Score between two dense vectors under this metric. For `l2` this is
    /// the squared euclidean distance (lower is better); for `ip`/`cosine`
    /// it is the dot product of the (possibly pre-normalized) vectors
    /// (higher is better).
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Distance::L2 => l2_squared(a, b),
            Distance::Ip | Distance::Cosine => dot(a, b),
        }
    }

    /// Ordering such that "better" sorts first.
    pub fn better_is_smaller(self) -> bool {
        matches!(self, Distance::L2)
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// L2-normalize in place; a zero vector is left unchanged.
pub fn normalize_in_place(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}

pub fn normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    normalize_in_place(&mut out);
    out
}
