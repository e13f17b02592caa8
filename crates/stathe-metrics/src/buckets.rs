//! Bucket boundary generators for histograms.

use stathe_common::error::{Result, StatheError};

/// Boundaries used when a histogram is created without explicit buckets.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// `count` buckets, the first upper bound at `start`, each `width` wider.
pub fn linear_buckets(start: f64, width: f64, count: usize) -> Result<Vec<f64>> {
    if count < 1 {
        return Err(StatheError::InvalidArgument(
            "linear_buckets needs a positive count".to_string(),
        ));
    }
    if width.is_nan() || width <= 0.0 {
        return Err(StatheError::InvalidArgument(format!(
            "linear_buckets needs a positive width, got {width}"
        )));
    }
    Ok((0..count).map(|i| start + width * i as f64).collect())
}

/// `count` buckets, the first upper bound at `start`, each `factor` times the previous.
pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Result<Vec<f64>> {
    if count < 1 {
        return Err(StatheError::InvalidArgument(
            "exponential_buckets needs a positive count".to_string(),
        ));
    }
    if start.is_nan() || start <= 0.0 {
        return Err(StatheError::InvalidArgument(format!(
            "exponential_buckets needs a positive start value, got {start}"
        )));
    }
    if factor.is_nan() || factor <= 1.0 {
        return Err(StatheError::InvalidArgument(format!(
            "exponential_buckets needs a factor greater than 1, got {factor}"
        )));
    }

    let mut buckets = Vec::with_capacity(count);
    let mut bound = start;
    for _ in 0..count {
        buckets.push(bound);
        bound *= factor;
    }
    Ok(buckets)
}

/// `count` exponential buckets spanning exactly `min..=max`.
pub fn exponential_buckets_range(min: f64, max: f64, count: usize) -> Result<Vec<f64>> {
    if count < 1 {
        return Err(StatheError::InvalidArgument(
            "exponential_buckets_range needs a positive count".to_string(),
        ));
    }
    if min.is_nan() || max.is_nan() || min <= 0.0 || max <= min {
        return Err(StatheError::InvalidArgument(format!(
            "exponential_buckets_range needs 0 < min < max, got {min}..{max}"
        )));
    }
    if count == 1 {
        return Ok(vec![min]);
    }
    let factor = (max / min).powf(1.0 / (count - 1) as f64);
    exponential_buckets(min, factor, count)
}

/// Boundaries must be strictly increasing and not NaN.
/// A trailing `+Inf` is dropped because every histogram has an implicit one.
pub(crate) fn normalize_bounds(buckets: &[f64]) -> Result<Vec<f64>> {
    if buckets.is_empty() {
        return Ok(DEFAULT_BUCKETS.to_vec());
    }

    let mut bounds = buckets.to_vec();
    if bounds.last().is_some_and(|last| *last == f64::INFINITY) {
        bounds.pop();
    }
    if bounds.iter().any(|bound| bound.is_nan()) {
        return Err(StatheError::InvalidArgument(
            "histogram bucket boundaries must not be NaN".to_string(),
        ));
    }
    if bounds.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(StatheError::InvalidArgument(
            "histogram bucket boundaries must be strictly increasing".to_string(),
        ));
    }
    Ok(bounds)
}
