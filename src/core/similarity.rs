use crate::error::{AppError, Result};

/// Cosine similarity of two equal-length vectors, clamped to `[-1, 1]`.
///
/// Accumulates in `f64`. Fails with [`AppError::DimensionMismatch`] when the
/// lengths differ and [`AppError::DegenerateVector`] when either magnitude is
/// zero or the result is not finite.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(AppError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0f64, 0.0f64, 0.0f64), |(dot, na, nb), (&x, &y)| {
        let (x, y) = (f64::from(x), f64::from(y));
        (dot + x * y, na + x * x, nb + y * y)
    });

    let denominator = norm_a.sqrt() * norm_b.sqrt();
    if denominator == 0.0 || !denominator.is_finite() {
        return Err(AppError::DegenerateVector);
    }

    let cosine = dot / denominator;
    if !cosine.is_finite() {
        return Err(AppError::DegenerateVector);
    }
    Ok(cosine.clamp(-1.0, 1.0))
}

/// Similarity percentage in `0..=100`.
///
/// Maps cosine similarity linearly from `[-1, 1]` onto `[0, 100]` and rounds
/// once, at the end, half away from zero (`f64::round`).
pub fn score(a: &[f32], b: &[f32]) -> Result<u8> {
    let cosine = cosine_similarity(a, b)?;
    let percent = ((cosine + 1.0) / 2.0 * 100.0).round();
    // clamped cosine keeps percent within 0..=100
    Ok(percent as u8)
}
