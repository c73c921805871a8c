//! Guarded numeric helpers.
//!
//! Every division in the engine goes through [`safe_div`]; every stored value
//! goes through one of the clamps. None of these functions can produce NaN or
//! infinity from finite inputs.

/// Denominators with magnitude below this are treated as zero.
pub const EPSILON: f64 = 1e-12;

/// Divide `a` by `b`, returning `fallback` when the quotient is undefined.
#[inline]
pub fn safe_div(a: f64, b: f64, fallback: f64) -> f64 {
    if !a.is_finite() || !b.is_finite() || b.abs() < EPSILON {
        return fallback;
    }
    let q = a / b;
    if q.is_finite() {
        q
    } else {
        fallback
    }
}

/// [`safe_div`] with the default fallback of zero.
#[inline]
pub fn safe_div0(a: f64, b: f64) -> f64 {
    safe_div(a, b, 0.0)
}

/// Clamp to [0, 1]. Non-finite input maps to 0.
#[inline]
pub fn clamp_unit(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Clamp to [-1, 1]. Non-finite input maps to 0.
#[inline]
pub fn clamp_signed(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Round to the nearest whole count, never below zero.
#[inline]
pub fn round_count(x: f64) -> f64 {
    if x.is_finite() {
        x.round().max(0.0)
    } else {
        0.0
    }
}

/// Replace a non-finite value with `fallback`.
#[inline]
pub fn finite_or(x: f64, fallback: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        fallback
    }
}

/// Map a non-negative magnitude into [0, 1): `x / (x + reference)`.
///
/// Used to hold unbounded quantities (acquisition cost) in ratio-valued nodes.
#[inline]
pub fn saturate(x: f64, reference: f64) -> f64 {
    clamp_unit(safe_div0(x.max(0.0), x.max(0.0) + reference))
}

/// Largest ratio [`unsaturate`] will invert before capping.
pub const SATURATION_CAP: f64 = 0.999;

/// Inverse of [`saturate`]: `reference * r / (1 - r)`.
#[inline]
pub fn unsaturate(ratio: f64, reference: f64) -> f64 {
    let r = clamp_unit(ratio).min(SATURATION_CAP);
    safe_div0(reference * r, 1.0 - r)
}

/// Arithmetic mean, `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
