//! Stability bookkeeping: unstable-eigenvalue counts and classification of
//! detected changes.

use num_complex::Complex;

use super::types::BifurcationKind;

/// How eigen-elements map to stability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityRule {
    /// Equilibria: unstable means `Re(λ) > precision`.
    RealPart,
    /// Floquet multipliers: unstable means `|μ| > 1 + precision`.
    Modulus,
}

/// `(n_unstable, n_imag)` for a set of eigen-elements.
pub fn unstable_counts(
    values: &[Complex<f64>],
    rule: StabilityRule,
    precision: f64,
) -> (i64, i64) {
    let mut n_unstable = 0;
    let mut n_imag = 0;
    for v in values {
        let unstable = match rule {
            StabilityRule::RealPart => v.re > precision,
            StabilityRule::Modulus => v.norm() > 1.0 + precision,
        };
        if unstable {
            n_unstable += 1;
            if v.im.abs() > precision {
                n_imag += 1;
            }
        }
    }
    (n_unstable, n_imag)
}

/// Classification of a change in the unstable count at an equilibrium.
/// A pure function of `(Δ n_unstable, Δ n_imag)`.
pub fn classify_equilibrium(delta: (i64, i64)) -> BifurcationKind {
    match delta {
        (1, 0) | (-1, 0) => BifurcationKind::BranchPoint,
        (2, 2) | (-2, -2) => BifurcationKind::Hopf,
        _ => BifurcationKind::Nd,
    }
}

/// Classification of a Floquet-multiplier crossing from the spectrum after
/// the change. The trivial multiplier (the one closest to +1) is excluded
/// before looking for the crossing mode.
pub fn classify_cycle(multipliers: &[Complex<f64>], precision: f64) -> BifurcationKind {
    let crossing = crossing_multiplier(multipliers, precision);
    match crossing {
        Some((_, mu)) => {
            if mu.im.abs() <= precision.max(1e-9) {
                if mu.re > 0.0 {
                    BifurcationKind::Fold
                } else {
                    BifurcationKind::PeriodDoubling
                }
            } else {
                BifurcationKind::NeimarkSacker
            }
        }
        None => BifurcationKind::Nd,
    }
}

/// Index and value of the non-trivial multiplier nearest the unit circle.
pub fn crossing_multiplier(
    multipliers: &[Complex<f64>],
    _precision: f64,
) -> Option<(usize, Complex<f64>)> {
    if multipliers.is_empty() {
        return None;
    }
    let trivial = multipliers
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            let da = (*a - Complex::new(1.0, 0.0)).norm();
            let db = (*b - Complex::new(1.0, 0.0)).norm();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)?;

    multipliers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != trivial)
        .min_by(|(_, a), (_, b)| {
            let da = (a.norm() - 1.0).abs();
            let db = (b.norm() - 1.0).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, v)| (i, *v))
}

/// Index of the eigenvalue that crossed the stability boundary, for the
/// `ind_bif` field of a detected point.
pub fn crossing_eigenvalue_index(
    values: &[Complex<f64>],
    rule: StabilityRule,
    precision: f64,
) -> usize {
    match rule {
        StabilityRule::RealPart => values
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.re.abs()
                    .partial_cmp(&b.re.abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0),
        StabilityRule::Modulus => crossing_multiplier(values, precision)
            .map(|(i, _)| i)
            .unwrap_or(0),
    }
}
