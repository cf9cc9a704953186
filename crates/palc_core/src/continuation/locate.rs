//! Bifurcation localization.
//!
//! Bisection in arclength refines a detected change of the unstable count;
//! the fold guess comes from the quadratic vertex of p against arclength.

use num_complex::Complex;
use tracing::{debug, warn};

use super::{ContIterator, SpectrumSample};
use crate::algebra::{BorderedPair, BranchVector};
use crate::bordered::BorderedSolver;
use crate::error::Result;
use crate::predictor::{predict, secant_tangent, Predictor};
use crate::system::VectorField;

/// Refined point produced by the bisection locator.
pub struct Bisection<V> {
    pub z: BorderedPair<V>,
    pub tau: BorderedPair<V>,
    pub counts: (i64, i64),
    pub values: Vec<Complex<f64>>,
    pub converged: bool,
}

/// Vertex `(s*, p(s*))` of the parabola through three `(s, p)` samples.
/// `None` when the samples are (numerically) collinear.
pub(crate) fn fold_vertex(pts: [(f64, f64); 3]) -> Option<(f64, f64)> {
    let [(s1, p1), (s2, p2), (s3, p3)] = pts;
    let d1 = (p2 - p1) / (s2 - s1);
    let d2 = ((p3 - p2) / (s3 - s2) - d1) / (s3 - s1);
    if !d2.is_finite() || d2.abs() < 1e-14 {
        return None;
    }
    let s_star = 0.5 * (s1 + s2) - d1 / (2.0 * d2);
    let p_star = p1 + d1 * (s_star - s1) + d2 * (s_star - s1) * (s_star - s2);
    Some((s_star, p_star))
}

impl<S, BS> ContIterator<'_, S, BS>
where
    S: VectorField,
    BS: BorderedSolver<S::State, S::Jacobian>,
{
    /// Bisection in arclength between the two confirmed points bracketing a
    /// change of `n_unstable`. Starts from the point before the change and
    /// alternates predict/correct with halving `ds`, flipping direction at
    /// each sign inversion of the count change, until `n_inversion`
    /// inversions have been seen (success) or the budget runs out.
    ///
    /// Verbosity is suppressed for the duration. `Ok(None)` means no
    /// corrected point past the transition was found at all.
    pub(crate) fn bisect_bifurcation(
        &mut self,
        z_before: &BorderedPair<S::State>,
        tau_before: &BorderedPair<S::State>,
        counts_before: (i64, i64),
        ds_used: f64,
    ) -> Result<Option<Bisection<S::State>>> {
        let saved_verbosity = self.verbosity;
        self.verbosity = 0;
        let result = self.bisect_inner(z_before, tau_before, counts_before, ds_used);
        self.verbosity = saved_verbosity;
        result
    }

    fn bisect_inner(
        &mut self,
        z_before: &BorderedPair<S::State>,
        tau_before: &BorderedPair<S::State>,
        counts_before: (i64, i64),
        ds_used: f64,
    ) -> Result<Option<Bisection<S::State>>> {
        let params = *self.params();
        let theta = self.state().theta;

        let mut z_work = z_before.clone();
        // The incoming tangent may be unnormalized (natural predictor);
        // bisection arclength only makes sense against a unit tangent.
        let mut tau = tau_before.clone();
        let n = crate::algebra::norm_theta(&tau, theta, None);
        if n > 0.0 {
            tau.scale(1.0 / n);
        }
        let mut side = counts_before.0;
        let mut ds = ds_used / 2.0;
        let mut inversions = 0usize;
        let mut candidate: Option<Bisection<S::State>> = None;

        for step in 0..params.max_bisection_steps {
            if inversions >= params.n_inversion || ds.abs() < params.ds_min_bisection {
                break;
            }

            let z_pred = predict(Predictor::Secant, &z_work, &tau, ds);
            let outcome = match self.correct(&z_pred, &z_work, &tau, ds) {
                Ok(out) if out.converged => out,
                Ok(_) => {
                    ds /= 2.0;
                    continue;
                }
                Err(e) if e.is_recoverable() => {
                    ds /= 2.0;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let z_new = outcome.x;

            let tau_new = match secant_tangent(&z_new, &z_work, ds, theta, None) {
                Ok(t) => t,
                Err(_) => break,
            };

            let sample: SpectrumSample = self.sample_spectrum(&z_new.u, z_new.p);
            if !sample.ok && sample.counts.0 < 0 {
                warn!("eigensolver failed during bisection");
                break;
            }
            let (nu, ni) = sample.counts;
            debug!(step, ds, p = z_new.p, n_unstable = nu, "bisection iterate");

            if nu != side {
                inversions += 1;
                ds = -ds / 2.0;
            }
            if nu != counts_before.0 {
                candidate = Some(Bisection {
                    z: z_new.clone(),
                    tau: tau_new.clone(),
                    counts: (nu, ni),
                    values: sample.values,
                    converged: false,
                });
            }
            side = nu;
            z_work = z_new;
            tau = tau_new;
        }

        // Success: the requested inversion count, or the step floor reached
        // with the transition bracketed at that resolution.
        let converged = inversions >= params.n_inversion
            || (ds.abs() < params.ds_min_bisection && inversions > 0);
        Ok(candidate.map(|mut c| {
            c.converged = converged;
            c
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_of_exact_parabola() {
        // p(s) = 1 - (s - 2)^2, vertex at s = 2, p = 1.
        let p = |s: f64| 1.0 - (s - 2.0) * (s - 2.0);
        let (s_star, p_star) = fold_vertex([(1.0, p(1.0)), (1.8, p(1.8)), (3.0, p(3.0))]).unwrap();
        assert!((s_star - 2.0).abs() < 1e-12);
        assert!((p_star - 1.0).abs() < 1e-12);
    }

    #[test]
    fn collinear_samples_give_no_vertex() {
        assert!(fold_vertex([(0.0, 0.0), (1.0, 1.0), (2.0, 2.0)]).is_none());
    }
}
