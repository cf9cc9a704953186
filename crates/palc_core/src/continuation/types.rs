//! Parameter, state and record types for the continuation engine.

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::algebra::BorderedPair;
use crate::error::{Error, Result};
use crate::newton::NewtonParams;

/// Immutable configuration of a continuation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationParams {
    pub ds_min: f64,
    pub ds_max: f64,
    /// Initial signed arclength step; `|ds| ∈ [ds_min, ds_max]`.
    pub ds: f64,
    /// Weight of the state leg in the arclength metric, in (0, 1).
    pub theta: f64,
    pub do_arclength_scaling: bool,
    pub g_goal: f64,
    pub g_max: f64,
    pub theta_min: f64,
    /// Exponent of the angle factor in the step-size update.
    pub tangent_exponent: f64,
    pub p_min: f64,
    pub p_max: f64,
    pub max_steps: usize,
    pub newton: NewtonParams,
    pub detect_fold: bool,
    /// 0 = off, 1 = flag sign changes, 2 = localize them by bisection.
    pub detect_bifurcation: u8,
    pub precision_stability: f64,
    pub ds_min_bisection: f64,
    /// Must be even.
    pub n_inversion: usize,
    pub max_bisection_steps: usize,
    pub compute_eigenvalues: bool,
    pub nev: usize,
    pub save_eig_every: usize,
    pub save_eigenvectors: bool,
    /// 0 disables solution snapshots.
    pub save_sol_every: usize,
    /// 0 disables the plot hook.
    pub plot_every: usize,
    /// Step-adaptation aggressiveness.
    pub a: f64,
    pub fin_diff_eps: f64,
}

impl Default for ContinuationParams {
    fn default() -> Self {
        Self {
            ds_min: 1e-4,
            ds_max: 0.1,
            ds: 0.01,
            theta: 0.5,
            do_arclength_scaling: false,
            g_goal: 0.5,
            g_max: 0.8,
            theta_min: 1e-3,
            tangent_exponent: 1.5,
            p_min: f64::NEG_INFINITY,
            p_max: f64::INFINITY,
            max_steps: 100,
            newton: NewtonParams::default(),
            detect_fold: true,
            detect_bifurcation: 0,
            precision_stability: 1e-10,
            ds_min_bisection: 1e-8,
            n_inversion: 2,
            max_bisection_steps: 15,
            compute_eigenvalues: false,
            nev: 8,
            save_eig_every: 1,
            save_eigenvectors: false,
            save_sol_every: 0,
            plot_every: 0,
            a: 0.5,
            fin_diff_eps: 1e-8,
        }
    }
}

impl ContinuationParams {
    pub fn validate(&self) -> Result<()> {
        let fail = |what: &str| {
            Err(Error::InvalidConfig {
                what: what.to_string(),
            })
        };
        if !(self.ds_min > 0.0) {
            return fail("ds_min must be positive");
        }
        if self.ds_max < self.ds_min {
            return fail("ds_max must be >= ds_min");
        }
        let ads = self.ds.abs();
        if !(ads >= self.ds_min && ads <= self.ds_max) {
            return fail("|ds| must lie in [ds_min, ds_max]");
        }
        if !(self.theta > 0.0 && self.theta < 1.0) {
            return fail("theta must lie in (0, 1)");
        }
        if self.p_min > self.p_max {
            return fail("p_min must be <= p_max");
        }
        if self.max_steps == 0 {
            return fail("max_steps must be positive");
        }
        if self.detect_bifurcation > 2 {
            return fail("detect_bifurcation must be 0, 1 or 2");
        }
        if self.n_inversion % 2 != 0 {
            return fail("n_inversion must be even");
        }
        if !(self.ds_min_bisection > 0.0) {
            return fail("ds_min_bisection must be positive");
        }
        if self.do_arclength_scaling {
            if !(self.g_goal > 0.0 && self.g_goal < 1.0) {
                return fail("g_goal must lie in (0, 1)");
            }
            if !(self.g_max > 0.0 && self.g_max < 1.0) {
                return fail("g_max must lie in (0, 1)");
            }
            if !(self.theta_min > 0.0 && self.theta_min < self.theta) {
                return fail("theta_min must lie in (0, theta)");
            }
        }
        if !(self.fin_diff_eps > 0.0) {
            return fail("fin_diff_eps must be positive");
        }
        if self.a < 0.0 {
            return fail("aggressiveness a must be non-negative");
        }
        self.newton.validate()
    }
}

/// Why the iteration stopped. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxSteps,
    /// The parameter left `[p_min, p_max]`.
    BoundaryReached,
    /// A user hook returned false.
    UserAbort,
    /// Newton kept failing with `|ds|` already at `ds_min`.
    StepFailure,
}

/// Bifurcation classification attached to detected points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BifurcationKind {
    None,
    Fold,
    Hopf,
    BranchPoint,
    NeimarkSacker,
    PeriodDoubling,
    /// Degenerate / unclassified change of the unstable count.
    Nd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BifStatus {
    Guess,
    Converged,
    NotConverged,
}

/// A detected (and possibly refined) bifurcation point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "V: Serialize",
    deserialize = "V: serde::de::DeserializeOwned"
))]
pub struct BifPoint<V> {
    pub kind: BifurcationKind,
    /// Index into `BranchRecord::points` of the confirmed point just after
    /// the change (for folds, of the middle point).
    pub idx: usize,
    pub param: f64,
    pub norm: f64,
    pub printsol: f64,
    pub u: V,
    pub tau: BorderedPair<V>,
    /// Index of the crossing eigenvalue in the associated snapshot.
    pub ind_bif: usize,
    pub step: usize,
    pub status: BifStatus,
    /// (Δ n_unstable, Δ n_imag) across the change.
    pub delta: (i64, i64),
}

/// One summary row per confirmed step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BranchPoint {
    pub step: usize,
    pub p: f64,
    pub printsol: f64,
    pub newton_iterations: usize,
    /// The ds used to reach this point.
    pub ds: f64,
    pub theta: f64,
    pub n_unstable: i64,
    pub n_imag: i64,
    pub stable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenSnapshot {
    pub step: usize,
    pub values: Vec<Complex<f64>>,
    pub vectors: Option<Vec<Vec<Complex<f64>>>>,
    pub converged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "V: Serialize",
    deserialize = "V: serde::de::DeserializeOwned"
))]
pub struct SavedSolution<V> {
    pub step: usize,
    pub p: f64,
    pub u: V,
}

/// Append-only record of a continuation run, in step order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "V: Serialize",
    deserialize = "V: serde::de::DeserializeOwned"
))]
pub struct BranchRecord<V> {
    pub points: Vec<BranchPoint>,
    pub eigen: Vec<EigenSnapshot>,
    pub bifpoints: Vec<BifPoint<V>>,
    pub foldpoints: Vec<BifPoint<V>>,
    pub solutions: Vec<SavedSolution<V>>,
    pub stop: Option<StopReason>,
}

impl<V> Default for BranchRecord<V> {
    fn default() -> Self {
        Self {
            points: Vec::new(),
            eigen: Vec::new(),
            bifpoints: Vec::new(),
            foldpoints: Vec::new(),
            solutions: Vec::new(),
            stop: None,
        }
    }
}

/// Mutable state of the continuation iterator, yielded as snapshots.
#[derive(Debug, Clone)]
pub struct IterState<V> {
    pub z_pred: BorderedPair<V>,
    /// Most recent tangent candidate (the confirmed one is `tau_old`).
    pub tau_new: BorderedPair<V>,
    /// Last confirmed solution.
    pub z_old: BorderedPair<V>,
    /// Unit tangent (theta norm) at the last confirmed solution.
    pub tau_old: BorderedPair<V>,
    pub converged: bool,
    pub newton_iterations: usize,
    pub step: usize,
    pub ds: f64,
    pub theta: f64,
    pub stop: Option<StopReason>,
    pub stepsize_control: bool,
    /// (current, previous); -1 encodes "unknown".
    pub n_unstable: (i64, i64),
    pub n_imag: (i64, i64),
    pub eigvals: Option<Vec<Complex<f64>>>,
    pub eigvecs: Option<Vec<Vec<Complex<f64>>>>,
}

impl<V> IterState<V> {
    pub fn stable(&self) -> bool {
        self.n_unstable.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_validate() {
        ContinuationParams::default().validate().unwrap();
    }

    #[test]
    fn odd_inversion_count_is_rejected() {
        let params = ContinuationParams {
            n_inversion: 3,
            ..ContinuationParams::default()
        };
        assert!(matches!(
            params.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn step_bounds_are_checked() {
        let params = ContinuationParams {
            ds_min: 0.1,
            ds_max: 0.01,
            ..ContinuationParams::default()
        };
        assert!(params.validate().is_err());

        let params = ContinuationParams {
            ds: 1.0,
            ..ContinuationParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn theta_out_of_range_is_rejected() {
        let params = ContinuationParams {
            theta: 1.0,
            ..ContinuationParams::default()
        };
        assert!(params.validate().is_err());
    }
}
