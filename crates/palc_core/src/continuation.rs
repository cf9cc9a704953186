//! Pseudo-arclength continuation of `F(x, p) = 0`.
//!
//! The iterator is a single-threaded cooperative state machine: each call to
//! `next` runs predictor → corrector → tangent update → stability
//! bookkeeping → detection → step control, appends to the branch record and
//! yields a snapshot of [`IterState`]. All user I/O happens through the
//! [`Hooks`]; returning `false` from a hook is the cancellation signal.

#[path = "continuation/types.rs"]
pub mod types;

#[path = "continuation/stability.rs"]
pub mod stability;

#[path = "continuation/locate.rs"]
pub mod locate;

#[path = "continuation/fold_curve.rs"]
pub mod fold_curve;

#[path = "continuation/hopf_curve.rs"]
pub mod hopf_curve;

use std::collections::VecDeque;

use num_complex::Complex;
use tracing::{debug, info, warn};

pub use stability::StabilityRule;
pub use types::{
    BifPoint, BifStatus, BifurcationKind, BranchPoint, BranchRecord, ContinuationParams,
    EigenSnapshot, IterState, SavedSolution, StopReason,
};

use self::fold_curve::newton_fold;
use crate::algebra::{dot_theta, norm_theta, BorderedPair, BranchVector, StateDot};
use crate::bordered::BorderedSolver;
use crate::error::{Error, Result};
use crate::linear::{EigenDecomp, EigenSolver, EigenWhich};
use crate::newton::{newton, NewtonOutcome};
use crate::predictor::{predict, secant_tangent, update_tangent, Predictor};
use crate::system::VectorField;
use stability::{
    classify_cycle, classify_equilibrium, crossing_eigenvalue_index, unstable_counts,
};

/// Eigen-elements of the problem at `(u, p)` with `nev` requested modes.
pub type SpectrumFn<'a, V> = Box<dyn FnMut(&V, f64, usize) -> anyhow::Result<EigenDecomp> + 'a>;

/// User hooks. Every one is optional; the `bool`-returning ones cancel the
/// run by returning `false`.
pub struct Hooks<'a, V> {
    /// Scalar summary recorded per step; defaults to the state ∞-norm.
    pub print_solution: Option<Box<dyn Fn(&V, f64) -> f64 + 'a>>,
    /// Called after each confirmed step.
    pub finalise: Option<Box<dyn FnMut(&IterState<V>) -> bool + 'a>>,
    /// Called every `plot_every` steps.
    pub plot: Option<Box<dyn FnMut(&V, f64, usize) + 'a>>,
    /// Forwarded to the Newton corrector: `(x, f, residual, iteration)`.
    pub newton_callback:
        Option<Box<dyn FnMut(&BorderedPair<V>, &BorderedPair<V>, f64, usize) -> bool + 'a>>,
    /// Replaces the `⟨u₁,u₂⟩ / len(u)` factor of the arclength metric.
    pub state_dot: Option<Box<dyn Fn(&V, &V) -> f64 + 'a>>,
}

impl<V> Default for Hooks<'_, V> {
    fn default() -> Self {
        Self {
            print_solution: None,
            finalise: None,
            plot: None,
            newton_callback: None,
            state_dot: None,
        }
    }
}

pub(crate) struct SpectrumSample {
    pub values: Vec<Complex<f64>>,
    pub vectors: Option<Vec<Vec<Complex<f64>>>>,
    pub counts: (i64, i64),
    pub ok: bool,
}

/// Result of a full continuation run. Recoverable terminations are encoded
/// in `record.stop`; a fatal failure ends the run early and is carried in
/// `failure` together with the partial record.
pub struct ContinuationOutcome<V> {
    pub record: BranchRecord<V>,
    pub last: BorderedPair<V>,
    pub tau: BorderedPair<V>,
    pub failure: Option<Error>,
}

/// The continuation state machine.
pub struct ContIterator<'a, S, BS>
where
    S: VectorField,
    BS: BorderedSolver<S::State, S::Jacobian>,
{
    field: &'a S,
    bls: &'a BS,
    params: ContinuationParams,
    predictor: Predictor,
    rule: StabilityRule,
    spectrum: Option<SpectrumFn<'a, S::State>>,
    hooks: Hooks<'a, S::State>,
    pub verbosity: u8,
    state: IterState<S::State>,
    record: BranchRecord<S::State>,
    /// Last three confirmed points as (arclength, point), for fold detection.
    recent: VecDeque<(f64, BorderedPair<S::State>)>,
    arclength: f64,
    bootstrapped: bool,
    finished: bool,
}

impl<'a, S, BS> ContIterator<'a, S, BS>
where
    S: VectorField,
    BS: BorderedSolver<S::State, S::Jacobian>,
{
    pub fn new(
        field: &'a S,
        bls: &'a BS,
        x0: S::State,
        p0: f64,
        params: ContinuationParams,
        predictor: Predictor,
    ) -> Result<Self> {
        params.validate()?;
        let z0 = BorderedPair::new(x0, p0);
        let tau0 = z0.zero_like();
        let state = IterState {
            z_pred: z0.clone(),
            tau_new: tau0.clone(),
            z_old: z0,
            tau_old: tau0,
            converged: false,
            newton_iterations: 0,
            step: 0,
            ds: params.ds,
            theta: params.theta,
            stop: None,
            stepsize_control: true,
            n_unstable: (-1, -1),
            n_imag: (-1, -1),
            eigvals: None,
            eigvecs: None,
        };
        Ok(Self {
            field,
            bls,
            params,
            predictor,
            rule: StabilityRule::RealPart,
            spectrum: None,
            hooks: Hooks::default(),
            verbosity: 1,
            state,
            record: BranchRecord::default(),
            recent: VecDeque::with_capacity(3),
            arclength: 0.0,
            bootstrapped: false,
            finished: false,
        })
    }

    pub fn with_spectrum(mut self, spectrum: SpectrumFn<'a, S::State>, rule: StabilityRule) -> Self {
        self.spectrum = Some(spectrum);
        self.rule = rule;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks<'a, S::State>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn state(&self) -> &IterState<S::State> {
        &self.state
    }

    pub fn record(&self) -> &BranchRecord<S::State> {
        &self.record
    }

    pub fn params(&self) -> &ContinuationParams {
        &self.params
    }

    /// Drive the iteration to completion. A fatal failure terminates the
    /// run and is returned alongside the partial record.
    pub fn run(mut self) -> ContinuationOutcome<S::State> {
        let failure = loop {
            match self.advance() {
                Ok(Some(_)) => {}
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };
        ContinuationOutcome {
            record: self.record,
            last: self.state.z_old,
            tau: self.state.tau_old,
            failure,
        }
    }

    fn stop_with(&mut self, reason: StopReason) {
        if self.state.stop.is_none() {
            self.state.stop = Some(reason);
            self.record.stop = Some(reason);
            if self.verbosity > 0 {
                info!(?reason, step = self.state.step, "continuation stopped");
            }
        }
    }

    fn print_solution(&self, z: &BorderedPair<S::State>) -> f64 {
        match self.hooks.print_solution.as_ref() {
            Some(f) => f(&z.u, z.p),
            None => z.u.norm(),
        }
    }

    /// Newton on `F(·, p)` at fixed parameter, through the bordered solver
    /// with a trivial constraint row.
    pub(crate) fn plain_newton(&mut self, x0: S::State, p: f64) -> Result<NewtonOutcome<S::State>> {
        let field = self.field;
        let bls = self.bls;
        let newton_params = self.params.newton;

        let residual = |x: &S::State| -> Result<S::State> { Ok(field.eval(x, p)?) };
        let solve = |x: &S::State, f: &S::State| -> Result<S::State> {
            let jac = field.jacobian(x, p)?;
            let zero = x.zero_like();
            let (d, _y) = bls.solve(&jac, &zero, &zero, 1.0, 0.0, 1.0, f, 0.0, None)?;
            Ok(d)
        };
        newton(x0, residual, solve, &newton_params, None, None)
    }

    /// One Newton run on the extended system
    /// `G = [F(x, p); ⟨(x, p) − z_ref, τ⟩_θ − ds]` with the bordered
    /// Jacobian of the PALC constraint.
    pub(crate) fn correct(
        &mut self,
        z_pred: &BorderedPair<S::State>,
        z_ref: &BorderedPair<S::State>,
        tau: &BorderedPair<S::State>,
        ds: f64,
    ) -> Result<NewtonOutcome<BorderedPair<S::State>>> {
        let field = self.field;
        let bls = self.bls;
        let theta = self.state.theta;
        let eps = self.params.fin_diff_eps;
        let newton_params = self.params.newton;
        let Hooks {
            state_dot,
            newton_callback,
            ..
        } = &mut self.hooks;
        let custom: Option<StateDot<'_, S::State>> = state_dot.as_deref();

        let residual = |z: &BorderedPair<S::State>| -> Result<BorderedPair<S::State>> {
            let f = field.eval(&z.u, z.p)?;
            let dz = z.minus(z_ref);
            let n = dot_theta(&dz, tau, theta, custom) - ds;
            Ok(BorderedPair::new(f, n))
        };

        let solve = |z: &BorderedPair<S::State>,
                     rhs: &BorderedPair<S::State>|
         -> Result<BorderedPair<S::State>> {
            let jac = field.jacobian(&z.u, z.p)?;
            let dfdp = field.dfdp(&z.u, z.p, eps)?;
            let xi_u = theta / z.u.len().max(1) as f64;
            let xi_p = 1.0 - theta;
            let (x, y) = bls.solve(&jac, &dfdp, &tau.u, tau.p, xi_u, xi_p, &rhs.u, rhs.p, None)?;
            Ok(BorderedPair::new(x, y))
        };

        let mut shim;
        let callback: Option<crate::newton::NewtonCallback<'_, BorderedPair<S::State>>> =
            match newton_callback.as_mut() {
                Some(cb) => {
                    shim = |a: &BorderedPair<S::State>,
                            b: &BorderedPair<S::State>,
                            r: f64,
                            i: usize| cb(a, b, r, i);
                    Some(&mut shim)
                }
                None => None,
            };

        newton(z_pred.clone(), residual, solve, &newton_params, None, callback)
    }

    /// Call the spectrum closure, growing `nev` until at least one stable
    /// eigen-element is visible. Never errors: a failing eigensolver yields
    /// `ok = false` and unknown counts.
    pub(crate) fn sample_spectrum(&mut self, u: &S::State, p: f64) -> SpectrumSample {
        let Some(spec) = self.spectrum.as_mut() else {
            return SpectrumSample {
                values: Vec::new(),
                vectors: None,
                counts: (-1, -1),
                ok: false,
            };
        };
        let precision = self.params.precision_stability;
        let rule = self.rule;
        let cap = u.len().max(1);
        let mut nev = self.params.nev.max(1).min(cap);
        loop {
            match spec(u, p, nev) {
                Err(e) => {
                    warn!(error = %e, "eigensolver failed; stability unknown at this step");
                    return SpectrumSample {
                        values: Vec::new(),
                        vectors: None,
                        counts: (-1, -1),
                        ok: false,
                    };
                }
                Ok(dec) => {
                    let counts = unstable_counts(&dec.values, rule, precision);
                    let all_unstable =
                        counts.0 >= dec.values.len() as i64 && !dec.values.is_empty();
                    if all_unstable && nev < cap {
                        nev = (nev * 2).min(cap);
                        debug!(nev, "all returned eigenvalues unstable; growing nev");
                        continue;
                    }
                    return SpectrumSample {
                        values: dec.values,
                        vectors: dec.vectors,
                        counts,
                        ok: dec.converged,
                    };
                }
            }
        }
    }

    /// Refresh the spectrum at the (already committed) current point, shift
    /// the count pairs and append the snapshot.
    fn refresh_spectrum(&mut self, step: usize) {
        let u = self.state.z_old.u.clone();
        let p = self.state.z_old.p;
        let sample = self.sample_spectrum(&u, p);
        self.state.n_unstable = (sample.counts.0, self.state.n_unstable.0);
        self.state.n_imag = (sample.counts.1, self.state.n_imag.0);
        self.state.eigvals = Some(sample.values.clone());
        let vectors = if self.params.save_eigenvectors {
            sample.vectors
        } else {
            None
        };
        self.state.eigvecs = vectors.clone();
        self.record.eigen.push(EigenSnapshot {
            step,
            values: sample.values,
            vectors,
            converged: sample.ok,
        });
    }

    fn bootstrap(&mut self) -> Result<()> {
        if self.verbosity > 0 {
            info!(p = self.state.z_old.p, "converging initial guess");
        }
        let p0 = self.state.z_old.p;
        let x0 = self.state.z_old.u.clone();
        let sol0 = self.plain_newton(x0, p0)?;
        if !sol0.converged {
            return Err(Error::Convergence {
                context: "failed to converge initial guess",
                iterations: sol0.iterations,
                residual: sol0.residuals.last().copied().unwrap_or(f64::NAN),
            });
        }

        // Second solve a small parameter increment away, for the initial
        // secant direction.
        let ds50 = self.state.ds / 50.0;
        let p1 = p0 + ds50;
        let sol1 = self.plain_newton(sol0.x.clone(), p1)?;
        if !sol1.converged {
            return Err(Error::Convergence {
                context: "failed to converge initial guess",
                iterations: sol1.iterations,
                residual: sol1.residuals.last().copied().unwrap_or(f64::NAN),
            });
        }

        let z0 = BorderedPair::new(sol0.x, p0);
        let z1 = BorderedPair::new(sol1.x, p1);
        let tau = {
            let custom = self.hooks.state_dot.as_deref();
            secant_tangent(&z1, &z0, ds50, self.state.theta, custom)?
        };

        self.state.z_pred = z0.clone();
        self.state.z_old = z0.clone();
        self.state.tau_old = tau.clone();
        self.state.tau_new = tau;
        self.state.converged = true;
        self.state.newton_iterations = sol0.iterations;

        if self.params.compute_eigenvalues && self.spectrum.is_some() {
            self.refresh_spectrum(0);
        }

        self.recent.push_back((0.0, z0.clone()));
        let printsol = self.print_solution(&z0);
        self.record.points.push(BranchPoint {
            step: 0,
            p: p0,
            printsol,
            newton_iterations: self.state.newton_iterations,
            ds: self.state.ds,
            theta: self.state.theta,
            n_unstable: self.state.n_unstable.0,
            n_imag: self.state.n_imag.0,
            stable: self.state.stable(),
        });
        Ok(())
    }

    fn shrink_ds(&mut self) -> bool {
        let ds = self.state.ds;
        if ds.abs() <= self.params.ds_min * (1.0 + 1e-12) {
            return false;
        }
        self.state.ds = ds.signum() * (ds.abs() / 2.0).max(self.params.ds_min);
        if self.verbosity > 0 {
            info!(ds = self.state.ds, "corrector failed, halving step");
        }
        true
    }

    /// Step-size update after a confirmed step, plus angle control and the
    /// optional arclength rescaling of theta.
    fn adapt_step(&mut self, iterations: usize, tau_prev: &BorderedPair<S::State>) {
        if !self.state.stepsize_control {
            return;
        }
        let nmax = self.params.newton.max_iter as f64;
        let gain = ((nmax - iterations as f64) / nmax).powi(2);
        let mut ds = self.state.ds * (1.0 + self.params.a * gain);

        // Angle control: shrink growth where the branch turns quickly.
        let theta = self.state.theta;
        let custom = self.hooks.state_dot.as_deref();
        let n_new = norm_theta(&self.state.tau_old, theta, custom);
        let n_prev = norm_theta(tau_prev, theta, custom);
        if n_new > 0.0 && n_prev > 0.0 {
            let cos = (dot_theta(&self.state.tau_old, tau_prev, theta, custom) / (n_new * n_prev))
                .abs()
                .min(1.0);
            if cos > 0.0 {
                ds *= cos.powf(self.params.tangent_exponent);
            }
        }

        self.state.ds = ds.signum() * ds.abs().clamp(self.params.ds_min, self.params.ds_max);

        if self.params.do_arclength_scaling {
            self.rescale_theta();
        }
    }

    /// Retune theta so the parameter contribution to the arclength metric
    /// meets `g_goal` whenever it exceeds `g_max`.
    fn rescale_theta(&mut self) {
        let tp = self.state.tau_old.p.abs();
        if tp * self.state.theta <= self.params.g_max || tp <= 0.0 || tp >= 1.0 {
            return;
        }
        let g = self.params.g_goal;
        let theta = (g / tp) * ((1.0 - g * g) / (1.0 - tp * tp)).sqrt();
        let theta = theta.clamp(self.params.theta_min, 0.999);
        debug!(theta, "arclength scaling retuned theta");
        self.state.theta = theta;
        let n = norm_theta(&self.state.tau_old, theta, self.hooks.state_dot.as_deref());
        if n > 0.0 {
            self.state.tau_old.scale(1.0 / n);
        }
    }

    /// Fold locator: flag non-monotone `p` across the last three confirmed
    /// points, estimate the turning point from the quadratic vertex of p
    /// against arclength, then Newton-refine with the fold defining system.
    /// A failed refinement keeps the guess.
    fn detect_fold_point(&mut self, step: usize) {
        if self.recent.len() < 3 {
            return;
        }
        let (s1, p1) = (self.recent[0].0, self.recent[0].1.p);
        let (s2, p2) = (self.recent[1].0, self.recent[1].1.p);
        let (s3, p3) = (self.recent[2].0, self.recent[2].1.p);
        if (p2 - p1) * (p3 - p2) >= 0.0 {
            return;
        }
        let (_s_star, p_star) =
            locate::fold_vertex([(s1, p1), (s2, p2), (s3, p3)]).unwrap_or((s2, p2));
        if self.verbosity > 0 {
            info!(p = p_star, step = step - 1, "fold detected");
        }
        let z_mid = self.recent[1].1.clone();
        let printsol = self.print_solution(&z_mid);
        let idx = self.record.points.len() - 1;
        let mut point = BifPoint {
            kind: BifurcationKind::Fold,
            idx,
            param: p_star,
            norm: z_mid.u.norm(),
            printsol,
            u: z_mid.u.clone(),
            tau: self.state.tau_old.clone(),
            ind_bif: 0,
            step: step - 1,
            status: BifStatus::Guess,
            delta: (0, 0),
        };

        // Refinement seeded from the vertex guess; the state leg of the
        // branch tangent approximates the null vector near the fold.
        let field = self.field;
        let bls = self.bls;
        let newton_params = self.params.newton;
        let eps = self.params.fin_diff_eps;
        match newton_fold(
            field,
            &z_mid.u,
            p_star,
            Some(&self.state.tau_old.u),
            None,
            &newton_params,
            bls,
            eps,
        ) {
            Ok(fold) if fold.converged => {
                let refined = BorderedPair::new(fold.x, fold.p);
                point.param = refined.p;
                point.norm = refined.u.norm();
                point.printsol = self.print_solution(&refined);
                point.u = refined.u;
                // The branch tangent at a fold has no parameter component.
                let mut tau = BorderedPair::new(fold.v, 0.0);
                let n = norm_theta(&tau, self.state.theta, self.hooks.state_dot.as_deref());
                if n > 0.0 {
                    tau.scale(1.0 / n);
                }
                point.tau = tau;
                point.status = BifStatus::Converged;
                if self.verbosity > 0 {
                    info!(p = point.param, "fold refined");
                }
            }
            Ok(_) => point.status = BifStatus::NotConverged,
            Err(e) => {
                warn!(error = %e, "fold refinement failed, keeping the guess");
                point.status = BifStatus::NotConverged;
            }
        }

        self.record.foldpoints.push(point);
    }

    fn detect_bifurcation(
        &mut self,
        z_prev: &BorderedPair<S::State>,
        tau_prev: &BorderedPair<S::State>,
        ds_used: f64,
        step: usize,
    ) -> Result<()> {
        let (cur, prev) = self.state.n_unstable;
        if cur < 0 || prev < 0 || cur == prev {
            return Ok(());
        }
        let delta = (cur - prev, self.state.n_imag.0 - self.state.n_imag.1);
        let values = self.state.eigvals.clone().unwrap_or_default();
        let kind = match self.rule {
            StabilityRule::RealPart => classify_equilibrium(delta),
            StabilityRule::Modulus => classify_cycle(&values, self.params.precision_stability),
        };
        let ind_bif =
            crossing_eigenvalue_index(&values, self.rule, self.params.precision_stability);
        if self.verbosity > 0 {
            info!(?kind, delta_unstable = delta.0, step, "bifurcation detected");
        }

        let mut point = BifPoint {
            kind,
            idx: self.record.points.len(),
            param: self.state.z_old.p,
            norm: self.state.z_old.u.norm(),
            printsol: self.print_solution(&self.state.z_old),
            u: self.state.z_old.u.clone(),
            tau: self.state.tau_old.clone(),
            ind_bif,
            step,
            status: BifStatus::Guess,
            delta,
        };

        if self.params.detect_bifurcation >= 2 {
            let counts_before = (prev, self.state.n_imag.1);
            match self.bisect_bifurcation(z_prev, tau_prev, counts_before, ds_used)? {
                Some(refined) => {
                    point.param = refined.z.p;
                    point.norm = refined.z.u.norm();
                    point.printsol = self.print_solution(&refined.z);
                    point.u = refined.z.u.clone();
                    point.tau = refined.tau.clone();
                    point.status = if refined.converged {
                        BifStatus::Converged
                    } else {
                        BifStatus::NotConverged
                    };
                    // Overwrite the current iterate with the refined point.
                    self.state.z_old = refined.z;
                    self.state.tau_old = refined.tau;
                    self.state.n_unstable = (refined.counts.0, prev);
                    self.state.n_imag = (refined.counts.1, self.state.n_imag.1);
                    self.state.eigvals = Some(refined.values);
                    if let Some(back) = self.recent.back_mut() {
                        back.1 = self.state.z_old.clone();
                    }
                }
                None => {
                    point.status = BifStatus::NotConverged;
                }
            }
        }

        self.record.bifpoints.push(point);
        Ok(())
    }

    /// One continuation step. `Ok(None)` means the iteration is over.
    fn advance(&mut self) -> Result<Option<IterState<S::State>>> {
        if self.state.stop.is_some() {
            return Ok(None);
        }
        if !self.bootstrapped {
            self.bootstrap()?;
            self.bootstrapped = true;
            return Ok(Some(self.state.clone()));
        }
        if self.state.step >= self.params.max_steps {
            self.stop_with(StopReason::MaxSteps);
            return Ok(None);
        }

        // Predictor/corrector with ds-halving retries.
        let (z_new, iterations) = loop {
            let ds = self.state.ds;
            let z_old = self.state.z_old.clone();
            let tau_old = self.state.tau_old.clone();
            let z_pred = predict(self.predictor, &z_old, &tau_old, ds);
            self.state.z_pred = z_pred.clone();
            if self.verbosity > 1 {
                debug!(step = self.state.step + 1, ds, p_pred = z_pred.p, "predictor");
            }
            // The natural predictor corrects at fixed parameter; the others
            // solve the extended system with the PALC constraint.
            let attempt = if matches!(self.predictor, Predictor::Natural) {
                self.plain_newton(z_pred.u.clone(), z_pred.p).map(|o| {
                    let z = BorderedPair::new(o.x, z_pred.p);
                    (o.converged, z, o.iterations)
                })
            } else {
                self.correct(&z_pred, &z_old, &tau_old, ds)
                    .map(|o| (o.converged, o.x, o.iterations))
            };
            match attempt {
                Ok((true, z, iterations)) => break (z, iterations),
                Ok((false, _, iterations)) => {
                    self.state.converged = false;
                    self.state.newton_iterations = iterations;
                    if !self.shrink_ds() {
                        self.stop_with(StopReason::StepFailure);
                        return Ok(None);
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "corrector failed");
                    if !self.shrink_ds() {
                        self.stop_with(StopReason::StepFailure);
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        };
        let ds_used = self.state.ds;
        self.state.converged = true;
        self.state.newton_iterations = iterations;

        // Tangent at the new point, per predictor.
        let tau_new = {
            let custom = self.hooks.state_dot.as_deref();
            update_tangent(
                self.predictor,
                self.field,
                self.bls,
                &z_new,
                &self.state.z_old,
                &self.state.tau_old,
                ds_used,
                self.state.theta,
                self.params.fin_diff_eps,
                custom,
            )?
        };

        let z_prev = self.state.z_old.clone();
        let tau_prev = self.state.tau_old.clone();
        let step = self.state.step + 1;

        // Commit the confirmed point.
        self.state.tau_new = tau_new.clone();
        self.state.z_old = z_new.clone();
        self.state.tau_old = tau_new;
        self.state.step = step;
        self.arclength += ds_used.abs();
        self.recent.push_back((self.arclength, z_new.clone()));
        if self.recent.len() > 3 {
            self.recent.pop_front();
        }
        if self.verbosity > 0 {
            info!(step, p = z_new.p, ds = ds_used, iterations, "step converged");
        }

        // Stability refresh on its cadence (step 0 was handled at bootstrap).
        let mut eig_fresh = false;
        if self.params.compute_eigenvalues
            && self.spectrum.is_some()
            && (self.params.save_eig_every <= 1 || step % self.params.save_eig_every == 0)
        {
            self.refresh_spectrum(step);
            eig_fresh = true;
        }

        if self.params.detect_fold {
            self.detect_fold_point(step);
        }

        if self.params.detect_bifurcation >= 1 && eig_fresh {
            self.detect_bifurcation(&z_prev, &tau_prev, ds_used, step)?;
        }

        self.adapt_step(iterations, &tau_prev);

        let printsol = self.print_solution(&self.state.z_old);
        self.record.points.push(BranchPoint {
            step,
            p: self.state.z_old.p,
            printsol,
            newton_iterations: iterations,
            ds: ds_used,
            theta: self.state.theta,
            n_unstable: self.state.n_unstable.0,
            n_imag: self.state.n_imag.0,
            stable: self.state.stable(),
        });

        if self.params.save_sol_every > 0 && step % self.params.save_sol_every == 0 {
            self.record.solutions.push(SavedSolution {
                step,
                p: self.state.z_old.p,
                u: self.state.z_old.u.clone(),
            });
        }
        if self.params.plot_every > 0 && step % self.params.plot_every == 0 {
            let IterState { z_old, .. } = &self.state;
            if let Some(plot) = self.hooks.plot.as_mut() {
                plot(&z_old.u, z_old.p, step);
            }
        }

        if let Some(finalise) = self.hooks.finalise.as_mut() {
            if !finalise(&self.state) {
                self.stop_with(StopReason::UserAbort);
                return Ok(Some(self.state.clone()));
            }
        }

        let p = self.state.z_old.p;
        if p < self.params.p_min || p > self.params.p_max {
            self.stop_with(StopReason::BoundaryReached);
        }

        Ok(Some(self.state.clone()))
    }
}

impl<S, BS> Iterator for ContIterator<'_, S, BS>
where
    S: VectorField,
    BS: BorderedSolver<S::State, S::Jacobian>,
{
    type Item = Result<IterState<S::State>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(state)) => Some(Ok(state)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Trace the branch of `F(x, p) = 0` through `(x0, p0)`.
pub fn continuation<'a, S, BS>(
    field: &'a S,
    bls: &'a BS,
    x0: S::State,
    p0: f64,
    params: ContinuationParams,
    predictor: Predictor,
) -> Result<ContinuationOutcome<S::State>>
where
    S: VectorField,
    BS: BorderedSolver<S::State, S::Jacobian>,
{
    Ok(ContIterator::new(field, bls, x0, p0, params, predictor)?.run())
}

/// Spectrum closure for equilibria: eigenvalues of the problem Jacobian,
/// largest real part first.
pub fn jacobian_spectrum<'a, S, ES>(field: &'a S, eig: &'a ES) -> SpectrumFn<'a, S::State>
where
    S: VectorField,
    ES: EigenSolver<S::Jacobian>,
{
    Box::new(move |u, p, nev| {
        let jac = field.jacobian(u, p)?;
        let dec = eig
            .eigen(&jac, nev, EigenWhich::LargestReal)
            .map_err(anyhow::Error::from)?;
        Ok(dec)
    })
}
