//! Damped Newton iteration over any [`BranchVector`] type.
//!
//! The linear solve is abstracted as a closure `(x, rhs) -> d` solving
//! `J(x)·d = rhs`, so the same routine serves plain problems (Jacobian +
//! linear solver), the PALC corrector (bordered solve) and the deflated
//! variant below.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::algebra::BranchVector;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonParams {
    /// Residual tolerance (∞-norm unless a custom norm is supplied).
    pub tol: f64,
    pub max_iter: usize,
    /// Damping factor applied to each step.
    pub alpha: f64,
    /// Line-search floor for the damping factor.
    pub alpha_min: f64,
    /// Backtrack when the residual would grow.
    pub linesearch: bool,
}

impl Default for NewtonParams {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_iter: 25,
            alpha: 1.0,
            alpha_min: 1.0 / 32.0,
            linesearch: false,
        }
    }
}

impl NewtonParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.tol > 0.0) {
            return Err(Error::InvalidConfig {
                what: "newton tol must be positive".into(),
            });
        }
        if self.max_iter == 0 {
            return Err(Error::InvalidConfig {
                what: "newton max_iter must be positive".into(),
            });
        }
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return Err(Error::InvalidConfig {
                what: "newton alpha must lie in (0, 1]".into(),
            });
        }
        if !(self.alpha_min > 0.0 && self.alpha_min <= self.alpha) {
            return Err(Error::InvalidConfig {
                what: "newton alpha_min must lie in (0, alpha]".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NewtonOutcome<V> {
    pub x: V,
    /// Residual norm after each iteration, starting with the initial guess.
    pub residuals: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
}

/// Per-iteration hook `(x, f, residual, iteration)`; returning `false`
/// aborts the iteration (reported as not converged, not as an error).
pub type NewtonCallback<'a, V> = &'a mut dyn FnMut(&V, &V, f64, usize) -> bool;

/// Classical damped Newton. Reaching `max_iter` is reported through the
/// `converged` flag; only linear-solve and user failures are errors.
pub fn newton<V, R, S>(
    x0: V,
    mut residual: R,
    mut solve_step: S,
    params: &NewtonParams,
    norm: Option<&dyn Fn(&V) -> f64>,
    mut callback: Option<NewtonCallback<'_, V>>,
) -> Result<NewtonOutcome<V>>
where
    V: BranchVector,
    R: FnMut(&V) -> Result<V>,
    S: FnMut(&V, &V) -> Result<V>,
{
    let nrm = |v: &V| match norm {
        Some(f) => f(v),
        None => v.norm(),
    };

    let mut x = x0;
    let mut f = residual(&x)?;
    let mut res = nrm(&f);
    let mut residuals = vec![res];

    let mut iterations = 0;
    while iterations < params.max_iter {
        if res <= params.tol {
            break;
        }
        if let Some(cb) = callback.as_deref_mut() {
            if !cb(&x, &f, res, iterations) {
                return Ok(NewtonOutcome {
                    x,
                    residuals,
                    converged: false,
                    iterations,
                });
            }
        }

        let d = solve_step(&x, &f)?;

        let mut alpha = params.alpha;
        loop {
            let mut xt = x.clone();
            xt.axpy(-alpha, &d);
            let ft = residual(&xt)?;
            let rt = nrm(&ft);
            if !params.linesearch || rt < res || alpha <= params.alpha_min {
                x = xt;
                f = ft;
                res = rt;
                break;
            }
            alpha = (alpha * 0.5).max(params.alpha_min);
        }

        iterations += 1;
        residuals.push(res);
        trace!(iteration = iterations, residual = res, "newton step");
    }

    Ok(NewtonOutcome {
        converged: res <= params.tol,
        x,
        residuals,
        iterations,
    })
}

/// Multiplicative deflation weight `M(x) = ∏ᵢ (⟨x−xᵢ, x−xᵢ⟩^{−power} + shift)`.
///
/// Known roots become repellers of the deflated iteration, so Newton started
/// from the same initial guess lands on a different solution.
#[derive(Debug, Clone)]
pub struct DeflationOperator<V> {
    pub power: f64,
    pub shift: f64,
    pub roots: Vec<V>,
}

impl<V: BranchVector> DeflationOperator<V> {
    pub fn new(power: f64, shift: f64) -> Self {
        Self {
            power,
            shift,
            roots: Vec::new(),
        }
    }

    pub fn push(&mut self, root: V) {
        self.roots.push(root);
    }

    pub fn pop(&mut self) -> Option<V> {
        self.roots.pop()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn root(&self, i: usize) -> &V {
        &self.roots[i]
    }

    fn factors(&self, x: &V) -> Vec<(f64, f64)> {
        // (m_i, d_i) with d_i = ⟨x − xᵢ, x − xᵢ⟩.
        self.roots
            .iter()
            .map(|r| {
                let mut w = x.clone();
                w.axpy(-1.0, r);
                let d = w.dot(&w).max(1e-300);
                (d.powf(-self.power) + self.shift, d)
            })
            .collect()
    }

    pub fn eval(&self, x: &V) -> f64 {
        self.factors(x).iter().map(|(m, _)| m).product::<f64>().max(1e-300)
    }

    /// ∇M(x).
    pub fn gradient(&self, x: &V) -> V {
        let factors = self.factors(x);
        let total: f64 = factors.iter().map(|(m, _)| m).product();
        let mut grad = x.zero_like();
        for (j, r) in self.roots.iter().enumerate() {
            let (m_j, d_j) = factors[j];
            if m_j == 0.0 {
                continue;
            }
            let coeff = (total / m_j) * (-2.0 * self.power * d_j.powf(-self.power - 1.0));
            let mut w = x.clone();
            w.axpy(-1.0, r);
            grad.axpy(coeff, &w);
        }
        grad
    }
}

/// Newton on the deflated problem `M(x)·F(x) = 0`.
///
/// The deflated Jacobian `M·J + F·∇Mᵀ` is rank-one off `M·J`, so each step
/// costs a single J-solve plus a Sherman–Morrison scalar correction.
pub fn newton_deflated<V, R, S>(
    x0: V,
    mut residual: R,
    mut solve_step: S,
    deflation: &DeflationOperator<V>,
    params: &NewtonParams,
) -> Result<NewtonOutcome<V>>
where
    V: BranchVector,
    R: FnMut(&V) -> Result<V>,
    S: FnMut(&V, &V) -> Result<V>,
{
    let mut x = x0;
    let mut f = residual(&x)?;
    let mut res = f.norm();
    let mut residuals = vec![res];

    let mut iterations = 0;
    while iterations < params.max_iter {
        if res <= params.tol {
            break;
        }

        let d0 = solve_step(&x, &f)?;
        let m = deflation.eval(&x);
        let gamma = deflation.gradient(&x);
        let denom = 1.0 + gamma.dot(&d0) / m;
        let scale = if denom.abs() > 1e-12 { 1.0 / denom } else { 1.0 };

        x.axpy(-params.alpha * scale, &d0);
        f = residual(&x)?;
        res = f.norm();

        iterations += 1;
        residuals.push(res);
        trace!(iteration = iterations, residual = res, "deflated newton step");
    }

    Ok(NewtonOutcome {
        converged: res <= params.tol,
        x,
        residuals,
        iterations,
    })
}
