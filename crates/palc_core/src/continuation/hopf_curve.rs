//! Hopf points: defining system, dedicated Newton and codim-2 continuation.
//!
//! Unknowns `(x, p, vr, vi, ω)` with
//!
//! ```text
//! F(x, p)              = 0
//! J(x, p)·vr + ω·vi    = 0
//! J(x, p)·vi − ω·vr    = 0
//! ⟨vr,vr⟩ + ⟨vi,vi⟩ − 1 = 0
//! ⟨vr,vi⟩              = 0
//! ```
//!
//! in real arithmetic, packed as `[x; p; vr; vi; ω]`. The eigenvector legs
//! are seeded from the eigenpair of `J` nearest the imaginary axis, rotated
//! so the real and imaginary parts are orthogonal.

use anyhow::{anyhow, Result as AnyResult};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use super::fold_curve::{jac_matrix, jv_param_derivative, jv_state_derivative, D2F};
use crate::bordered::BorderedSolver;
use crate::continuation::{continuation, ContinuationOutcome, ContinuationParams};
use crate::error::{Error, Result};
use crate::linear::{eigenvector_for, LinearSolver};
use crate::newton::{newton, NewtonParams};
use crate::predictor::Predictor;
use crate::system::{TwoParamField, VectorField};

/// Refined Hopf point.
#[derive(Debug, Clone)]
pub struct HopfPoint {
    pub x: DVector<f64>,
    pub p: f64,
    pub vr: DVector<f64>,
    pub vi: DVector<f64>,
    /// Angular frequency of the emerging cycle.
    pub omega: f64,
    pub iterations: usize,
    pub converged: bool,
}

pub fn pack(
    x: &DVector<f64>,
    p: f64,
    vr: &DVector<f64>,
    vi: &DVector<f64>,
    omega: f64,
) -> DVector<f64> {
    let n = x.nrows();
    let mut y = DVector::zeros(3 * n + 2);
    for i in 0..n {
        y[i] = x[i];
        y[n + 1 + i] = vr[i];
        y[2 * n + 1 + i] = vi[i];
    }
    y[n] = p;
    y[3 * n + 1] = omega;
    y
}

pub fn unpack(y: &DVector<f64>) -> (DVector<f64>, f64, DVector<f64>, DVector<f64>, f64) {
    let n = (y.nrows() - 2) / 3;
    (
        y.rows(0, n).into_owned(),
        y[n],
        y.rows(n + 1, n).into_owned(),
        y.rows(2 * n + 1, n).into_owned(),
        y[3 * n + 1],
    )
}

pub(crate) fn hopf_residual<S>(field: &S, y: &DVector<f64>) -> AnyResult<DVector<f64>>
where
    S: VectorField<State = DVector<f64>>,
{
    let (x, p, vr, vi, omega) = unpack(y);
    let n = x.nrows();
    let f = field.eval(&x, p)?;
    let jac = jac_matrix(field, &x, p)?;
    let jvr = &jac * &vr;
    let jvi = &jac * &vi;

    let mut g = DVector::zeros(3 * n + 2);
    for i in 0..n {
        g[i] = f[i];
        g[n + 1 + i] = jvr[i] + omega * vi[i];
        g[2 * n + 1 + i] = jvi[i] - omega * vr[i];
    }
    g[3 * n] = vr.dot(&vr) + vi.dot(&vi) - 1.0;
    g[3 * n + 1] = vr.dot(&vi);
    Ok(g)
}

pub(crate) fn hopf_jacobian<S>(
    field: &S,
    y: &DVector<f64>,
    d2f: Option<D2F<'_>>,
    eps: f64,
) -> AnyResult<DMatrix<f64>>
where
    S: VectorField<State = DVector<f64>>,
{
    let (x, p, vr, vi, omega) = unpack(y);
    let n = x.nrows();
    let jac = jac_matrix(field, &x, p)?;
    let dfdp = field.dfdp(&x, p, eps)?;
    let h_vr = jv_state_derivative(field, &x, p, &vr, d2f, eps)?;
    let h_vi = jv_state_derivative(field, &x, p, &vi, d2f, eps)?;
    let djdp_vr = jv_param_derivative(field, &x, p, &vr, eps)?;
    let djdp_vi = jv_param_derivative(field, &x, p, &vi, eps)?;

    let dim = 3 * n + 2;
    let mut a = DMatrix::zeros(dim, dim);
    for i in 0..n {
        for j in 0..n {
            a[(i, j)] = jac[(i, j)];
            a[(n + 1 + i, j)] = h_vr[(i, j)];
            a[(2 * n + 1 + i, j)] = h_vi[(i, j)];
            a[(n + 1 + i, n + 1 + j)] = jac[(i, j)];
            a[(2 * n + 1 + i, 2 * n + 1 + j)] = jac[(i, j)];
        }
        a[(i, n)] = dfdp[i];
        a[(n + 1 + i, n)] = djdp_vr[i];
        a[(2 * n + 1 + i, n)] = djdp_vi[i];
        // ω couplings.
        a[(n + 1 + i, 2 * n + 1 + i)] += omega;
        a[(2 * n + 1 + i, n + 1 + i)] -= omega;
        a[(n + 1 + i, 3 * n + 1)] = vi[i];
        a[(2 * n + 1 + i, 3 * n + 1)] = -vr[i];
        // Normalization rows.
        a[(3 * n, n + 1 + i)] = 2.0 * vr[i];
        a[(3 * n, 2 * n + 1 + i)] = 2.0 * vi[i];
        a[(3 * n + 1, n + 1 + i)] = vi[i];
        a[(3 * n + 1, 2 * n + 1 + i)] = vr[i];
    }
    Ok(a)
}

/// Real/imaginary eigenvector legs for the Hopf system, rotated so
/// `⟨vr, vi⟩ = 0` and scaled to `⟨vr,vr⟩ + ⟨vi,vi⟩ = 1`.
pub fn split_eigenvector(vector: &[Complex<f64>]) -> Result<(DVector<f64>, DVector<f64>)> {
    let n = vector.len();
    let (mut d, mut s, mut r) = (0.0, 0.0, 0.0);
    for v in vector {
        d += v.re * v.re;
        s += v.im * v.im;
        r += v.re * v.im;
    }
    let phi = 0.5 * (2.0 * r).atan2(s - d);
    let (sin_phi, cos_phi) = phi.sin_cos();

    let mut vr = DVector::zeros(n);
    let mut vi = DVector::zeros(n);
    for (i, v) in vector.iter().enumerate() {
        vr[i] = v.re * cos_phi - v.im * sin_phi;
        vi[i] = v.re * sin_phi + v.im * cos_phi;
    }
    let total = (vr.dot(&vr) + vi.dot(&vi)).sqrt();
    if total == 0.0 {
        return Err(Error::Eigen {
            info: "degenerate Hopf eigenvector".into(),
        });
    }
    vr /= total;
    vi /= total;
    Ok((vr, vi))
}

/// Eigenpair of `J(x0, p0)` nearest the imaginary axis, as an initial guess
/// for `(vr, vi, ω)`.
pub fn hopf_guess<S>(field: &S, x0: &DVector<f64>, p0: f64) -> Result<(DVector<f64>, DVector<f64>, f64)>
where
    S: VectorField<State = DVector<f64>>,
{
    let jac = jac_matrix(field, x0, p0).map_err(Error::Problem)?;
    let eigenvalues = jac.clone().complex_eigenvalues();
    let mut best: Option<Complex<f64>> = None;
    for lambda in eigenvalues.iter() {
        if lambda.im.abs() <= 1e-12 {
            continue;
        }
        if best.map(|b| lambda.re.abs() < b.re.abs()).unwrap_or(true) {
            best = Some(*lambda);
        }
    }
    let lambda = best.ok_or_else(|| Error::Eigen {
        info: "no complex eigenpair to seed a Hopf point".into(),
    })?;
    let vector = eigenvector_for(&jac, lambda)?;
    let (vr, vi) = split_eigenvector(&vector)?;
    Ok((vr, vi, lambda.im.abs()))
}

/// Newton on the Hopf defining system from `(x0, p0)`.
pub fn newton_hopf<S, LS>(
    field: &S,
    x0: &DVector<f64>,
    p0: f64,
    guess: Option<(DVector<f64>, DVector<f64>, f64)>,
    d2f: Option<D2F<'_>>,
    params: &NewtonParams,
    solver: &LS,
    fin_diff_eps: f64,
) -> Result<HopfPoint>
where
    S: VectorField<State = DVector<f64>>,
    LS: LinearSolver<DVector<f64>, DMatrix<f64>>,
{
    let (vr, vi, omega) = match guess {
        Some(g) => g,
        None => hopf_guess(field, x0, p0)?,
    };
    let y0 = pack(x0, p0, &vr, &vi, omega);

    let residual = |y: &DVector<f64>| -> Result<DVector<f64>> { Ok(hopf_residual(field, y)?) };
    let solve = |y: &DVector<f64>, rhs: &DVector<f64>| -> Result<DVector<f64>> {
        let a = hopf_jacobian(field, y, d2f, fin_diff_eps)?;
        Ok(solver.solve(&a, rhs)?.x)
    };

    let out = newton(y0, residual, solve, params, None, None)?;
    let (x, p, vr, vi, omega) = unpack(&out.x);
    Ok(HopfPoint {
        x,
        p,
        vr,
        vi,
        omega,
        iterations: out.iterations,
        converged: out.converged,
    })
}

/// The Hopf defining system of a two-parameter family, continued in the
/// secondary parameter.
pub struct HopfCurve<'a, T> {
    pub family: &'a T,
    pub d2f: Option<D2F<'a>>,
    pub fin_diff_eps: f64,
}

impl<T> VectorField for HopfCurve<'_, T>
where
    T: TwoParamField,
    T::Field: VectorField<State = DVector<f64>>,
{
    type State = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn eval(&self, y: &Self::State, q: f64) -> AnyResult<Self::State> {
        let field = self.family.at(q);
        hopf_residual(&field, y)
    }

    fn jacobian(&self, y: &Self::State, q: f64) -> AnyResult<Self::Jacobian> {
        let field = self.family.at(q);
        hopf_jacobian(&field, y, self.d2f, self.fin_diff_eps)
    }
}

/// Continuation of a Hopf point in the secondary parameter of `family`.
pub fn continuation_hopf<T, BS>(
    family: &T,
    hopf: &HopfPoint,
    q0: f64,
    params: ContinuationParams,
    predictor: Predictor,
    bls: &BS,
) -> Result<ContinuationOutcome<DVector<f64>>>
where
    T: TwoParamField,
    T::Field: VectorField<State = DVector<f64>>,
    BS: BorderedSolver<DVector<f64>, DMatrix<f64>>,
{
    let curve = HopfCurve {
        family,
        d2f: None,
        fin_diff_eps: params.fin_diff_eps,
    };
    let y0 = pack(&hopf.x, hopf.p, &hopf.vr, &hopf.vi, hopf.omega);
    continuation(&curve, bls, y0, q0, params, predictor)
}
