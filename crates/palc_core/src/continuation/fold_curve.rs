//! Fold points: defining system, dedicated Newton and codim-2 continuation.
//!
//! Unknowns `(x, p, v)` with
//!
//! ```text
//! F(x, p)        = 0
//! J(x, p)·v      = 0
//! ⟨v, v_ref⟩ − 1 = 0
//! ```
//!
//! packed as the dense vector `[x; p; v]`. The second derivative
//! `∂²F(x,p)[v, ·]` is taken from the caller when available and finite
//! differences of `J·v` otherwise.

use anyhow::{anyhow, Result as AnyResult};
use nalgebra::{DMatrix, DVector};

use crate::algebra::BranchVector;
use crate::bordered::BorderedSolver;
use crate::continuation::{continuation, ContinuationOutcome, ContinuationParams};
use crate::error::{Error, Result};
use crate::linear::JacOp;
use crate::newton::NewtonParams;
use crate::predictor::Predictor;
use crate::system::{TwoParamField, VectorField};

/// Directional second derivative `∂²F(x, p)[v₁, v₂]`.
pub type D2F<'a, V = DVector<f64>> = &'a dyn Fn(&V, f64, &V, &V) -> AnyResult<V>;

/// Refined fold point.
#[derive(Debug, Clone)]
pub struct FoldPoint<V = DVector<f64>> {
    pub x: V,
    pub p: f64,
    /// Null vector of the Jacobian at the fold.
    pub v: V,
    pub iterations: usize,
    pub converged: bool,
}

pub fn pack(x: &DVector<f64>, p: f64, v: &DVector<f64>) -> DVector<f64> {
    let n = x.nrows();
    let mut y = DVector::zeros(2 * n + 1);
    for i in 0..n {
        y[i] = x[i];
        y[n + 1 + i] = v[i];
    }
    y[n] = p;
    y
}

pub fn unpack(y: &DVector<f64>) -> (DVector<f64>, f64, DVector<f64>) {
    let n = (y.nrows() - 1) / 2;
    (
        y.rows(0, n).into_owned(),
        y[n],
        y.rows(n + 1, n).into_owned(),
    )
}

pub(crate) fn jac_matrix<S>(field: &S, x: &DVector<f64>, p: f64) -> AnyResult<DMatrix<f64>>
where
    S: VectorField<State = DVector<f64>>,
{
    field
        .jacobian(x, p)?
        .as_matrix()
        .ok_or_else(|| anyhow!("fold/hopf systems need a materializable Jacobian"))
}

pub(crate) fn fold_residual<S>(
    field: &S,
    v_ref: &DVector<f64>,
    y: &DVector<f64>,
) -> AnyResult<DVector<f64>>
where
    S: VectorField<State = DVector<f64>>,
{
    let (x, p, v) = unpack(y);
    let n = x.nrows();
    let f = field.eval(&x, p)?;
    let jv = jac_matrix(field, &x, p)? * &v;

    let mut g = DVector::zeros(2 * n + 1);
    for i in 0..n {
        g[i] = f[i];
        g[n + 1 + i] = jv[i];
    }
    g[2 * n] = v.dot(v_ref) - 1.0;
    Ok(g)
}

/// Action `∂²F(x, p)[v, w]`, from the user second derivative or as a
/// directional centered difference of `J·v`. Works for any state type.
pub(crate) fn d2f_apply<S>(
    field: &S,
    x: &S::State,
    p: f64,
    v: &S::State,
    w: &S::State,
    d2f: Option<D2F<'_, S::State>>,
    eps: f64,
) -> AnyResult<S::State>
where
    S: VectorField,
{
    if let Some(d2) = d2f {
        return d2(x, p, v, w);
    }
    let wn = w.norm();
    if wn == 0.0 {
        return Ok(x.zero_like());
    }
    let h = eps * (1.0 + x.norm());
    let mut xp = x.clone();
    xp.axpy(h / wn, w);
    let mut xm = x.clone();
    xm.axpy(-h / wn, w);
    let mut out = field.jacobian(&xp, p)?.apply(v);
    let jm = field.jacobian(&xm, p)?.apply(v);
    out.axpy(-1.0, &jm);
    out.scale(wn / (2.0 * h));
    Ok(out)
}

/// `∂(J·v)/∂p` by centered differences, scale-aware in `p`.
pub(crate) fn djdp_apply<S>(
    field: &S,
    x: &S::State,
    p: f64,
    v: &S::State,
    eps: f64,
) -> AnyResult<S::State>
where
    S: VectorField,
{
    let h = eps * (1.0 + p.abs());
    let mut out = field.jacobian(x, p + h)?.apply(v);
    let jm = field.jacobian(x, p - h)?.apply(v);
    out.axpy(-1.0, &jm);
    out.scale(1.0 / (2.0 * h));
    Ok(out)
}

/// Columns of `∂(J·v)/∂x` for the dense assembled systems.
pub(crate) fn jv_state_derivative<S>(
    field: &S,
    x: &DVector<f64>,
    p: f64,
    v: &DVector<f64>,
    d2f: Option<D2F<'_>>,
    eps: f64,
) -> AnyResult<DMatrix<f64>>
where
    S: VectorField<State = DVector<f64>>,
{
    let n = x.nrows();
    let mut h = DMatrix::zeros(n, n);
    let mut e = DVector::zeros(n);
    for j in 0..n {
        e[j] = 1.0;
        let col = d2f_apply(field, x, p, v, &e, d2f, eps)?;
        for i in 0..n {
            h[(i, j)] = col[i];
        }
        e[j] = 0.0;
    }
    Ok(h)
}

/// `∂(J·v)/∂p` as a dense column.
pub(crate) fn jv_param_derivative<S>(
    field: &S,
    x: &DVector<f64>,
    p: f64,
    v: &DVector<f64>,
    eps: f64,
) -> AnyResult<DVector<f64>>
where
    S: VectorField<State = DVector<f64>>,
{
    djdp_apply(field, x, p, v, eps)
}

pub(crate) fn fold_jacobian<S>(
    field: &S,
    v_ref: &DVector<f64>,
    y: &DVector<f64>,
    d2f: Option<D2F<'_>>,
    eps: f64,
) -> AnyResult<DMatrix<f64>>
where
    S: VectorField<State = DVector<f64>>,
{
    let (x, p, v) = unpack(y);
    let n = x.nrows();
    let jac = jac_matrix(field, &x, p)?;
    let dfdp = field.dfdp(&x, p, eps)?;
    let h = jv_state_derivative(field, &x, p, &v, d2f, eps)?;
    let djdp_v = jv_param_derivative(field, &x, p, &v, eps)?;

    let mut a = DMatrix::zeros(2 * n + 1, 2 * n + 1);
    for i in 0..n {
        for j in 0..n {
            a[(i, j)] = jac[(i, j)];
            a[(n + 1 + i, j)] = h[(i, j)];
            a[(n + 1 + i, n + 1 + j)] = jac[(i, j)];
        }
        a[(i, n)] = dfdp[i];
        a[(n + 1 + i, n)] = djdp_v[i];
        a[(2 * n, n + 1 + i)] = v_ref[i];
    }
    Ok(a)
}

fn normalized<V: BranchVector>(mut v: V) -> Result<V> {
    let n = v.dot(&v).sqrt();
    if !(n.is_finite() && n > 0.0) {
        return Err(Error::Linear {
            what: "degenerate null-vector seed for the fold system".into(),
        });
    }
    v.scale(1.0 / n);
    Ok(v)
}

/// Newton on the fold defining system `[F; J·v; ⟨v, v₀⟩ − 1]` from
/// `(x0, p0)`, for any state type.
///
/// The extended Jacobian is never assembled: each step is eliminated into
/// three bordered solves. Writing γ = ⟨v, δx⟩, the (δx, δp) block splits as
/// `A₀ + γ·A₁` from two solves with the fold-regular bordered matrix
/// `[J dFdp; vᵀ 0]`; substituting into the `J·v` rows leaves one more
/// bordered solve `[J ρ₁; v₀ᵀ 0]·(δv, γ) = (ρ₀, ⟨v,v₀⟩−1)` with
/// `ρ₀ = J·v − B·A₀`, `ρ₁ = B·A₁`, where B stacks the second-derivative
/// actions. When `v0` is absent the null direction is seeded from the
/// growth of `J⁻¹·dFdp` at the initial point.
pub fn newton_fold<S, BS>(
    field: &S,
    x0: &S::State,
    p0: f64,
    v0: Option<&S::State>,
    d2f: Option<D2F<'_, S::State>>,
    params: &NewtonParams,
    bls: &BS,
    fin_diff_eps: f64,
) -> Result<FoldPoint<S::State>>
where
    S: VectorField,
    BS: BorderedSolver<S::State, S::Jacobian>,
{
    let eps = fin_diff_eps;
    let v_ref = match v0 {
        Some(v) => normalized(v.clone())?,
        None => {
            let jac = field.jacobian(x0, p0)?;
            let dfdp = field.dfdp(x0, p0, eps)?;
            let zero = x0.zero_like();
            let (w, _y) = bls.solve(&jac, &dfdp, &zero, 1.0, 0.0, 1.0, &zero, 1.0, None)?;
            normalized(w)?
        }
    };

    let mut x = x0.clone();
    let mut p = p0;
    let mut v = v_ref.clone();
    let mut iterations = 0;
    let mut converged = false;

    loop {
        let f = field.eval(&x, p)?;
        let jac = field.jacobian(&x, p)?;
        let jv = jac.apply(&v);
        let r3 = v.dot(&v_ref) - 1.0;
        let res = f.norm().max(jv.norm()).max(r3.abs());
        if res <= params.tol {
            converged = true;
            break;
        }
        if iterations >= params.max_iter {
            break;
        }

        let dfdp = field.dfdp(&x, p, eps)?;
        let zero = x.zero_like();

        let (a0x, a0p) = bls.solve(&jac, &dfdp, &v, 0.0, 1.0, 1.0, &f, 0.0, None)?;
        let (a1x, a1p) = bls.solve(&jac, &dfdp, &v, 0.0, 1.0, 1.0, &zero, 1.0, None)?;

        let c = djdp_apply(field, &x, p, &v, eps)?;
        let b0 = d2f_apply(field, &x, p, &v, &a0x, d2f, eps)?;
        let b1 = d2f_apply(field, &x, p, &v, &a1x, d2f, eps)?;

        let mut rho0 = jv;
        rho0.axpy(-1.0, &b0);
        rho0.axpy(-a0p, &c);
        let mut rho1 = b1;
        rho1.axpy(a1p, &c);

        let (dv, gamma) = bls.solve(&jac, &rho1, &v_ref, 0.0, 1.0, 1.0, &rho0, r3, None)?;

        let mut dx = a0x;
        dx.axpy(gamma, &a1x);
        let dp = a0p + gamma * a1p;

        x.axpy(-params.alpha, &dx);
        p -= params.alpha * dp;
        v.axpy(-params.alpha, &dv);
        iterations += 1;
    }

    Ok(FoldPoint {
        x,
        p,
        v,
        iterations,
        converged,
    })
}

/// The fold defining system of a two-parameter family, continued in the
/// secondary parameter. Plugs straight into [`continuation`].
pub struct FoldCurve<'a, T> {
    pub family: &'a T,
    pub v_ref: DVector<f64>,
    pub d2f: Option<D2F<'a>>,
    pub fin_diff_eps: f64,
}

impl<T> VectorField for FoldCurve<'_, T>
where
    T: TwoParamField,
    T::Field: VectorField<State = DVector<f64>>,
{
    type State = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn eval(&self, y: &Self::State, q: f64) -> AnyResult<Self::State> {
        let field = self.family.at(q);
        fold_residual(&field, &self.v_ref, y)
    }

    fn jacobian(&self, y: &Self::State, q: f64) -> AnyResult<Self::Jacobian> {
        let field = self.family.at(q);
        fold_jacobian(&field, &self.v_ref, y, self.d2f, self.fin_diff_eps)
    }
}

/// Continuation of a fold point in the secondary parameter of `family`.
pub fn continuation_fold<T, BS>(
    family: &T,
    fold: &FoldPoint,
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
    let mut v_ref = fold.v.clone();
    let nn = v_ref.dot(&v_ref).sqrt();
    if nn > 0.0 {
        v_ref /= nn;
    }
    let curve = FoldCurve {
        family,
        v_ref,
        d2f: None,
        fin_diff_eps: params.fin_diff_eps,
    };
    let y0 = pack(&fold.x, fold.p, &fold.v);
    continuation(&curve, bls, y0, q0, params, predictor)
}
