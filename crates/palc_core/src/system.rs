//! The user-facing problem interface.
//!
//! A [`VectorField`] is the pair (F, J) of spec-level collaborators: the
//! residual `F(u, p)` and its Jacobian as an operator. User code reports
//! failures with `anyhow`; the engine wraps them into [`crate::Error`].

use anyhow::Result;
use nalgebra::{DMatrix, DVector};

use crate::algebra::BranchVector;
use crate::linear::JacOp;

/// A parameter-dependent nonlinear problem `F(u, p) = 0`.
pub trait VectorField {
    type State: BranchVector;
    type Jacobian: JacOp<Self::State>;

    fn eval(&self, u: &Self::State, p: f64) -> Result<Self::State>;

    fn jacobian(&self, u: &Self::State, p: f64) -> Result<Self::Jacobian>;

    /// ∂F/∂p by central differences. The step is scale-aware in `p`.
    fn dfdp(&self, u: &Self::State, p: f64, eps: f64) -> Result<Self::State> {
        let h = eps * (1.0 + p.abs());
        let mut out = self.eval(u, p + h)?;
        let fm = self.eval(u, p - h)?;
        out.axpy(-1.0, &fm);
        out.scale(1.0 / (2.0 * h));
        Ok(out)
    }
}

/// A two-parameter family, consumed by codim-2 continuation of fold and
/// Hopf points: `at(q)` fixes the secondary parameter and returns the
/// one-parameter field continued in the primary one.
pub trait TwoParamField {
    type Field: VectorField;

    fn at(&self, q: f64) -> Self::Field;
}

/// Dense problem built from plain closures for F and J.
pub struct FnSystem<F, J>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
    J: Fn(&DVector<f64>, f64) -> DMatrix<f64>,
{
    pub f: F,
    pub jac: J,
}

impl<F, J> FnSystem<F, J>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
    J: Fn(&DVector<f64>, f64) -> DMatrix<f64>,
{
    pub fn new(f: F, jac: J) -> Self {
        Self { f, jac }
    }
}

impl<F, J> VectorField for FnSystem<F, J>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
    J: Fn(&DVector<f64>, f64) -> DMatrix<f64>,
{
    type State = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn eval(&self, u: &Self::State, p: f64) -> Result<Self::State> {
        Ok((self.f)(u, p))
    }

    fn jacobian(&self, u: &Self::State, p: f64) -> Result<Self::Jacobian> {
        Ok((self.jac)(u, p))
    }
}

/// Dense problem with a finite-difference Jacobian, for callers that only
/// supply F.
pub struct FdSystem<F>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
{
    pub f: F,
    pub eps: f64,
}

impl<F> FdSystem<F>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
{
    pub fn new(f: F) -> Self {
        Self { f, eps: 1e-7 }
    }
}

impl<F> VectorField for FdSystem<F>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
{
    type State = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn eval(&self, u: &Self::State, p: f64) -> Result<Self::State> {
        Ok((self.f)(u, p))
    }

    fn jacobian(&self, u: &Self::State, p: f64) -> Result<Self::Jacobian> {
        let n = u.nrows();
        let mut jac = DMatrix::zeros(n, n);
        let mut up = u.clone();
        for j in 0..n {
            let h = self.eps * (1.0 + u[j].abs());
            up[j] = u[j] + h;
            let fp = (self.f)(&up, p);
            up[j] = u[j] - h;
            let fm = (self.f)(&up, p);
            up[j] = u[j];
            for i in 0..n {
                jac[(i, j)] = (fp[i] - fm[i]) / (2.0 * h);
            }
        }
        Ok(jac)
    }
}
