//! Bordered linear solves.
//!
//! The PALC constraint adjoins one row and one column to the Jacobian:
//!
//! ```text
//! [ J          dFdp    ] [x]   [r]
//! [ ξu·dgᵀ     ξp·dpg  ] [y] = [n]
//! ```
//!
//! Three interchangeable strategies solve this system: bordering (two solves
//! with J), full dense assembly, and a matrix-free formulation over the
//! augmented operator. An optional shift σ replaces J by (J − σ·I).

use nalgebra::{DMatrix, DVector};

use crate::algebra::{BorderedPair, BranchVector};
use crate::error::{Error, Result};
use crate::linear::{JacOp, LinearSolve, LinearSolver};

/// Solver for the augmented (N+1)×(N+1) system above.
pub trait BorderedSolver<V: BranchVector, Op: JacOp<V>> {
    #[allow(clippy::too_many_arguments)]
    fn solve(
        &self,
        op: &Op,
        dfdp: &V,
        dg: &V,
        dpg: f64,
        xi_u: f64,
        xi_p: f64,
        rhs: &V,
        rhs_n: f64,
        shift: Option<f64>,
    ) -> Result<(V, f64)>;
}

/// Block elimination: two solves with J, then the scalar Schur complement.
/// Fails with [`Error::BorderedSingular`] when the denominator underflows.
pub struct BorderingBls<S> {
    pub solver: S,
    pub epsilon: f64,
}

impl<S> BorderingBls<S> {
    pub fn new(solver: S) -> Self {
        Self {
            solver,
            epsilon: 1e-12,
        }
    }
}

fn inner_solve<V, Op, S>(solver: &S, op: &Op, rhs: &V, shift: Option<f64>) -> Result<LinearSolve<V>>
where
    V: BranchVector,
    Op: JacOp<V>,
    S: LinearSolver<V, Op>,
{
    match shift {
        Some(sigma) => solver.solve_shifted(op, -sigma, 1.0, rhs),
        None => solver.solve(op, rhs),
    }
}

impl<V, Op, S> BorderedSolver<V, Op> for BorderingBls<S>
where
    V: BranchVector,
    Op: JacOp<V>,
    S: LinearSolver<V, Op>,
{
    fn solve(
        &self,
        op: &Op,
        dfdp: &V,
        dg: &V,
        dpg: f64,
        xi_u: f64,
        xi_p: f64,
        rhs: &V,
        rhs_n: f64,
        shift: Option<f64>,
    ) -> Result<(V, f64)> {
        let x1 = inner_solve(&self.solver, op, rhs, shift)?.x;
        let x2 = inner_solve(&self.solver, op, dfdp, shift)?.x;

        let denom = xi_p * dpg - xi_u * dg.dot(&x2);
        if denom.abs() < self.epsilon {
            return Err(Error::BorderedSingular {
                denom: denom.abs(),
                epsilon: self.epsilon,
            });
        }

        let y = (rhs_n - xi_u * dg.dot(&x1)) / denom;
        let mut x = x1;
        x.axpy(-y, &x2);
        Ok((x, y))
    }
}

/// Dense assembly of the full (N+1)×(N+1) matrix. Requires a
/// materializable operator and dense states.
pub struct FullMatrixBls<S> {
    pub solver: S,
}

impl<S> FullMatrixBls<S> {
    pub fn new(solver: S) -> Self {
        Self { solver }
    }
}

impl<Op, S> BorderedSolver<DVector<f64>, Op> for FullMatrixBls<S>
where
    Op: JacOp<DVector<f64>>,
    S: LinearSolver<DVector<f64>, DMatrix<f64>>,
{
    fn solve(
        &self,
        op: &Op,
        dfdp: &DVector<f64>,
        dg: &DVector<f64>,
        dpg: f64,
        xi_u: f64,
        xi_p: f64,
        rhs: &DVector<f64>,
        rhs_n: f64,
        shift: Option<f64>,
    ) -> Result<(DVector<f64>, f64)> {
        let jac = op.as_matrix().ok_or_else(|| Error::Linear {
            what: "full-matrix bordered solve needs a materializable operator".into(),
        })?;
        let n = jac.nrows();
        let mut aug = DMatrix::zeros(n + 1, n + 1);
        aug.view_mut((0, 0), (n, n)).copy_from(&jac);
        if let Some(sigma) = shift {
            for i in 0..n {
                aug[(i, i)] -= sigma;
            }
        }
        for i in 0..n {
            aug[(i, n)] = dfdp[i];
            aug[(n, i)] = xi_u * dg[i];
        }
        aug[(n, n)] = xi_p * dpg;

        let mut b = DVector::zeros(n + 1);
        for i in 0..n {
            b[i] = rhs[i];
        }
        b[n] = rhs_n;

        let sol = self.solver.solve(&aug, &b)?.x;
        Ok((sol.rows(0, n).into_owned(), sol[n]))
    }
}

/// The augmented operator applied matrix-free to a [`BorderedPair`].
pub struct AugmentedOp<'a, V, Op> {
    pub op: &'a Op,
    pub dfdp: &'a V,
    pub dg: &'a V,
    pub dpg: f64,
    pub xi_u: f64,
    pub xi_p: f64,
    pub shift: Option<f64>,
}

impl<V, Op> JacOp<BorderedPair<V>> for AugmentedOp<'_, V, Op>
where
    V: BranchVector,
    Op: JacOp<V>,
{
    fn apply(&self, z: &BorderedPair<V>) -> BorderedPair<V> {
        let mut top = self.op.apply(&z.u);
        if let Some(sigma) = self.shift {
            top.axpy(-sigma, &z.u);
        }
        top.axpy(z.p, self.dfdp);
        let bottom = self.xi_u * self.dg.dot(&z.u) + self.xi_p * self.dpg * z.p;
        BorderedPair::new(top, bottom)
    }
}

/// Matrix-free strategy: delegates to a user-supplied Krylov solver acting
/// on the augmented operator.
pub struct MatrixFreeBls<S> {
    pub solver: S,
}

impl<S> MatrixFreeBls<S> {
    pub fn new(solver: S) -> Self {
        Self { solver }
    }
}

impl<V, Op, S> BorderedSolver<V, Op> for MatrixFreeBls<S>
where
    V: BranchVector,
    Op: JacOp<V>,
    S: for<'a> LinearSolver<BorderedPair<V>, AugmentedOp<'a, V, Op>>,
{
    fn solve(
        &self,
        op: &Op,
        dfdp: &V,
        dg: &V,
        dpg: f64,
        xi_u: f64,
        xi_p: f64,
        rhs: &V,
        rhs_n: f64,
        shift: Option<f64>,
    ) -> Result<(V, f64)> {
        let aug = AugmentedOp {
            op,
            dfdp,
            dg,
            dpg,
            xi_u,
            xi_p,
            shift,
        };
        let b = BorderedPair::new(rhs.clone(), rhs_n);
        let sol = self.solver.solve(&aug, &b)?;
        if !sol.converged {
            return Err(Error::Linear {
                what: "matrix-free bordered solve did not converge".into(),
            });
        }
        Ok((sol.x.u, sol.x.p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::DenseLu;

    fn sample() -> (DMatrix<f64>, DVector<f64>, DVector<f64>, DVector<f64>) {
        let jac = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 0.0, 3.0]);
        let dfdp = DVector::from_vec(vec![1.0, -1.0]);
        let dg = DVector::from_vec(vec![0.5, 0.5]);
        let rhs = DVector::from_vec(vec![1.0, 2.0]);
        (jac, dfdp, dg, rhs)
    }

    #[test]
    fn bordering_matches_full_matrix() {
        let (jac, dfdp, dg, rhs) = sample();
        let (xi_u, xi_p, dpg, rhs_n) = (0.3, 0.7, 1.5, 0.25);

        let b = BorderingBls::new(DenseLu);
        let f = FullMatrixBls::new(DenseLu);
        let (xb, yb) = b
            .solve(&jac, &dfdp, &dg, dpg, xi_u, xi_p, &rhs, rhs_n, None)
            .unwrap();
        let (xf, yf) = f
            .solve(&jac, &dfdp, &dg, dpg, xi_u, xi_p, &rhs, rhs_n, None)
            .unwrap();

        assert!((yb - yf).abs() < 1e-10);
        for i in 0..2 {
            assert!((xb[i] - xf[i]).abs() < 1e-10);
        }
    }

    #[test]
    fn solution_satisfies_augmented_system() {
        let (jac, dfdp, dg, rhs) = sample();
        let (xi_u, xi_p, dpg, rhs_n) = (0.4, 0.6, -2.0, 1.0);

        let b = BorderingBls::new(DenseLu);
        let (x, y) = b
            .solve(&jac, &dfdp, &dg, dpg, xi_u, xi_p, &rhs, rhs_n, None)
            .unwrap();

        let top = &jac * &x + &dfdp * y;
        for i in 0..2 {
            assert!((top[i] - rhs[i]).abs() < 1e-10);
        }
        let bottom = xi_u * dg.dot(&x) + xi_p * dpg * y;
        assert!((bottom - rhs_n).abs() < 1e-10);
    }

    #[test]
    fn singular_denominator_is_reported() {
        // dpg chosen so the Schur complement denominator vanishes.
        let jac = DMatrix::identity(2, 2);
        let dfdp = DVector::from_vec(vec![1.0, 0.0]);
        let dg = DVector::from_vec(vec![1.0, 0.0]);
        let rhs = DVector::from_vec(vec![0.0, 0.0]);
        // denom = xi_p*dpg - xi_u*<dg, J^{-1} dfdp> = 0.5*2.0 - 1.0*1.0 = 0.
        let b = BorderingBls::new(DenseLu);
        let err = b
            .solve(&jac, &dfdp, &dg, 2.0, 1.0, 0.5, &rhs, 1.0, None)
            .unwrap_err();
        assert!(matches!(err, Error::BorderedSingular { .. }));
    }

    #[test]
    fn shift_subtracts_sigma_from_diagonal() {
        // With J = 3I and sigma = 1, the effective block is 2I.
        let jac = DMatrix::from_diagonal(&DVector::from_vec(vec![3.0, 3.0]));
        let dfdp = DVector::zeros(2);
        let dg = DVector::zeros(2);
        let rhs = DVector::from_vec(vec![4.0, 4.0]);
        let f = FullMatrixBls::new(DenseLu);
        let (x, _y) = f
            .solve(&jac, &dfdp, &dg, 1.0, 0.0, 1.0, &rhs, 0.0, Some(1.0))
            .unwrap();
        assert!((x[0] - 2.0).abs() < 1e-12);
    }
}
