//! Operator, linear-solver and eigensolver interfaces.
//!
//! The continuation engine consumes these; it never assumes a concrete
//! representation. `DenseLu` and `DenseEigen` are the provided
//! implementations for problems whose Jacobian can be materialized as a
//! dense matrix. Iterative/matrix-free solvers plug in through the same
//! traits.

use nalgebra::{DMatrix, DVector, SVD};
use num_complex::Complex;

use crate::error::{Error, Result};

/// Action of a Jacobian-like operator on a state vector.
pub trait JacOp<V> {
    fn apply(&self, v: &V) -> V;

    /// Dense materialization, when the operator supports it.
    fn as_matrix(&self) -> Option<DMatrix<f64>> {
        None
    }
}

impl JacOp<DVector<f64>> for DMatrix<f64> {
    fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        self * v
    }

    fn as_matrix(&self) -> Option<DMatrix<f64>> {
        Some(self.clone())
    }
}

/// Outcome of a linear solve.
#[derive(Debug, Clone)]
pub struct LinearSolve<V> {
    pub x: V,
    pub converged: bool,
    pub iterations: usize,
}

impl<V> LinearSolve<V> {
    pub fn direct(x: V) -> Self {
        Self {
            x,
            converged: true,
            iterations: 1,
        }
    }
}

/// Solves `Op · x = rhs`, and shifted variants `(a0·I + a1·Op) x = rhs`.
pub trait LinearSolver<V, Op: JacOp<V>> {
    fn solve(&self, op: &Op, rhs: &V) -> Result<LinearSolve<V>>;

    fn solve_shifted(&self, op: &Op, a0: f64, a1: f64, rhs: &V) -> Result<LinearSolve<V>>;
}

/// Direct dense solver: LU first, SVD pseudo-inverse as the fallback for
/// near-singular Jacobians.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseLu;

pub(crate) fn lu_solve(mat: &DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>> {
    if let Some(x) = mat.clone().lu().solve(rhs) {
        if x.iter().all(|v| v.is_finite()) {
            return Ok(x);
        }
    }
    let svd = mat.clone().svd(true, true);
    let threshold = 1e-12 * svd.singular_values.max().max(1.0);
    svd.solve(rhs, threshold)
        .map_err(|what| Error::Linear { what: what.into() })
}

impl<Op: JacOp<DVector<f64>>> LinearSolver<DVector<f64>, Op> for DenseLu {
    fn solve(&self, op: &Op, rhs: &DVector<f64>) -> Result<LinearSolve<DVector<f64>>> {
        let mat = op.as_matrix().ok_or_else(|| Error::Linear {
            what: "DenseLu requires a materializable operator".into(),
        })?;
        Ok(LinearSolve::direct(lu_solve(&mat, rhs)?))
    }

    fn solve_shifted(
        &self,
        op: &Op,
        a0: f64,
        a1: f64,
        rhs: &DVector<f64>,
    ) -> Result<LinearSolve<DVector<f64>>> {
        let mut mat = op.as_matrix().ok_or_else(|| Error::Linear {
            what: "DenseLu requires a materializable operator".into(),
        })? * a1;
        for i in 0..mat.nrows().min(mat.ncols()) {
            mat[(i, i)] += a0;
        }
        Ok(LinearSolve::direct(lu_solve(&mat, rhs)?))
    }
}

/// Eigenvalue selection order requested from an eigensolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EigenWhich {
    /// Largest real part first (equilibria).
    LargestReal,
    /// Largest modulus first (Floquet multipliers).
    LargestModulus,
}

/// Eigen-elements returned by an eigensolver.
#[derive(Debug, Clone)]
pub struct EigenDecomp {
    pub values: Vec<Complex<f64>>,
    pub vectors: Option<Vec<Vec<Complex<f64>>>>,
    pub converged: bool,
}

pub trait EigenSolver<Op> {
    fn eigen(&self, op: &Op, nev: usize, which: EigenWhich) -> Result<EigenDecomp>;
}

/// Dense eigensolver over a materialized operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseEigen {
    pub compute_vectors: bool,
}

impl DenseEigen {
    pub fn with_vectors() -> Self {
        Self {
            compute_vectors: true,
        }
    }
}

impl<Op: JacOp<DVector<f64>>> EigenSolver<Op> for DenseEigen {
    fn eigen(&self, op: &Op, nev: usize, which: EigenWhich) -> Result<EigenDecomp> {
        let mat = op.as_matrix().ok_or_else(|| Error::Eigen {
            info: "DenseEigen requires a materializable operator".into(),
        })?;
        let mut values: Vec<Complex<f64>> =
            mat.clone().complex_eigenvalues().iter().cloned().collect();
        sort_eigenvalues(&mut values, which);
        values.truncate(nev.max(1));

        let vectors = if self.compute_vectors {
            let mut vecs = Vec::with_capacity(values.len());
            for &lambda in &values {
                vecs.push(eigenvector_for(&mat, lambda)?);
            }
            Some(vecs)
        } else {
            None
        };

        Ok(EigenDecomp {
            values,
            vectors,
            converged: true,
        })
    }
}

pub(crate) fn sort_eigenvalues(values: &mut [Complex<f64>], which: EigenWhich) {
    match which {
        EigenWhich::LargestReal => values.sort_by(|a, b| {
            b.re.partial_cmp(&a.re)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        EigenWhich::LargestModulus => values.sort_by(|a, b| {
            b.norm()
                .partial_cmp(&a.norm())
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
}

/// Eigenvector for a known eigenvalue, from the null space of the shifted
/// matrix via complex SVD.
pub(crate) fn eigenvector_for(
    mat: &DMatrix<f64>,
    eigenvalue: Complex<f64>,
) -> Result<Vec<Complex<f64>>> {
    let dim = mat.nrows();
    let mut shifted = mat.map(|v| Complex::new(v, 0.0));
    for i in 0..dim {
        shifted[(i, i)] -= eigenvalue;
    }
    let svd = SVD::new(shifted, true, true);
    let v_t = svd.v_t.ok_or_else(|| Error::Eigen {
        info: "SVD did not produce right singular vectors".into(),
    })?;
    let row = v_t.nrows().saturating_sub(1);
    Ok((0..dim).map(|i| v_t[(row, i)].conj()).collect())
}
