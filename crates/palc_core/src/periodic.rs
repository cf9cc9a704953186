//! Periodic-orbit problems.
//!
//! Each problem exposes the residual/Jacobian pair of an extended system
//! whose unknowns include the orbit discretization (and usually the period),
//! so `newton` and `continuation` apply to them unchanged. Floquet
//! multipliers come from monodromy operators expressed as left folds of
//! linear solves or flow-Jacobian products.

#[path = "periodic/trapezoid.rs"]
pub mod trapezoid;

#[path = "periodic/shooting.rs"]
pub mod shooting;

#[path = "periodic/poincare.rs"]
pub mod poincare;

#[path = "periodic/floquet.rs"]
pub mod floquet;

pub use poincare::{PoincareShooting, Section};
pub use shooting::ShootingProblem;
pub use trapezoid::PeriodicOrbitTrap;

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use crate::continuation::hopf_curve::split_eigenvector;
use crate::error::{Error, Result};
use crate::linear::eigenvector_for;

/// Initial orbit built from a Hopf point, ready for the trapezoidal or
/// shooting functionals.
#[derive(Debug, Clone)]
pub struct HopfOrbitGuess {
    /// Flattened unknowns `[x₁, …, x_M, T]`.
    pub y: DVector<f64>,
    /// Phase direction for the trapezoidal phase constraint.
    pub phi: DVector<f64>,
    /// Phase anchor (the Hopf equilibrium).
    pub u_ref: DVector<f64>,
    pub period: f64,
    pub omega: f64,
}

/// Eigenpair of the Hopf Jacobian with the smallest pair sum, i.e. the
/// closest conjugate pair.
fn hopf_pair(values: &[Complex<f64>]) -> Option<(Complex<f64>, Complex<f64>)> {
    if values.len() < 2 {
        return None;
    }
    let mut best = (0usize, 1usize);
    let mut best_sum = f64::INFINITY;
    for i in 0..values.len() - 1 {
        for j in (i + 1)..values.len() {
            let sum = (values[i] + values[j]).norm();
            if sum < best_sum {
                best_sum = sum;
                best = (i, j);
            }
        }
    }
    Some((values[best.0], values[best.1]))
}

/// Sample an `m`-slice orbit of the given amplitude around a Hopf point,
/// from the eigenpair of the Jacobian there.
pub fn guess_from_hopf(
    jac: &DMatrix<f64>,
    u_hopf: &DVector<f64>,
    m: usize,
    amplitude: f64,
) -> Result<HopfOrbitGuess> {
    if m < 3 {
        return Err(Error::InvalidConfig {
            what: "orbit guesses need at least 3 time slices".into(),
        });
    }
    if !(amplitude > 0.0) {
        return Err(Error::InvalidConfig {
            what: "orbit amplitude must be positive".into(),
        });
    }
    let dim = u_hopf.nrows();

    let values: Vec<Complex<f64>> = jac.clone().complex_eigenvalues().iter().cloned().collect();
    let (l1, l2) = hopf_pair(&values).ok_or_else(|| Error::Eigen {
        info: "no eigenpair available at the Hopf point".into(),
    })?;
    let omega = l1.im.abs().max(l2.im.abs());
    if omega <= 1e-12 {
        return Err(Error::Eigen {
            info: "selected eigenpair is real (neutral saddle?)".into(),
        });
    }
    let vector = eigenvector_for(jac, l1)?;
    let (vr, vi) = split_eigenvector(&vector)?;

    let period = std::f64::consts::TAU / omega;
    let mut y = DVector::zeros(m * dim + 1);
    for k in 0..m {
        let theta = std::f64::consts::TAU * (k as f64) / (m as f64);
        let (sin_t, cos_t) = theta.sin_cos();
        for i in 0..dim {
            y[k * dim + i] = u_hopf[i] + amplitude * (vr[i] * cos_t - vi[i] * sin_t);
        }
    }
    y[m * dim] = period;

    let mut phi = vi.clone();
    let n = phi.dot(&phi).sqrt();
    if n > 0.0 {
        phi /= n;
    }

    Ok(HopfOrbitGuess {
        y,
        phi,
        u_ref: u_hopf.clone(),
        period,
        omega,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_samples_a_circle() {
        // J with eigenvalues ±2i: the guessed period is π.
        let jac = DMatrix::from_row_slice(2, 2, &[0.0, -2.0, 2.0, 0.0]);
        let u = DVector::zeros(2);
        let guess = guess_from_hopf(&jac, &u, 8, 0.3).unwrap();
        assert!((guess.omega - 2.0).abs() < 1e-10);
        assert!((guess.period - std::f64::consts::PI).abs() < 1e-10);
        assert_eq!(guess.y.nrows(), 8 * 2 + 1);
        // Slices lie on a circle of the requested amplitude (the rotated
        // eigenvector legs are orthonormal up to a common scale).
        for k in 0..8 {
            let x = guess.y[2 * k];
            let y = guess.y[2 * k + 1];
            let r = (x * x + y * y).sqrt();
            assert!(r > 0.0 && r < 2.0 * 0.3 + 1e-12);
        }
    }

    #[test]
    fn tiny_meshes_are_rejected() {
        let jac = DMatrix::identity(2, 2);
        let u = DVector::zeros(2);
        assert!(guess_from_hopf(&jac, &u, 2, 0.1).is_err());
    }
}
