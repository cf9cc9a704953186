//! Floquet analysis of periodic orbits.
//!
//! Multipliers are eigenvalues of the monodromy, requested largest-modulus
//! first; the spectrum closures below feed them to the continuation
//! iterator's stability bookkeeping (rule: modulus).

use nalgebra::{DMatrix, DVector};
use num_complex::Complex;

use super::poincare::PoincareShooting;
use super::shooting::ShootingProblem;
use super::trapezoid::PeriodicOrbitTrap;
use crate::continuation::SpectrumFn;
use crate::error::Result;
use crate::linear::{EigenSolver, EigenWhich};

/// Floquet multipliers of a materialized monodromy.
pub fn floquet_multipliers<ES>(
    monodromy: &DMatrix<f64>,
    nev: usize,
    eig: &ES,
) -> Result<Vec<Complex<f64>>>
where
    ES: EigenSolver<DMatrix<f64>>,
{
    Ok(eig
        .eigen(monodromy, nev, EigenWhich::LargestModulus)?
        .values)
}

/// Floquet exponents `log μ`, sorted by real part (descending).
pub fn log_multipliers(multipliers: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let mut out: Vec<Complex<f64>> = multipliers.iter().map(|m| m.ln()).collect();
    out.sort_by(|a, b| b.re.partial_cmp(&a.re).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Spectrum closure for the trapezoidal functional.
pub fn trap_floquet_spectrum<'a, F, J, ES>(
    problem: &'a PeriodicOrbitTrap<F, J>,
    eig: &'a ES,
) -> SpectrumFn<'a, DVector<f64>>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
    J: Fn(&DVector<f64>, f64) -> DMatrix<f64>,
    ES: EigenSolver<DMatrix<f64>>,
{
    Box::new(move |y, p, nev| {
        let mono = problem.monodromy_matrix(y, p)?;
        let dec = eig
            .eigen(&mono, nev, EigenWhich::LargestModulus)
            .map_err(anyhow::Error::from)?;
        Ok(dec)
    })
}

/// Spectrum closure for the shooting functional.
pub fn shooting_floquet_spectrum<'a, R, Sec, ES>(
    problem: &'a ShootingProblem<R, Sec>,
    eig: &'a ES,
) -> SpectrumFn<'a, DVector<f64>>
where
    R: Fn(f64, &[f64], &mut [f64]),
    Sec: Fn(&DVector<f64>) -> f64,
    ES: EigenSolver<DMatrix<f64>>,
{
    Box::new(move |y, p, nev| {
        let mono = problem.monodromy_matrix(y, p);
        let dec = eig
            .eigen(&mono, nev, EigenWhich::LargestModulus)
            .map_err(anyhow::Error::from)?;
        Ok(dec)
    })
}

/// Spectrum closure for Poincaré shooting. The monodromy lives in section
/// coordinates, so the trivial multiplier is already removed.
pub fn poincare_floquet_spectrum<'a, R, ES>(
    problem: &'a PoincareShooting<R>,
    eig: &'a ES,
) -> SpectrumFn<'a, DVector<f64>>
where
    R: Fn(f64, &[f64], &mut [f64]),
    ES: EigenSolver<DMatrix<f64>>,
{
    Box::new(move |y, p, nev| {
        let mono = problem.monodromy_matrix(y, p)?;
        let dec = eig
            .eigen(&mono, nev, EigenWhich::LargestModulus)
            .map_err(anyhow::Error::from)?;
        Ok(dec)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponents_sorted_by_real_part() {
        let mults = [
            Complex::new(0.1, 0.0),
            Complex::new(1.0, 0.0),
            Complex::new(0.0, 0.5),
        ];
        let exps = log_multipliers(&mults);
        assert!(exps[0].re >= exps[1].re && exps[1].re >= exps[2].re);
        assert!(exps[0].re.abs() < 1e-12);
    }
}
