//! Finite-difference (implicit trapezoid) periodic-orbit functional.
//!
//! Unknowns `[x₁, …, x_M, T]` with cyclic closure `x_{M+1} = x₁`:
//!
//! ```text
//! x_{i+1} − x_i − (h/2)·(F(x_{i+1}) + F(x_i)) = 0,   h = T/M
//! ⟨x₁ − u_ref, φ⟩                              = 0
//! ```

use anyhow::Result as AnyResult;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CscMatrix};

use crate::system::VectorField;

pub struct PeriodicOrbitTrap<F, J>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
    J: Fn(&DVector<f64>, f64) -> DMatrix<f64>,
{
    pub f: F,
    pub jac: J,
    pub dim: usize,
    /// Number of time slices.
    pub m: usize,
    /// Phase anchor, typically the Hopf equilibrium.
    pub u_ref: DVector<f64>,
    /// Phase direction.
    pub phi: DVector<f64>,
}

impl<F, J> PeriodicOrbitTrap<F, J>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
    J: Fn(&DVector<f64>, f64) -> DMatrix<f64>,
{
    pub fn new(f: F, jac: J, m: usize, u_ref: DVector<f64>, phi: DVector<f64>) -> Self {
        let dim = u_ref.nrows();
        Self {
            f,
            jac,
            dim,
            m,
            u_ref,
            phi,
        }
    }

    pub fn unknowns(&self) -> usize {
        self.m * self.dim + 1
    }

    pub fn period(&self, y: &DVector<f64>) -> f64 {
        y[self.m * self.dim]
    }

    fn slice(&self, y: &DVector<f64>, i: usize) -> DVector<f64> {
        y.rows((i % self.m) * self.dim, self.dim).into_owned()
    }

    /// Sparse Jacobian of the functional, as a compressed column matrix.
    /// Duplicate entries accumulate, which also covers the M = 1 wrap.
    pub fn sparse_jacobian(&self, y: &DVector<f64>, p: f64) -> CscMatrix<f64> {
        let (n, m) = (self.dim, self.m);
        let size = self.unknowns();
        let t = self.period(y);
        let h = t / m as f64;

        let mut coo = CooMatrix::new(size, size);
        for i in 0..m {
            let xi = self.slice(y, i);
            let xip = self.slice(y, i + 1);
            let ji = (self.jac)(&xi, p);
            let jip = (self.jac)(&xip, p);
            let fi = (self.f)(&xi, p);
            let fip = (self.f)(&xip, p);
            let row0 = i * n;
            let col_i = i * n;
            let col_ip = ((i + 1) % m) * n;
            for r in 0..n {
                for c in 0..n {
                    // ∂g_i/∂x_i = −I − (h/2)·J(x_i)
                    let mut v = -h / 2.0 * ji[(r, c)];
                    if r == c {
                        v -= 1.0;
                    }
                    coo.push(row0 + r, col_i + c, v);
                    // ∂g_i/∂x_{i+1} = I − (h/2)·J(x_{i+1})
                    let mut w = -h / 2.0 * jip[(r, c)];
                    if r == c {
                        w += 1.0;
                    }
                    coo.push(row0 + r, col_ip + c, w);
                }
                // ∂g_i/∂T = −(1/2M)·(F(x_{i+1}) + F(x_i))
                coo.push(row0 + r, m * n, -(fip[r] + fi[r]) / (2.0 * m as f64));
            }
        }
        for c in 0..n {
            coo.push(m * n, c, self.phi[c]);
        }
        CscMatrix::from(&coo)
    }

    /// Monodromy as a left fold of the per-slice trapezoid factors,
    /// `∏ (I − h/2·J(x_i))⁻¹ (I + h/2·J(x_{i−1}))`, applied to `v`.
    pub fn monodromy_apply(
        &self,
        y: &DVector<f64>,
        p: f64,
        v: &DVector<f64>,
    ) -> AnyResult<DVector<f64>> {
        let (n, m) = (self.dim, self.m);
        let t = self.period(y);
        let h = t / m as f64;
        let eye = DMatrix::identity(n, n);

        let mut w = v.clone();
        for i in 1..=m {
            let left = &eye - (self.jac)(&self.slice(y, i), p) * (h / 2.0);
            let right = &eye + (self.jac)(&self.slice(y, i - 1), p) * (h / 2.0);
            let rhs = &right * &w;
            w = left
                .lu()
                .solve(&rhs)
                .ok_or_else(|| anyhow::anyhow!("singular trapezoid factor in monodromy"))?;
        }
        Ok(w)
    }

    /// Dense monodromy matrix, by applying the fold to the basis.
    pub fn monodromy_matrix(&self, y: &DVector<f64>, p: f64) -> AnyResult<DMatrix<f64>> {
        let n = self.dim;
        let mut mono = DMatrix::zeros(n, n);
        let mut e = DVector::zeros(n);
        for j in 0..n {
            e[j] = 1.0;
            let col = self.monodromy_apply(y, p, &e)?;
            for i in 0..n {
                mono[(i, j)] = col[i];
            }
            e[j] = 0.0;
        }
        Ok(mono)
    }
}

impl<F, J> VectorField for PeriodicOrbitTrap<F, J>
where
    F: Fn(&DVector<f64>, f64) -> DVector<f64>,
    J: Fn(&DVector<f64>, f64) -> DMatrix<f64>,
{
    type State = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn eval(&self, y: &Self::State, p: f64) -> AnyResult<Self::State> {
        let (n, m) = (self.dim, self.m);
        let t = self.period(y);
        let h = t / m as f64;

        let mut g = DVector::zeros(self.unknowns());
        for i in 0..m {
            let xi = self.slice(y, i);
            let xip = self.slice(y, i + 1);
            let fi = (self.f)(&xi, p);
            let fip = (self.f)(&xip, p);
            for r in 0..n {
                g[i * n + r] = xip[r] - xi[r] - h / 2.0 * (fip[r] + fi[r]);
            }
        }
        let x1 = self.slice(y, 0);
        g[m * n] = (&x1 - &self.u_ref).dot(&self.phi);
        Ok(g)
    }

    fn jacobian(&self, y: &Self::State, p: f64) -> AnyResult<Self::Jacobian> {
        let csc = self.sparse_jacobian(y, p);
        let size = self.unknowns();
        let mut dense = DMatrix::zeros(size, size);
        for (r, c, v) in csc.triplet_iter() {
            dense[(r, c)] += *v;
        }
        Ok(dense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bordered::BorderingBls;
    use crate::continuation::ContIterator;
    use crate::continuation::{stability::StabilityRule, ContinuationParams};
    use crate::linear::{DenseEigen, DenseLu, EigenSolver, EigenWhich, LinearSolver};
    use crate::newton::NewtonParams;
    use crate::periodic::floquet;
    use crate::periodic::guess_from_hopf;
    use crate::predictor::Predictor;

    fn normal_form_f(u: &DVector<f64>, p: f64) -> DVector<f64> {
        let r2 = u[0] * u[0] + u[1] * u[1];
        DVector::from_vec(vec![
            p * u[0] - u[1] - u[0] * r2,
            u[0] + p * u[1] - u[1] * r2,
        ])
    }

    fn normal_form_j(u: &DVector<f64>, p: f64) -> DMatrix<f64> {
        let (x, y) = (u[0], u[1]);
        DMatrix::from_row_slice(
            2,
            2,
            &[
                p - 3.0 * x * x - y * y,
                -1.0 - 2.0 * x * y,
                1.0 - 2.0 * x * y,
                p - x * x - 3.0 * y * y,
            ],
        )
    }

    fn trap_problem(m: usize) -> PeriodicOrbitTrap<
        impl Fn(&DVector<f64>, f64) -> DVector<f64>,
        impl Fn(&DVector<f64>, f64) -> DMatrix<f64>,
    > {
        // Phase anchored at the equilibrium, direction e2: pins x₁ to the
        // positive x-axis of the cycle.
        PeriodicOrbitTrap::new(
            normal_form_f,
            normal_form_j,
            m,
            DVector::zeros(2),
            DVector::from_vec(vec![0.0, 1.0]),
        )
    }

    fn converge_orbit(m: usize, p: f64) -> (PeriodicOrbitTrap<
        impl Fn(&DVector<f64>, f64) -> DVector<f64>,
        impl Fn(&DVector<f64>, f64) -> DMatrix<f64>,
    >, DVector<f64>) {
        let problem = trap_problem(m);
        let jac_hopf = normal_form_j(&DVector::zeros(2), 0.0);
        let guess = guess_from_hopf(&jac_hopf, &DVector::zeros(2), m, p.sqrt()).unwrap();

        let params = NewtonParams {
            tol: 1e-9,
            max_iter: 20,
            ..NewtonParams::default()
        };
        let residual = |y: &DVector<f64>| -> crate::error::Result<DVector<f64>> {
            Ok(problem.eval(y, p)?)
        };
        let solve = |y: &DVector<f64>, rhs: &DVector<f64>| -> crate::error::Result<DVector<f64>> {
            let a = problem.jacobian(y, p)?;
            Ok(DenseLu.solve(&a, rhs)?.x)
        };
        let out = crate::newton::newton(guess.y.clone(), residual, solve, &params, None, None)
            .unwrap();
        assert!(out.converged, "trapezoid newton failed");
        assert!(out.iterations < 10);
        (problem, out.x)
    }

    #[test]
    fn orbit_of_the_hopf_normal_form() {
        let p = 0.5;
        let (problem, y) = converge_orbit(40, p);

        // Discrete period of the trapezoid scheme: T = 2M·tan(π/M).
        let t = problem.period(&y);
        let expected = 2.0 * 40.0 * (std::f64::consts::PI / 40.0).tan();
        assert!((t - expected).abs() < 1e-3, "T = {t}");

        // Amplitude close to √p on every slice.
        for i in 0..problem.m {
            let xi = y.rows(i * 2, 2);
            let r = (xi[0] * xi[0] + xi[1] * xi[1]).sqrt();
            assert!((r - p.sqrt()).abs() < 0.02, "r = {r}");
        }

        // Phase constraint pins slice 0 to the axis.
        assert!(y[1].abs() < 1e-8);
    }

    #[test]
    fn floquet_multipliers_of_the_stable_cycle() {
        let p = 0.5;
        let (problem, y) = converge_orbit(40, p);
        let mono = problem.monodromy_matrix(&y, p).unwrap();
        let dec = DenseEigen::default()
            .eigen(&mono, 2, EigenWhich::LargestModulus)
            .unwrap();
        // Trivial multiplier near +1, the other well inside the unit circle.
        assert!((dec.values[0] - num_complex::Complex::new(1.0, 0.0)).norm() < 0.05);
        assert!(dec.values[1].norm() < 0.1);
        let exponents = floquet::log_multipliers(&dec.values);
        assert!(exponents[0].re.abs() < 0.06);
    }

    #[test]
    fn cycle_continuation_in_p() {
        let p0 = 0.5;
        let (problem, y) = converge_orbit(24, p0);

        let params = ContinuationParams {
            ds: 0.05,
            ds_max: 0.1,
            max_steps: 6,
            detect_fold: false,
            compute_eigenvalues: true,
            nev: 2,
            // Keep the trivial multiplier (≈1 up to discretization error)
            // on the stable side of the count.
            precision_stability: 0.05,
            newton: NewtonParams {
                tol: 1e-8,
                ..NewtonParams::default()
            },
            ..ContinuationParams::default()
        };
        let bls = BorderingBls::new(DenseLu);
        let eig = DenseEigen::default();
        let spectrum = floquet::trap_floquet_spectrum(&problem, &eig);
        let it = ContIterator::new(&problem, &bls, y, p0, params, Predictor::Secant)
            .unwrap()
            .with_spectrum(spectrum, StabilityRule::Modulus)
            .with_verbosity(0);
        let out = it.run();
        assert!(out.failure.is_none(), "failure: {:?}", out.failure);
        assert!(out.record.points.len() > 3);
        // The cycle amplitude grows like √p along the branch.
        let p_end = out.last.p;
        let r_end = {
            let x = out.last.u[0];
            let y1 = out.last.u[1];
            (x * x + y1 * y1).sqrt()
        };
        assert!((r_end - p_end.sqrt()).abs() < 0.05);
        // Every confirmed point is a stable cycle.
        for pt in &out.record.points {
            assert!(pt.n_unstable == 0);
        }
    }
}
