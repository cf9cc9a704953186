//! Standard (single and multiple) shooting for periodic orbits.
//!
//! Unknowns `[x₁, …, x_M, T]` with the matching conditions
//! `φ^{δsᵢ·T}(xᵢ) = x_{i+1 mod M}` and a phase section `s(x₁) = 0`.

use anyhow::Result as AnyResult;
use nalgebra::{DMatrix, DVector};

use crate::flow::Flow;
use crate::system::VectorField;

pub struct ShootingProblem<R, Sec>
where
    R: Fn(f64, &[f64], &mut [f64]),
    Sec: Fn(&DVector<f64>) -> f64,
{
    pub flow: Flow<R>,
    /// Number of shooting segments.
    pub m: usize,
    /// Segment fractions `δsᵢ` of the period; they sum to one.
    pub fractions: Vec<f64>,
    /// Phase section, evaluated at `x₁`.
    pub section: Sec,
    pub fd_eps: f64,
}

impl<R, Sec> ShootingProblem<R, Sec>
where
    R: Fn(f64, &[f64], &mut [f64]),
    Sec: Fn(&DVector<f64>) -> f64,
{
    pub fn new(flow: Flow<R>, m: usize, section: Sec) -> Self {
        Self {
            flow,
            m,
            fractions: vec![1.0 / m as f64; m],
            section,
            fd_eps: 1e-7,
        }
    }

    pub fn unknowns(&self) -> usize {
        self.m * self.flow.dim + 1
    }

    pub fn period(&self, y: &DVector<f64>) -> f64 {
        y[self.m * self.flow.dim]
    }

    fn slice(&self, y: &DVector<f64>, i: usize) -> DVector<f64> {
        y.rows((i % self.m) * self.flow.dim, self.flow.dim)
            .into_owned()
    }

    /// Mismatch of one full sweep, `φ^T(x₁) − x₁` for M = 1.
    pub fn cycle_defect(&self, y: &DVector<f64>, p: f64) -> f64 {
        let t = self.period(y);
        let mut x = self.slice(y, 0);
        for frac in &self.fractions {
            x = self.flow.advance(p, &x, frac * t);
        }
        (x - self.slice(y, 0)).norm()
    }

    /// Monodromy action `M_M · … · M_1 · v` as composed flow-Jacobian
    /// products; no matrix is formed.
    pub fn monodromy_apply(&self, y: &DVector<f64>, p: f64, v: &DVector<f64>) -> DVector<f64> {
        let t = self.period(y);
        let mut w = v.clone();
        for i in 0..self.m {
            let xi = self.slice(y, i);
            w = self
                .flow
                .jacobian_apply(p, &xi, self.fractions[i] * t, &w, self.fd_eps);
        }
        w
    }

    pub fn monodromy_matrix(&self, y: &DVector<f64>, p: f64) -> DMatrix<f64> {
        let n = self.flow.dim;
        let mut mono = DMatrix::zeros(n, n);
        let mut e = DVector::zeros(n);
        for j in 0..n {
            e[j] = 1.0;
            let col = self.monodromy_apply(y, p, &e);
            for i in 0..n {
                mono[(i, j)] = col[i];
            }
            e[j] = 0.0;
        }
        mono
    }
}

impl<R, Sec> VectorField for ShootingProblem<R, Sec>
where
    R: Fn(f64, &[f64], &mut [f64]),
    Sec: Fn(&DVector<f64>) -> f64,
{
    type State = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn eval(&self, y: &Self::State, p: f64) -> AnyResult<Self::State> {
        let n = self.flow.dim;
        let t = self.period(y);

        let mut g = DVector::zeros(self.unknowns());
        for i in 0..self.m {
            let xi = self.slice(y, i);
            let target = self.flow.advance(p, &xi, self.fractions[i] * t);
            let xnext = self.slice(y, i + 1);
            for r in 0..n {
                g[i * n + r] = target[r] - xnext[r];
            }
        }
        g[self.m * n] = (self.section)(&self.slice(y, 0));
        Ok(g)
    }

    fn jacobian(&self, y: &Self::State, p: f64) -> AnyResult<Self::Jacobian> {
        let n = self.flow.dim;
        let m = self.m;
        let t = self.period(y);
        let size = self.unknowns();
        let mut a = DMatrix::zeros(size, size);

        let mut e = DVector::zeros(n);
        for i in 0..m {
            let xi = self.slice(y, i);
            let dt = self.fractions[i] * t;
            // ∂/∂xᵢ: flow Jacobian of the segment.
            for j in 0..n {
                e[j] = 1.0;
                let col = self.flow.jacobian_apply(p, &xi, dt, &e, self.fd_eps);
                e[j] = 0.0;
                for r in 0..n {
                    a[(i * n + r, i * n + j)] = col[r];
                }
            }
            // ∂/∂x_{i+1} = −I.
            let next = ((i + 1) % m) * n;
            for r in 0..n {
                a[(i * n + r, next + r)] -= 1.0;
            }
            // ∂/∂T = δsᵢ·F(φ^{δsᵢT}(xᵢ)).
            let endpoint = self.flow.advance(p, &xi, dt);
            let f_end = self.flow.vector_field(p, &endpoint);
            for r in 0..n {
                a[(i * n + r, m * n)] = self.fractions[i] * f_end[r];
            }
        }

        // Phase row by centered differences of the section.
        let x1 = self.slice(y, 0);
        let mut xs = x1.clone();
        for j in 0..n {
            let step = self.fd_eps * (1.0 + x1[j].abs());
            xs[j] = x1[j] + step;
            let plus = (self.section)(&xs);
            xs[j] = x1[j] - step;
            let minus = (self.section)(&xs);
            xs[j] = x1[j];
            a[(m * n, j)] = (plus - minus) / (2.0 * step);
        }
        Ok(a)
    }
}
