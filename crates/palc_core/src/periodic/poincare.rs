//! Poincaré-section shooting.
//!
//! Each of the `M` hyperplanes `Σᵢ = {x : ⟨x − cᵢ, nᵢ⟩ = 0}` carries one
//! unknown point in section coordinates (dimension N − 1, one coordinate
//! dropped and reconstructed from the plane equation). The constraints are
//! the first-return maps `Πᵢ : Σᵢ → Σ_{i+1}`; the period is recovered as
//! the sum of the return times.

use anyhow::{anyhow, Result as AnyResult};
use nalgebra::{DMatrix, DVector};

use crate::flow::Flow;
use crate::system::VectorField;

/// A hyperplane with normal `n` and center `c`. The coordinate with the
/// largest normal component is dropped in section coordinates.
#[derive(Debug, Clone)]
pub struct Section {
    pub normal: DVector<f64>,
    pub center: DVector<f64>,
    drop_index: usize,
}

impl Section {
    pub fn new(normal: DVector<f64>, center: DVector<f64>) -> Self {
        let mut drop_index = 0;
        let mut best = 0.0;
        for (i, v) in normal.iter().enumerate() {
            if v.abs() > best {
                best = v.abs();
                drop_index = i;
            }
        }
        Self {
            normal,
            center,
            drop_index,
        }
    }

    pub fn value(&self, x: &DVector<f64>) -> f64 {
        (x - &self.center).dot(&self.normal)
    }

    /// Into section coordinates: drop the pivot coordinate.
    pub fn project(&self, x: &DVector<f64>) -> DVector<f64> {
        let n = x.nrows();
        let mut out = DVector::zeros(n - 1);
        let mut k = 0;
        for i in 0..n {
            if i != self.drop_index {
                out[k] = x[i];
                k += 1;
            }
        }
        out
    }

    /// Back into state space, recovering the pivot coordinate from the
    /// plane equation.
    pub fn lift(&self, xbar: &DVector<f64>) -> DVector<f64> {
        let n = xbar.nrows() + 1;
        let mut x = DVector::zeros(n);
        let mut k = 0;
        for i in 0..n {
            if i != self.drop_index {
                x[i] = xbar[k];
                k += 1;
            }
        }
        let mut acc = 0.0;
        for i in 0..n {
            if i != self.drop_index {
                acc += self.normal[i] * (x[i] - self.center[i]);
            }
        }
        x[self.drop_index] = self.center[self.drop_index] - acc / self.normal[self.drop_index];
        x
    }
}

pub struct PoincareShooting<R>
where
    R: Fn(f64, &[f64], &mut [f64]),
{
    pub flow: Flow<R>,
    pub sections: Vec<Section>,
    /// Integration step for the crossing search.
    pub dt: f64,
    /// Budget for a single return.
    pub t_max: f64,
    pub fd_eps: f64,
}

impl<R> PoincareShooting<R>
where
    R: Fn(f64, &[f64], &mut [f64]),
{
    pub fn new(flow: Flow<R>, sections: Vec<Section>) -> Self {
        Self {
            flow,
            sections,
            dt: 0.05,
            t_max: 1e3,
            fd_eps: 1e-7,
        }
    }

    pub fn m(&self) -> usize {
        self.sections.len()
    }

    /// Dimension of the unknown vector: `M · (N − 1)`.
    pub fn unknowns(&self) -> usize {
        self.m() * (self.flow.dim - 1)
    }

    fn slice(&self, y: &DVector<f64>, i: usize) -> DVector<f64> {
        let w = self.flow.dim - 1;
        y.rows((i % self.m()) * w, w).into_owned()
    }

    /// First return `Πᵢ : Σᵢ → Σ_{i+1}` in section coordinates, with its
    /// flight time. Crossings must match the flow direction through the
    /// target plane at departure, the first strict one wins.
    pub fn return_map(
        &self,
        i: usize,
        xbar: &DVector<f64>,
        p: f64,
    ) -> AnyResult<(DVector<f64>, f64)> {
        let m = self.m();
        let from = &self.sections[i % m];
        let to = &self.sections[(i + 1) % m];
        let x = from.lift(xbar);
        let direction = to.normal.dot(&self.flow.vector_field(p, &x));
        let section = |z: &DVector<f64>| to.value(z);
        let (hit, time) = self
            .flow
            .first_crossing(p, &x, &section, self.dt, self.t_max, direction)
            .map_err(|e| anyhow!("return to section {}: {e}", (i + 1) % m))?;
        Ok((to.project(&hit), time))
    }

    /// Total flight time around the orbit; the period of the cycle.
    pub fn period(&self, y: &DVector<f64>, p: f64) -> AnyResult<f64> {
        let mut total = 0.0;
        for i in 0..self.m() {
            let (_, time) = self.return_map(i, &self.slice(y, i), p)?;
            total += time;
        }
        Ok(total)
    }

    /// Jacobian of one return map by centered differences, in section
    /// coordinates.
    fn return_jacobian(&self, i: usize, xbar: &DVector<f64>, p: f64) -> AnyResult<DMatrix<f64>> {
        let w = xbar.nrows();
        let mut jac = DMatrix::zeros(w, w);
        let mut xs = xbar.clone();
        for j in 0..w {
            let step = self.fd_eps.sqrt() * (1.0 + xbar[j].abs());
            xs[j] = xbar[j] + step;
            let (plus, _) = self.return_map(i, &xs, p)?;
            xs[j] = xbar[j] - step;
            let (minus, _) = self.return_map(i, &xs, p)?;
            xs[j] = xbar[j];
            for r in 0..w {
                jac[(r, j)] = (plus[r] - minus[r]) / (2.0 * step);
            }
        }
        Ok(jac)
    }

    /// Monodromy of the cycle in section coordinates: the composition of
    /// the return-map Jacobians.
    pub fn monodromy_matrix(&self, y: &DVector<f64>, p: f64) -> AnyResult<DMatrix<f64>> {
        let w = self.flow.dim - 1;
        let mut mono = DMatrix::identity(w, w);
        for i in 0..self.m() {
            let jac = self.return_jacobian(i, &self.slice(y, i), p)?;
            mono = jac * mono;
        }
        Ok(mono)
    }
}

impl<R> VectorField for PoincareShooting<R>
where
    R: Fn(f64, &[f64], &mut [f64]),
{
    type State = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn eval(&self, y: &Self::State, p: f64) -> AnyResult<Self::State> {
        let w = self.flow.dim - 1;
        let m = self.m();
        let mut g = DVector::zeros(self.unknowns());
        for i in 0..m {
            let (mapped, _) = self.return_map(i, &self.slice(y, i), p)?;
            let next = self.slice(y, i + 1);
            for r in 0..w {
                g[i * w + r] = mapped[r] - next[r];
            }
        }
        Ok(g)
    }

    fn jacobian(&self, y: &Self::State, p: f64) -> AnyResult<Self::Jacobian> {
        let w = self.flow.dim - 1;
        let m = self.m();
        let size = self.unknowns();
        let mut a = DMatrix::zeros(size, size);
        for i in 0..m {
            let jac = self.return_jacobian(i, &self.slice(y, i), p)?;
            let next = ((i + 1) % m) * w;
            for r in 0..w {
                for c in 0..w {
                    a[(i * w + r, i * w + c)] = jac[(r, c)];
                }
                a[(i * w + r, next + r)] -= 1.0;
            }
        }
        Ok(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::{DenseLu, LinearSolver};
    use crate::newton::{newton, NewtonParams};

    fn normal_form(p: f64, x: &[f64], out: &mut [f64]) {
        let r2 = x[0] * x[0] + x[1] * x[1];
        out[0] = p * x[0] - x[1] - x[0] * r2;
        out[1] = x[0] + p * x[1] - x[1] * r2;
    }

    fn problem() -> PoincareShooting<fn(f64, &[f64], &mut [f64])> {
        let flow = Flow::new(normal_form as fn(f64, &[f64], &mut [f64]), 2).with_steps(50);
        let section = Section::new(
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::from_vec(vec![0.5, 0.0]),
        );
        PoincareShooting::new(flow, vec![section])
    }

    #[test]
    fn projection_and_lift_are_inverse_on_the_plane() {
        let s = Section::new(
            DVector::from_vec(vec![2.0, 1.0, 0.5]),
            DVector::from_vec(vec![1.0, 0.0, 0.0]),
        );
        let xbar = DVector::from_vec(vec![0.3, -0.7]);
        let x = s.lift(&xbar);
        assert!(s.value(&x).abs() < 1e-12);
        let back = s.project(&x);
        assert!((back - xbar).norm() < 1e-12);
    }

    #[test]
    fn fixed_point_of_the_return_map_is_the_cycle() {
        // Cycle of radius √0.5 ≈ 0.707 crosses x = 0.5 at y = ±0.5; the
        // same-direction return comes back after a full period.
        let p = 0.5;
        let ps = problem();
        let y0 = DVector::from_vec(vec![0.45]);

        let params = NewtonParams {
            tol: 1e-8,
            max_iter: 20,
            ..NewtonParams::default()
        };
        let residual =
            |y: &DVector<f64>| -> crate::error::Result<DVector<f64>> { Ok(ps.eval(y, p)?) };
        let solve = |y: &DVector<f64>, rhs: &DVector<f64>| -> crate::error::Result<DVector<f64>> {
            let a = ps.jacobian(y, p)?;
            Ok(DenseLu.solve(&a, rhs)?.x)
        };
        let out = newton(y0, residual, solve, &params, None, None).unwrap();
        assert!(out.converged);
        assert!((out.x[0].abs() - 0.5).abs() < 1e-5, "y* = {}", out.x[0]);

        let period = ps.period(&out.x, p).unwrap();
        assert!((period - std::f64::consts::TAU).abs() < 1e-3, "T = {period}");
    }

    #[test]
    fn section_monodromy_contracts_for_the_stable_cycle() {
        let p = 0.5;
        let ps = problem();
        let y = DVector::from_vec(vec![0.5]);
        let mono = ps.monodromy_matrix(&y, p).unwrap();
        // One section coordinate: the multiplier is the radial contraction.
        assert!(mono[(0, 0)].abs() < 0.1);
    }
}
