//! Fixed-step ODE integration for the shooting functionals.
//!
//! The steppers advance an autonomous right-hand side in place; [`Flow`]
//! wraps one of them into the time-`T` solution map `φ^T` with
//! finite-difference directional Jacobians and the section-crossing search
//! used by Poincaré return maps.

use anyhow::{bail, Result};
use nalgebra::DVector;

/// One step of a fixed-step scheme. The right-hand side writes `dx/dt`
/// into `out`.
pub trait Stepper {
    fn step<R: Fn(&[f64], &mut [f64])>(&mut self, rhs: &R, t: &mut f64, state: &mut [f64], dt: f64);
}

/// Classic Runge-Kutta 4th order.
pub struct Rk4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Stepper for Rk4 {
    fn step<R: Fn(&[f64], &mut [f64])>(&mut self, rhs: &R, t: &mut f64, state: &mut [f64], dt: f64) {
        rhs(state, &mut self.k1);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + 0.5 * dt * self.k1[i];
        }
        rhs(&self.tmp, &mut self.k2);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + 0.5 * dt * self.k2[i];
        }
        rhs(&self.tmp, &mut self.k3);

        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        rhs(&self.tmp, &mut self.k4);

        for i in 0..state.len() {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }

        *t += dt;
    }
}

/// Tsitouras 5(4), fixed-step variant.
pub struct Tsit5 {
    k: [Vec<f64>; 6],
    tmp: Vec<f64>,
}

impl Tsit5 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: [
                vec![0.0; dim],
                vec![0.0; dim],
                vec![0.0; dim],
                vec![0.0; dim],
                vec![0.0; dim],
                vec![0.0; dim],
            ],
            tmp: vec![0.0; dim],
        }
    }
}

impl Stepper for Tsit5 {
    fn step<R: Fn(&[f64], &mut [f64])>(&mut self, rhs: &R, t: &mut f64, state: &mut [f64], dt: f64) {
        const A21: f64 = 0.161;
        const A31: f64 = -0.008480655492356989;
        const A32: f64 = 0.335480655492357;
        const A41: f64 = 2.898;
        const A42: f64 = -6.359447987781783;
        const A43: f64 = 4.361447987781783;
        const A51: f64 = 5.325864858437957;
        const A52: f64 = -11.748883564062828;
        const A53: f64 = 7.495539342889693;
        const A54: f64 = -0.09249506636030195;
        const A61: f64 = 5.86145544294642;
        const A62: f64 = -12.92096931784711;
        const A63: f64 = 8.159367898576159;
        const A64: f64 = -0.071584973281401;
        const A65: f64 = -0.02826857949054663;
        const B1: f64 = 0.09646076681806523;
        const B2: f64 = 0.01;
        const B3: f64 = 0.4798896504144996;
        const B4: f64 = 1.379008574103742;
        const B5: f64 = -3.290069515436099;
        const B6: f64 = 2.324710524099774;

        let n = state.len();
        rhs(state, &mut self.k[0]);

        for i in 0..n {
            self.tmp[i] = state[i] + dt * A21 * self.k[0][i];
        }
        rhs(&self.tmp, &mut self.k[1]);

        for i in 0..n {
            self.tmp[i] = state[i] + dt * (A31 * self.k[0][i] + A32 * self.k[1][i]);
        }
        rhs(&self.tmp, &mut self.k[2]);

        for i in 0..n {
            self.tmp[i] =
                state[i] + dt * (A41 * self.k[0][i] + A42 * self.k[1][i] + A43 * self.k[2][i]);
        }
        rhs(&self.tmp, &mut self.k[3]);

        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (A51 * self.k[0][i]
                    + A52 * self.k[1][i]
                    + A53 * self.k[2][i]
                    + A54 * self.k[3][i]);
        }
        rhs(&self.tmp, &mut self.k[4]);

        for i in 0..n {
            self.tmp[i] = state[i]
                + dt * (A61 * self.k[0][i]
                    + A62 * self.k[1][i]
                    + A63 * self.k[2][i]
                    + A64 * self.k[3][i]
                    + A65 * self.k[4][i]);
        }
        rhs(&self.tmp, &mut self.k[5]);

        for i in 0..n {
            state[i] += dt
                * (B1 * self.k[0][i]
                    + B2 * self.k[1][i]
                    + B3 * self.k[2][i]
                    + B4 * self.k[3][i]
                    + B5 * self.k[4][i]
                    + B6 * self.k[5][i]);
        }

        *t += dt;
    }
}

/// The solution map `φ^T` of an autonomous, parameter-dependent field.
pub struct Flow<R>
where
    R: Fn(f64, &[f64], &mut [f64]),
{
    pub rhs: R,
    pub dim: usize,
    /// Substeps per `advance` call.
    pub steps: usize,
}

impl<R> Flow<R>
where
    R: Fn(f64, &[f64], &mut [f64]),
{
    pub fn new(rhs: R, dim: usize) -> Self {
        Self {
            rhs,
            dim,
            steps: 100,
        }
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps.max(1);
        self
    }

    /// `φ^time(x0)` at parameter `p`.
    pub fn advance(&self, p: f64, x0: &DVector<f64>, time: f64) -> DVector<f64> {
        let mut state: Vec<f64> = x0.iter().cloned().collect();
        let mut stepper = Tsit5::new(self.dim);
        let mut t = 0.0;
        let dt = time / self.steps as f64;
        let rhs = |x: &[f64], out: &mut [f64]| (self.rhs)(p, x, out);
        for _ in 0..self.steps {
            stepper.step(&rhs, &mut t, &mut state, dt);
        }
        DVector::from_vec(state)
    }

    /// Directional flow-Jacobian product `∂ₓφ^time(x0)·v` by central
    /// differences along the normalized direction.
    pub fn jacobian_apply(
        &self,
        p: f64,
        x0: &DVector<f64>,
        time: f64,
        v: &DVector<f64>,
        eps: f64,
    ) -> DVector<f64> {
        let vnorm = v.norm();
        if vnorm == 0.0 {
            return DVector::zeros(self.dim);
        }
        let h = eps * (1.0 + x0.norm());
        let dir = v / vnorm;
        let plus = self.advance(p, &(x0 + &dir * h), time);
        let minus = self.advance(p, &(x0 - &dir * h), time);
        (plus - minus) * (vnorm / (2.0 * h))
    }

    /// Vector field value, as a dense vector.
    pub fn vector_field(&self, p: f64, x: &DVector<f64>) -> DVector<f64> {
        let mut out = vec![0.0; self.dim];
        (self.rhs)(p, x.as_slice(), &mut out);
        DVector::from_vec(out)
    }

    /// First strict crossing of `section(x) = 0` along the orbit of `x0`.
    ///
    /// A zero of the section at the starting point is ignored; the first
    /// subsequent sign change terminates the search and is refined by
    /// bisection on the final step. A nonzero `direction` restricts the
    /// search to crossings where the section value increases (`> 0`) or
    /// decreases (`< 0`). Returns the crossing state and time.
    pub fn first_crossing(
        &self,
        p: f64,
        x0: &DVector<f64>,
        section: &dyn Fn(&DVector<f64>) -> f64,
        dt: f64,
        t_max: f64,
        direction: f64,
    ) -> Result<(DVector<f64>, f64)> {
        let mut stepper = Tsit5::new(self.dim);
        let rhs = |x: &[f64], out: &mut [f64]| (self.rhs)(p, x, out);

        let mut t = 0.0;
        let mut state: Vec<f64> = x0.iter().cloned().collect();
        let mut s_prev = section(&DVector::from_column_slice(&state));

        while t < t_max {
            let prev_state = state.clone();
            let t_prev = t;
            stepper.step(&rhs, &mut t, &mut state, dt);
            let s_new = section(&DVector::from_column_slice(&state));

            if s_prev == 0.0 {
                s_prev = s_new;
                continue;
            }
            if s_prev * s_new < 0.0 && direction * (s_new - s_prev) >= 0.0 {
                // Bisect the step fraction for the crossing instant.
                let mut lo = 0.0;
                let mut hi = dt;
                for _ in 0..60 {
                    let mid = 0.5 * (lo + hi);
                    let mut x_mid = prev_state.clone();
                    let mut tt = t_prev;
                    stepper.step(&rhs, &mut tt, &mut x_mid, mid);
                    let s_mid = section(&DVector::from_column_slice(&x_mid));
                    if s_mid == 0.0 || hi - lo < 1e-14 * dt.max(1.0) {
                        return Ok((DVector::from_vec(x_mid), t_prev + mid));
                    }
                    if s_prev * s_mid < 0.0 {
                        hi = mid;
                    } else {
                        lo = mid;
                    }
                }
                let mut x_cross = prev_state;
                let mut tt = t_prev;
                stepper.step(&rhs, &mut tt, &mut x_cross, 0.5 * (lo + hi));
                return Ok((DVector::from_vec(x_cross), t_prev + 0.5 * (lo + hi)));
            }
            s_prev = s_new;
        }

        bail!("no section crossing before t = {t_max}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation(_p: f64, x: &[f64], out: &mut [f64]) {
        out[0] = -x[1];
        out[1] = x[0];
    }

    #[test]
    fn rk4_integrates_harmonic_oscillator() {
        let mut stepper = Rk4::new(2);
        let mut state = vec![1.0, 0.0];
        let mut t = 0.0;
        let n = 1000;
        let dt = std::f64::consts::TAU / n as f64;
        let rhs = |x: &[f64], out: &mut [f64]| rotation(0.0, x, out);
        for _ in 0..n {
            stepper.step(&rhs, &mut t, &mut state, dt);
        }
        assert!((state[0] - 1.0).abs() < 1e-8);
        assert!(state[1].abs() < 1e-8);
    }

    #[test]
    fn flow_advance_matches_rotation() {
        let flow = Flow::new(rotation, 2).with_steps(200);
        let x0 = DVector::from_vec(vec![1.0, 0.0]);
        let x = flow.advance(0.0, &x0, std::f64::consts::FRAC_PI_2);
        assert!(x[0].abs() < 1e-8);
        assert!((x[1] - 1.0).abs() < 1e-8);
    }

    #[test]
    fn flow_jacobian_of_linear_field_is_rotation_matrix() {
        let flow = Flow::new(rotation, 2).with_steps(200);
        let x0 = DVector::from_vec(vec![0.3, -0.2]);
        let v = DVector::from_vec(vec![1.0, 0.0]);
        let jv = flow.jacobian_apply(0.0, &x0, std::f64::consts::FRAC_PI_2, &v, 1e-6);
        // dφ/dx of a quarter rotation maps e1 to e2.
        assert!(jv[0].abs() < 1e-5);
        assert!((jv[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn first_crossing_finds_the_half_period() {
        let flow = Flow::new(rotation, 2);
        let x0 = DVector::from_vec(vec![1.0, 0.0]);
        // Section x1 = 0, starting exactly on it: the initial zero must be
        // ignored, the next strict crossing is at t = π.
        let section = |x: &DVector<f64>| x[1];
        let (x, t) = flow
            .first_crossing(0.0, &x0, &section, 0.05, 10.0, 0.0)
            .unwrap();
        assert!((t - std::f64::consts::PI).abs() < 1e-6);
        assert!((x[0] + 1.0).abs() < 1e-6);
    }
}
