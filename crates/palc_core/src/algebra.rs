//! Vector algebra over user state types.
//!
//! The engine never indexes into a state vector; everything it needs is the
//! small set of algebraic operations below. Dense `nalgebra` vectors and bare
//! scalars implement them, and [`BorderedPair`] composes two implementors into
//! the (state, parameter) aggregates the continuation machinery works with.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Algebraic operations required of any state type.
///
/// `norm` is the ∞-norm; the weighted arclength norm lives in
/// [`dot_theta`]/[`norm_theta`] and is only defined on pairs.
pub trait BranchVector: Clone {
    fn zero_like(&self) -> Self;
    fn len(&self) -> usize;
    fn dot(&self, other: &Self) -> f64;
    /// `self += a * x`
    fn axpy(&mut self, a: f64, x: &Self);
    /// `self = a * x + b * self`
    fn axpby(&mut self, a: f64, x: &Self, b: f64);
    fn scale(&mut self, a: f64);
    fn copy_from(&mut self, other: &Self);
    /// ∞-norm.
    fn norm(&self) -> f64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BranchVector for f64 {
    fn zero_like(&self) -> Self {
        0.0
    }

    fn len(&self) -> usize {
        1
    }

    fn dot(&self, other: &Self) -> f64 {
        self * other
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        *self += a * x;
    }

    fn axpby(&mut self, a: f64, x: &Self, b: f64) {
        *self = a * x + b * *self;
    }

    fn scale(&mut self, a: f64) {
        *self *= a;
    }

    fn copy_from(&mut self, other: &Self) {
        *self = *other;
    }

    fn norm(&self) -> f64 {
        self.abs()
    }
}

impl BranchVector for DVector<f64> {
    fn zero_like(&self) -> Self {
        DVector::zeros(self.len())
    }

    fn len(&self) -> usize {
        self.nrows()
    }

    fn dot(&self, other: &Self) -> f64 {
        DVector::dot(self, other)
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        DVector::axpy(self, a, x, 1.0);
    }

    fn axpby(&mut self, a: f64, x: &Self, b: f64) {
        DVector::axpy(self, a, x, b);
    }

    fn scale(&mut self, a: f64) {
        *self *= a;
    }

    fn copy_from(&mut self, other: &Self) {
        self.copy_from(other);
    }

    fn norm(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.amax()
        }
    }
}

/// A (state, parameter) aggregate.
///
/// Deliberately a plain struct and not an array subtype: the state may live
/// anywhere (dense, sparse, device memory) and the parameter leg may itself be
/// a small vector, in which case the operations recurse into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "U: Serialize, P: Serialize",
    deserialize = "U: serde::de::DeserializeOwned, P: serde::de::DeserializeOwned"
))]
pub struct BorderedPair<U, P = f64> {
    pub u: U,
    pub p: P,
}

impl<U, P> BorderedPair<U, P> {
    pub fn new(u: U, p: P) -> Self {
        Self { u, p }
    }
}

impl<U: BranchVector, P: BranchVector> BorderedPair<U, P> {
    /// `self - other`, componentwise.
    pub fn minus(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.axpy(-1.0, other);
        out
    }
}

impl<U: BranchVector, P: BranchVector> BranchVector for BorderedPair<U, P> {
    fn zero_like(&self) -> Self {
        Self {
            u: self.u.zero_like(),
            p: self.p.zero_like(),
        }
    }

    fn len(&self) -> usize {
        self.u.len() + self.p.len()
    }

    fn dot(&self, other: &Self) -> f64 {
        self.u.dot(&other.u) + self.p.dot(&other.p)
    }

    fn axpy(&mut self, a: f64, x: &Self) {
        self.u.axpy(a, &x.u);
        self.p.axpy(a, &x.p);
    }

    fn axpby(&mut self, a: f64, x: &Self, b: f64) {
        self.u.axpby(a, &x.u, b);
        self.p.axpby(a, &x.p, b);
    }

    fn scale(&mut self, a: f64) {
        self.u.scale(a);
        self.p.scale(a);
    }

    fn copy_from(&mut self, other: &Self) {
        self.u.copy_from(&other.u);
        self.p.copy_from(&other.p);
    }

    fn norm(&self) -> f64 {
        self.u.norm().max(self.p.norm())
    }
}

/// User-replaceable inner product on the state leg of the theta dot product.
/// When absent, `⟨u₁,u₂⟩ / len(u)` is used.
pub type StateDot<'a, U> = &'a dyn Fn(&U, &U) -> f64;

/// Weighted arclength dot product
/// `⟨(u₁,p₁),(u₂,p₂)⟩_θ = (θ/len u)·⟨u₁,u₂⟩ + (1−θ)·p₁·p₂`.
pub fn dot_theta<U: BranchVector, P: BranchVector>(
    a: &BorderedPair<U, P>,
    b: &BorderedPair<U, P>,
    theta: f64,
    custom: Option<StateDot<'_, U>>,
) -> f64 {
    let udot = match custom {
        Some(f) => f(&a.u, &b.u),
        None => a.u.dot(&b.u) / a.u.len().max(1) as f64,
    };
    theta * udot + (1.0 - theta) * a.p.dot(&b.p)
}

pub fn norm_theta<U: BranchVector, P: BranchVector>(
    z: &BorderedPair<U, P>,
    theta: f64,
    custom: Option<StateDot<'_, U>>,
) -> f64 {
    dot_theta(z, z, theta, custom).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_ops_are_componentwise() {
        let mut a = BorderedPair::new(DVector::from_vec(vec![1.0, 2.0]), 3.0);
        let b = BorderedPair::new(DVector::from_vec(vec![0.5, -1.0]), 2.0);
        a.axpy(2.0, &b);
        assert_eq!(a.u[0], 2.0);
        assert_eq!(a.u[1], 0.0);
        assert_eq!(a.p, 7.0);
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn axpby_combines_in_place() {
        let mut a = BorderedPair::new(DVector::from_vec(vec![1.0, -1.0]), 2.0);
        let b = BorderedPair::new(DVector::from_vec(vec![2.0, 4.0]), 1.0);
        // a = 0.5*b - a
        a.axpby(0.5, &b, -1.0);
        assert_eq!(a.u[0], 0.0);
        assert_eq!(a.u[1], 3.0);
        assert_eq!(a.p, -1.5);
    }

    #[test]
    fn inf_norm_is_max_of_components() {
        let z = BorderedPair::new(DVector::from_vec(vec![-3.0, 1.0]), 2.0);
        assert_eq!(z.norm(), 3.0);
        let z = BorderedPair::new(DVector::from_vec(vec![0.25]), -8.0);
        assert_eq!(z.norm(), 8.0);
    }

    #[test]
    fn theta_dot_matches_formula() {
        let a = BorderedPair::new(DVector::from_vec(vec![1.0, 1.0]), 2.0);
        let b = BorderedPair::new(DVector::from_vec(vec![3.0, 1.0]), 1.0);
        let theta = 0.4;
        let expected = theta / 2.0 * 4.0 + (1.0 - theta) * 2.0;
        assert!((dot_theta(&a, &b, theta, None) - expected).abs() < 1e-14);
    }

    #[test]
    fn custom_state_dot_replaces_scaled_inner_product() {
        let a = BorderedPair::new(DVector::from_vec(vec![2.0]), 0.0);
        let b = a.clone();
        let weighted = |x: &DVector<f64>, y: &DVector<f64>| 10.0 * x.dot(y);
        let d = dot_theta(&a, &b, 0.5, Some(&weighted));
        assert!((d - 0.5 * 40.0).abs() < 1e-14);
    }

    #[test]
    fn pairs_nest() {
        let inner = BorderedPair::new(DVector::from_vec(vec![1.0, 2.0]), 0.5);
        let outer = BorderedPair::new(inner, DVector::from_vec(vec![3.0]));
        assert_eq!(outer.len(), 4);
        assert_eq!(outer.norm(), 3.0);
    }
}
