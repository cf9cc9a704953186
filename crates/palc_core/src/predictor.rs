//! Predictor strategies for the continuation step.

use serde::{Deserialize, Serialize};

use crate::algebra::{dot_theta, norm_theta, BorderedPair, BranchVector, StateDot};
use crate::bordered::BorderedSolver;
use crate::error::{Error, Result};
use crate::system::VectorField;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predictor {
    /// Frozen state, parameter stepped by `ds`.
    Natural,
    /// Step of length `ds` along the last secant tangent.
    Secant,
    /// Tangent from the bordered null-direction solve at the last point.
    BorderedTangent,
}

/// Predicted point for the next corrector run.
pub fn predict<U: BranchVector>(
    kind: Predictor,
    z_old: &BorderedPair<U>,
    tau_old: &BorderedPair<U>,
    ds: f64,
) -> BorderedPair<U> {
    let mut z = z_old.clone();
    match kind {
        Predictor::Natural => z.p += ds,
        Predictor::Secant | Predictor::BorderedTangent => z.axpy(ds, tau_old),
    }
    z
}

/// Secant tangent: `(z_new − z_old) / ds`, renormalized under the theta norm.
/// Dividing by the signed `ds` preserves the traversal direction.
pub fn secant_tangent<U: BranchVector>(
    z_new: &BorderedPair<U>,
    z_old: &BorderedPair<U>,
    ds: f64,
    theta: f64,
    custom: Option<StateDot<'_, U>>,
) -> Result<BorderedPair<U>> {
    let mut tau = z_new.clone();
    tau.axpby(-1.0 / ds, z_old, 1.0 / ds);
    let n = norm_theta(&tau, theta, custom);
    if !(n.is_finite() && n > 0.0) {
        return Err(Error::Linear {
            what: "degenerate secant tangent".into(),
        });
    }
    tau.scale(1.0 / n);
    Ok(tau)
}

/// Tangent from the bordered solve with right-hand side (0, 1): the null
/// direction of the augmented Jacobian. Oriented so the parameter component
/// keeps the sign of the previous tangent, then normalized under the theta
/// norm.
pub fn bordered_tangent<S, BS>(
    field: &S,
    bls: &BS,
    u: &S::State,
    p: f64,
    theta: f64,
    fin_diff_eps: f64,
    custom: Option<StateDot<'_, S::State>>,
    prev: Option<&BorderedPair<S::State>>,
) -> Result<BorderedPair<S::State>>
where
    S: VectorField,
    BS: BorderedSolver<S::State, S::Jacobian>,
{
    let jac = field.jacobian(u, p)?;
    let dfdp = field.dfdp(u, p, fin_diff_eps)?;

    let xi_u = theta / u.len().max(1) as f64;
    let xi_p = 1.0 - theta;
    let (dg, dpg) = match prev {
        Some(t) => (t.u.clone(), t.p),
        None => (u.zero_like(), 1.0),
    };

    let zero = u.zero_like();
    let (tu, tp) = bls.solve(&jac, &dfdp, &dg, dpg, xi_u, xi_p, &zero, 1.0, None)?;
    let mut tau = BorderedPair::new(tu, tp);

    let flip = match prev {
        Some(t) if t.p != 0.0 => tau.p * t.p < 0.0,
        Some(t) => dot_theta(&tau, t, theta, custom) < 0.0,
        None => tau.p < 0.0,
    };
    if flip {
        tau.scale(-1.0);
    }

    let n = norm_theta(&tau, theta, custom);
    if !(n.is_finite() && n > 0.0) {
        return Err(Error::Linear {
            what: "degenerate bordered tangent".into(),
        });
    }
    tau.scale(1.0 / n);
    Ok(tau)
}

/// Tangent refresh after a confirmed step, per predictor.
#[allow(clippy::too_many_arguments)]
pub fn update_tangent<S, BS>(
    kind: Predictor,
    field: &S,
    bls: &BS,
    z_new: &BorderedPair<S::State>,
    z_old: &BorderedPair<S::State>,
    tau_old: &BorderedPair<S::State>,
    ds: f64,
    theta: f64,
    fin_diff_eps: f64,
    custom: Option<StateDot<'_, S::State>>,
) -> Result<BorderedPair<S::State>>
where
    S: VectorField,
    BS: BorderedSolver<S::State, S::Jacobian>,
{
    match kind {
        // Unnormalized chord; the natural predictor keeps stepping in p only.
        Predictor::Natural => Ok(z_new.minus(z_old)),
        Predictor::Secant => secant_tangent(z_new, z_old, ds, theta, custom),
        Predictor::BorderedTangent => bordered_tangent(
            field,
            bls,
            &z_new.u,
            z_new.p,
            theta,
            fin_diff_eps,
            custom,
            Some(tau_old),
        ),
    }
}
