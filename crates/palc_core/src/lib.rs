//! The `palc_core` crate implements pseudo-arclength continuation of
//! parameter-dependent nonlinear problems `F(x, p) = 0`, with bifurcation
//! detection and extended-system solvers for fold points, Hopf points and
//! periodic orbits.
//!
//! Key components:
//! - **Algebra**: `BranchVector` (state-type abstraction), `BorderedPair`
//!   (state + parameter aggregates) and the weighted arclength metric.
//! - **Solvers**: `LinearSolver`/`EigenSolver` interfaces with dense
//!   defaults, the three bordered-system strategies, and a damped Newton
//!   with deflation.
//! - **Continuation**: the predictor/corrector iterator with step and angle
//!   control, stability bookkeeping and bisection-based localization.
//! - **Periodic orbits**: trapezoidal and shooting functionals with their
//!   Floquet monodromy operators.

pub mod algebra;
pub mod bordered;
pub mod continuation;
pub mod error;
pub mod flow;
pub mod linear;
pub mod newton;
pub mod periodic;
pub mod predictor;
pub mod system;

pub use algebra::{dot_theta, norm_theta, BorderedPair, BranchVector};
pub use bordered::{BorderedSolver, BorderingBls, FullMatrixBls, MatrixFreeBls};
pub use continuation::{
    continuation, jacobian_spectrum, BifPoint, BifStatus, BifurcationKind, BranchRecord,
    ContIterator, ContinuationOutcome, ContinuationParams, Hooks, IterState, SpectrumFn,
    StabilityRule, StopReason,
};
pub use error::{Error, Result};
pub use linear::{DenseEigen, DenseLu, EigenDecomp, EigenSolver, EigenWhich, JacOp, LinearSolver};
pub use newton::{newton, newton_deflated, DeflationOperator, NewtonOutcome, NewtonParams};
pub use predictor::Predictor;
pub use system::{FdSystem, FnSystem, TwoParamField, VectorField};
