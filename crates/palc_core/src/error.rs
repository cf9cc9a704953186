use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine-level failures. Convergence and bordering failures are recoverable
/// at the step level (the iterator halves `ds` and retries); everything else
/// terminates the iteration and surfaces to the caller.
#[derive(Error, Debug)]
pub enum Error {
    #[error("newton failed to converge in {context} ({iterations} iterations, residual {residual:.3e})")]
    Convergence {
        context: &'static str,
        iterations: usize,
        residual: f64,
    },

    #[error("bordering solve singular: |denominator| = {denom:.3e} < {epsilon:.3e}")]
    BorderedSingular { denom: f64, epsilon: f64 },

    #[error("linear solve failed: {what}")]
    Linear { what: String },

    #[error("eigensolver failed: {info}")]
    Eigen { info: String },

    #[error("invalid continuation parameters: {what}")]
    InvalidConfig { what: String },

    /// Failure raised inside a user-supplied residual, Jacobian or hook.
    #[error(transparent)]
    Problem(#[from] anyhow::Error),
}

impl Error {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Convergence { .. } | Error::BorderedSingular { .. }
        )
    }
}
