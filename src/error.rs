use thiserror::Error;

use crate::state::{ControllerPhase, Unit};
use crate::types::Float;

pub type Result<T> = std::result::Result<T, ControlError>;

/// Error taxonomy of the control core.
///
/// Fatal kinds (phase violations, size mismatches, non-finite outputs,
/// indefinite inertia) are surfaced to the host and latch the controller;
/// the remaining kinds are recovered locally by the tick and logged.
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    #[error("unit {unit:?} may not be written during {phase:?}")]
    PhaseViolation { unit: Unit, phase: ControllerPhase },

    #[error("phase {from:?} cannot transition to {to:?}")]
    PhaseTransition {
        from: ControllerPhase,
        to: ControllerPhase,
    },

    #[error("missized dofs in {id}: internal={expected}, provided={got}")]
    DofMismatch {
        id: String,
        expected: usize,
        got: usize,
    },

    #[error("variable {0:?} not found in data")]
    KeyNotFound(String),

    #[error("variable {key:?} was requested as '{expected}' but is actually '{got}'")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("unknown id {0:?}")]
    UnknownId(String),

    #[error("inverse kinematics diverged on {eef}: residual {residual} at iteration cap")]
    IkDivergence { eef: String, residual: Float },

    #[error("Lemke failed at maximum regularization")]
    LcpUnsolvable,

    #[error("inverse-dynamics solve exceeded its wall budget")]
    DeadlineExceeded,

    #[error("non-finite value in {0}")]
    NumericFailure(&'static str),

    #[error("generalized inertia is not positive definite")]
    SingularInertia,

    #[error("no admissible friction coefficient for the observed impulses")]
    InfeasibleFriction,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ControlError {
    /// True for kinds the tick may not recover from locally.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ControlError::IkDivergence { .. }
                | ControlError::LcpUnsolvable
                | ControlError::DeadlineExceeded
                | ControlError::InfeasibleFriction
        )
    }
}
