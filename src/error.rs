use charms_app_runner::RunError;
use charms_data::{TxId, UtxoId};
use thiserror::Error;

/// Why a proving request failed. All of these are terminal for the current
/// request: `ProvingFailed` may be retried by re-running the whole pipeline,
/// the rest need corrected inputs.
#[derive(Debug, Error)]
pub enum ProveError {
    /// The spell is structurally invalid: references a missing app, fails
    /// basic well-formedness, or statically violates conservation.
    #[error("malformed spell: {0}")]
    MalformedSpell(String),

    /// An app ran and rejected the declared transition.
    #[error("app {app} rejected the transition: {reason}")]
    ApplicationRejected { app: String, reason: String },

    /// An app ran out of its instruction budget. A definitive rejection.
    #[error("app {app} exceeded the instruction budget of {budget}")]
    InstructionBudgetExceeded { app: String, budget: u64 },

    /// An app trapped inside the VM.
    #[error("app {app} trapped: {reason}")]
    RuntimeTrap { app: String, reason: String },

    /// A charm payload does not match the shape its app requires.
    /// Reported before any VM execution.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Proof construction failed.
    #[error("proving failed: {0}")]
    ProvingFailed(String),

    /// An input or reference UTXO cannot be resolved against the supplied
    /// previous transactions.
    #[error("cannot resolve input {0} against the supplied previous transactions")]
    UnresolvedInput(UtxoId),

    /// The supplied previous transactions contain the same transaction more
    /// than once.
    #[error("ambiguous binding: previous transaction {0} supplied more than once")]
    AmbiguousBinding(TxId),

    /// The funding UTXO coincides with a spell input or reference.
    #[error("funding utxo {0} overlaps a spell input")]
    OverlapViolation(UtxoId),

    /// The funding UTXO does not cover the outputs and fees.
    #[error("insufficient funds: {required} sats required, {available} sats available")]
    InsufficientFunds { required: u64, available: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RunError> for ProveError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::SchemaMismatch(s) => ProveError::SchemaMismatch(s),
            RunError::BudgetExceeded { app, budget } => ProveError::InstructionBudgetExceeded {
                app: app.to_string(),
                budget,
            },
            RunError::Rejected { app, reason } => ProveError::ApplicationRejected {
                app: app.to_string(),
                reason,
            },
            RunError::Trap { app, reason } => ProveError::RuntimeTrap {
                app: app.to_string(),
                reason,
            },
            RunError::Other(e) => ProveError::Other(e),
        }
    }
}
