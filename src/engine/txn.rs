//! The transaction phase machine and transaction identity.
use std::sync::Arc;

/// Transactional phase of a connection, overlaid on the session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxPhase {
    /// No transaction open or pending.
    #[default]
    None,
    /// `BEGIN` issued, its completion not yet observed.
    StartPending,
    /// `BEGIN` completed, the transaction is open.
    Active,
    /// `COMMIT` issued, its completion not yet observed.
    CommitPending,
    /// `ROLLBACK` issued, its completion not yet observed.
    RollbackPending,
}

/// Events observed by the phase machine. `CommandComplete` is reused to
/// watch the completion of `BEGIN`, `COMMIT` and `ROLLBACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEvent {
    Start,
    Commit,
    Rollback,
    CommandComplete,
}

impl TxPhase {
    /// Pure transition table; `None` for an event the phase rejects.
    pub fn apply(self, event: TxEvent) -> Option<TxPhase> {
        Some(match (self, event) {
            (Self::None, TxEvent::Start) => Self::StartPending,
            (Self::StartPending, TxEvent::CommandComplete) => Self::Active,
            (Self::Active, TxEvent::Commit) => Self::CommitPending,
            (Self::Active, TxEvent::Rollback) => Self::RollbackPending,
            (Self::CommitPending | Self::RollbackPending, TxEvent::CommandComplete) => Self::None,
            _ => return None,
        })
    }
}

/// Opaque identity of one transaction.
///
/// Submissions tagged with the active handle run inside the transaction;
/// everything else waits in the deferred queue until it ends. Equality is
/// reference identity.
#[derive(Debug, Clone)]
pub struct TxHandle(Arc<()>);

impl TxHandle {
    pub(crate) fn new() -> Self {
        Self(Arc::new(()))
    }
}

impl PartialEq for TxHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TxHandle {}
