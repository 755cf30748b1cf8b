//! Explicit transaction-state transition guard, in the same spirit as a
//! hand-rolled stage machine that refuses to advance out of order: every
//! edge the 2PC/clearing lifecycle can take is enumerated, anything else
//! is rejected before it ever reaches storage.

use crate::error::LedgerError;
use crate::model::TransactionState;

/// Validates a single state transition against the lifecycle allowed by
/// spec §3 (Transaction lifecycles) and §4.3/§4.4 (payment/clearing flow).
#[derive(Debug, Clone, Copy)]
pub struct TransactionStateMachine {
    state: TransactionState,
}

impl TransactionStateMachine {
    pub fn new(state: TransactionState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn advance(&mut self, next: TransactionState) -> Result<(), LedgerError> {
        if !Self::allowed(self.state, next) {
            return Err(LedgerError::Conflict(format!(
                "illegal transaction state transition: {} -> {}",
                self.state.as_str(),
                next.as_str()
            )));
        }
        self.state = next;
        Ok(())
    }

    fn allowed(from: TransactionState, to: TransactionState) -> bool {
        use TransactionState::*;
        match (from, to) {
            (New, Routed) => true,
            (New, PrepareInProgress) => true,
            (Routed, PrepareInProgress) => true,
            (PrepareInProgress, Prepared) => true,
            (PrepareInProgress, Aborted) => true,
            (Prepared, Committed) => true,
            (Prepared, Aborted) => true,
            (New, Proposed) => true,
            (Proposed, Waiting) => true,
            (Waiting, Proposed) => true,
            (Proposed, Committed) => true,
            (Waiting, Rejected) => true,
            (New, Aborted) => true,
            (Routed, Aborted) => true,
            // Idempotent no-ops: re-entering the same terminal state is not
            // a transition at all, callers should check this before advance().
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_standard_2pc_path() {
        let mut sm = TransactionStateMachine::new(TransactionState::New);
        sm.advance(TransactionState::PrepareInProgress).unwrap();
        sm.advance(TransactionState::Prepared).unwrap();
        sm.advance(TransactionState::Committed).unwrap();
    }

    #[test]
    fn rejects_committed_to_aborted() {
        let mut sm = TransactionStateMachine::new(TransactionState::Committed);
        let err = sm.advance(TransactionState::Aborted).unwrap_err();
        assert!(err.to_string().contains("illegal transaction state transition"));
    }

    #[test]
    fn rejects_skipping_prepared() {
        let mut sm = TransactionStateMachine::new(TransactionState::New);
        assert!(sm.advance(TransactionState::Committed).is_err());
    }
}
