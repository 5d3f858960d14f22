use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Closed enumeration of order states; the SQL `state` column stores its `Display` form.
///
/// Diverges from the teacher's typestate-per-struct pattern on purpose: transitions here are
/// driven by runtime API input (not known at compile time), so a table over a plain enum fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    AwaitingDeposit,
    EscrowFunded,
    Signing,
    RbfSigning,
    Completed,
    Refunded,
    Dispute,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Completed | OrderState::Refunded | OrderState::Dispute
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::AwaitingDeposit => "awaiting_deposit",
            OrderState::EscrowFunded => "escrow_funded",
            OrderState::Signing => "signing",
            OrderState::RbfSigning => "rbf_signing",
            OrderState::Completed => "completed",
            OrderState::Refunded => "refunded",
            OrderState::Dispute => "dispute",
        };
        write!(f, "{s}")
    }
}

impl FromStr for OrderState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_deposit" => Ok(OrderState::AwaitingDeposit),
            "escrow_funded" => Ok(OrderState::EscrowFunded),
            "signing" => Ok(OrderState::Signing),
            "rbf_signing" => Ok(OrderState::RbfSigning),
            "completed" => Ok(OrderState::Completed),
            "refunded" => Ok(OrderState::Refunded),
            "dispute" => Ok(OrderState::Dispute),
            other => Err(AppError::Validation(format!("unknown order state: {other}"))),
        }
    }
}

/// The transition table from SPEC_FULL.md §4.3. `rbf_signing`'s "previous state" exit is not
/// representable as a fixed `(from, to)` pair here; `clear_rbf` in the store restores it directly
/// rather than going through `allowed`.
pub fn allowed(from: OrderState, to: OrderState) -> bool {
    use OrderState::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (AwaitingDeposit, EscrowFunded)
            | (EscrowFunded, Signing)
            | (EscrowFunded, Dispute)
            | (Signing, Completed)
            | (Signing, Refunded)
            | (Signing, Dispute)
    )
}

/// Entering `escrow_funded` or `signing` stamps a fresh signing deadline; every other transition
/// clears it.
pub fn deadline_applies(to: OrderState) -> bool {
    matches!(to, OrderState::EscrowFunded | OrderState::Signing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderState::*;

    #[test]
    fn happy_path_transitions_allowed() {
        assert!(allowed(AwaitingDeposit, EscrowFunded));
        assert!(allowed(EscrowFunded, Signing));
        assert!(allowed(Signing, Completed));
        assert!(allowed(Signing, Refunded));
    }

    #[test]
    fn dispute_reachable_from_escrow_funded_and_signing() {
        assert!(allowed(EscrowFunded, Dispute));
        assert!(allowed(Signing, Dispute));
    }

    #[test]
    fn same_state_is_allowed_as_a_refresh() {
        assert!(allowed(Signing, Signing));
    }

    #[test]
    fn terminal_states_admit_no_outgoing_transitions() {
        for terminal in [Completed, Refunded, Dispute] {
            for other in [AwaitingDeposit, EscrowFunded, Signing, RbfSigning] {
                assert!(!allowed(terminal, other));
            }
        }
    }

    #[test]
    fn backwards_transitions_are_rejected() {
        assert!(!allowed(EscrowFunded, AwaitingDeposit));
        assert!(!allowed(Signing, EscrowFunded));
        assert!(!allowed(Completed, Signing));
    }

    #[test]
    fn display_and_parse_roundtrip() {
        for state in [
            AwaitingDeposit,
            EscrowFunded,
            Signing,
            RbfSigning,
            Completed,
            Refunded,
            Dispute,
        ] {
            let parsed: OrderState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn deadline_applies_only_to_funded_and_signing() {
        assert!(deadline_applies(EscrowFunded));
        assert!(deadline_applies(Signing));
        assert!(!deadline_applies(Completed));
        assert!(!deadline_applies(AwaitingDeposit));
    }
}
