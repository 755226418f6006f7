//! Confirmation gate.
//!
//! Decides whether a tracked success deposit has enough network
//! confirmations for its funds to be moved.

use crate::types::Deposit;

/// `false` only while the deposit still reports fewer confirmations than
/// its unlock threshold. Missing confirmation data (`0/0`) or a zero
/// threshold releases immediately.
pub fn is_release_ready(deposit: &Deposit) -> bool {
    let (current, required) = deposit.current_confirmation();
    !(required > 0 && deposit.unlock_confirm > 0 && current < deposit.unlock_confirm)
}
