//! Runtime invariant checks with contract-test bookkeeping
//!
//! Pipeline code asserts its invariants through [`assert_invariant!`]; every
//! checked message is remembered per thread so a contract test can prove the
//! check actually ran on the path under test.
//!
//! ```rust,ignore
//! assert_invariant!(
//!     gate.is_ready(),
//!     "Container starts only after every expected track is registered",
//!     "MuxerGate::begin_if_ready"
//! );
//!
//! contract_test("muxer gate", &[
//!     "Container starts only after every expected track is registered",
//! ]);
//! ```

use std::cell::RefCell;
use std::collections::HashSet;
use std::thread_local;

/// Container writer start happens only once all expected tracks are known
pub const GATE_START_REQUIRES_TRACKS: &str =
    "Container starts only after every expected track is registered";
/// No sample reaches the writer before the gate opens
pub const NO_WRITE_BEFORE_START: &str = "No sample is written before the container starts";
/// Written timestamps never go backwards within a track
pub const TRACK_PTS_NON_DECREASING: &str = "Written timestamps are non-decreasing per track";
/// First written sample of a track carries timestamp zero
pub const FIRST_PTS_IS_ZERO: &str = "First written timestamp of a track is zero";
/// The writer is finished at most once
pub const FINISH_AT_MOST_ONCE: &str = "Container writer is finished at most once";
/// Mixed audio never outruns the slower device
pub const MIX_BOUNDED_BY_SLOWER_SOURCE: &str = "Mixed frame count is the minimum of both reads";

thread_local! {
    static INVARIANT_LOG: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

/// Assert an invariant and log it for contract testing.
///
/// # Panics
/// Panics if the condition is false.
#[macro_export]
macro_rules! assert_invariant {
    ($condition:expr, $message:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, None)
    };
    ($condition:expr, $message:expr, $context:expr) => {
        $crate::invariant_ppt::__assert_invariant_impl($condition, $message, Some($context))
    };
}

#[doc(hidden)]
pub fn __assert_invariant_impl(condition: bool, message: &str, context: Option<&str>) {
    INVARIANT_LOG.with(|log| {
        log.borrow_mut().insert(message.to_string());
    });

    if !condition {
        let ctx = context.unwrap_or("unknown");
        panic!("INVARIANT VIOLATION [{}]: {}", ctx, message);
    }
}

/// Whether `message` was checked on the current thread since the last clear
pub fn invariant_checked(message: &str) -> bool {
    INVARIANT_LOG.with(|log| log.borrow().contains(message))
}

/// Check that specific invariants were verified on this thread.
///
/// # Panics
/// Panics listing every required invariant that was never checked.
pub fn contract_test(test_name: &str, required_invariants: &[&str]) {
    let missing: Vec<&str> = required_invariants
        .iter()
        .copied()
        .filter(|inv| !invariant_checked(inv))
        .collect();

    if !missing.is_empty() {
        panic!(
            "CONTRACT FAILURE [{}]: The following invariants were not checked:\n  - {}",
            test_name,
            missing.join("\n  - ")
        );
    }
}

/// Clear the invariant log for the current thread
pub fn clear_invariant_log() {
    INVARIANT_LOG.with(|log| {
        log.borrow_mut().clear();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_invariant_satisfies_contract() {
        clear_invariant_log();
        assert_invariant!(true, FINISH_AT_MOST_ONCE, "test");
        contract_test("finish", &[FINISH_AT_MOST_ONCE]);
    }

    #[test]
    #[should_panic(expected = "CONTRACT FAILURE")]
    fn test_unchecked_invariant_fails_contract() {
        clear_invariant_log();
        contract_test("gate", &[GATE_START_REQUIRES_TRACKS]);
    }

    #[test]
    #[should_panic(expected = "INVARIANT VIOLATION [test]")]
    fn test_violation_panics_with_context() {
        assert_invariant!(false, NO_WRITE_BEFORE_START, "test");
    }
}
