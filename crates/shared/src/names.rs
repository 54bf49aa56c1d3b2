//! Pool naming scheme shared by the orchestrator and the hypervisor sweeper.
//!
//! The pool owns exactly the names of the form `<prefix><digits>`. Anything
//! else sharing the prefix (templates, hand-made VMs like `runner-basic`)
//! must never be touched.

/// True when `candidate` is `prefix` followed by one or more ASCII digits.
pub fn is_pool_member(prefix: &str, candidate: &str) -> bool {
    match candidate.strip_prefix(prefix) {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Name of the slot with the given 1-based ordinal.
pub fn slot_name(prefix: &str, ordinal: usize) -> String {
    format!("{prefix}{ordinal}")
}
