//! Apply-pass correlation.
//!
//! Every apply pass runs inside a span carrying a fresh `apply_id`, so the
//! log lines of concurrent reloads and their provider tasks can be told apart.

use uuid::Uuid;

/// Generate a new apply ID.
pub fn new_apply_id() -> Uuid {
    Uuid::new_v4()
}

/// Span wrapping one apply pass.
pub fn apply_span(apply_id: Uuid, force: bool) -> ::tracing::Span {
    ::tracing::info_span!("apply", apply_id = %apply_id, force)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_ids_are_unique() {
        assert_ne!(new_apply_id(), new_apply_id());
    }
}
