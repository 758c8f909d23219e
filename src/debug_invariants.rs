//! Local invariant checks for mesh structures.
//!
//! `validate_invariants` is always available. `debug_assert_invariants` only
//! checks in debug builds or with the `check-invariants` feature, and
//! panics on the first broken invariant.

use crate::mesh_error::MeshError;

pub trait DebugInvariants {
    /// First broken invariant, if any.
    fn validate_invariants(&self) -> Result<(), MeshError>;

    /// Panic on a broken invariant when checking is enabled.
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), std::any::type_name::<Self>());
    }
}

/// Run a `Result`-returning check and panic with `context` on error, when
/// invariant checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($check:expr, $context:expr) => {
        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        if let Err(err) = $check {
            panic!("[invariants] {}: {}", $context, err);
        }
    };
}
