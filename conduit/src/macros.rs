//! Macros for conduit error handling.
//!
//! Provides convenience macros for creating and returning [`crate::error::ConduitError`]
//! instances with reduced boilerplate.

/// Creates a [`crate::error::ConduitError`] from error kind and description.
///
/// Accepts an optional detail, anything implementing [`ToString`], and an optional source
/// error.
#[macro_export]
macro_rules! conduit_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::ConduitError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, source: $source:expr) => {
        $crate::error::ConduitError::from(($kind, $desc)).with_source($source)
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::ConduitError::from(($kind, $desc, $detail.to_string()))
    };
    ($kind:expr, $desc:expr, $detail:expr, source: $source:expr) => {
        $crate::error::ConduitError::from(($kind, $desc, $detail.to_string()))
            .with_source($source)
    };
}

/// Creates and returns a [`crate::error::ConduitError`] from the current function.
///
/// Accepts the same optional detail as [`conduit_error!`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return ::core::result::Result::Err($crate::conduit_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return ::core::result::Result::Err($crate::conduit_error!($kind, $desc, $detail))
    };
}
