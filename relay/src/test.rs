#![allow(clippy::unwrap_used)]

/// Assert that an expression matches a pattern, with an optional guard.
#[macro_export]
macro_rules! assert_matches {
    ($expr:expr, $pat:pat $(if $guard:expr)? $(,)?) => {
        match $expr {
            $pat $(if $guard)? => {}
            ref other => panic!(
                "assertion failed: `{}` does not match `{}`: {:?}",
                stringify!($expr),
                stringify!($pat $(if $guard)?),
                other
            ),
        }
    };
}
