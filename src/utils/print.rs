//! Helper macros for logging (console printing).

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # use shardset::pf_trace;
/// # let id = 0;
/// # let msg = "x";
/// pf_trace!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $fmt_str:literal) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # use shardset::pf_debug;
/// # let id = 0;
/// # let msg = "x";
/// pf_debug!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $fmt_str:literal) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # use shardset::pf_info;
/// # let id = 0;
/// # let msg = "x";
/// pf_info!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $fmt_str:literal) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # use shardset::pf_warn;
/// # let id = 0;
/// # let msg = "x";
/// pf_warn!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $fmt_str:literal) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// # use shardset::pf_error;
/// # let id = 0;
/// # let msg = "x";
/// pf_error!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $fmt_str:literal) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `ShardsetError`
/// containing the string.
///
/// Example:
/// ```no_run
/// # use shardset::{logged_err, pf_error};
/// # let id = 0;
/// # let msg = "x";
/// let e: Result<(), shardset::ShardsetError> = logged_err!(id; "got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {{
        pf_error!($prefix; $fmt_str);
        Err($crate::ShardsetError(format!(
            concat!("({}) ", $fmt_str),
            $prefix
        )))
    }};

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {{
        pf_error!($prefix; $fmt_str, $($fmt_arg)*);
        Err($crate::ShardsetError(format!(
            concat!("({}) ", $fmt_str),
            $prefix,
            $($fmt_arg)*
        )))
    }};
}
