//! Logging macros that tag every line with the node and the thread it was
//! emitted from, e.g. `(n0|server-s0.1)`.

use std::sync::OnceLock;
use std::thread;

use env_logger::Env;

/// Node identity string used as the logging prefix, e.g. `n0`. Set once by
/// the engine at construction time.
pub static ME: OnceLock<String> = OnceLock::new();

/// Prefix of the calling thread's log lines.
#[doc(hidden)]
pub fn log_tag() -> String {
    let me = ME.get().map_or("-", |me| me.as_str());
    match thread::current().name() {
        Some(name) => format!("{}|{}", me, name),
        None => me.to_string(),
    }
}

/// Log at the given `log::Level` with the node and thread tag.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($level:expr, $($fmt_args:tt)*) => {
        log::log!(
            $level,
            "({}) {}",
            $crate::log_tag(),
            format!($($fmt_args)*)
        )
    };
}

/// Log TRACE message with the node and thread tag.
///
/// Example:
/// ```no_compile
/// pf_trace!("dispatching {:?}", msg.meta);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Trace, $($fmt_args)*)
    };
}

/// Log DEBUG message with the node and thread tag.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Debug, $($fmt_args)*)
    };
}

/// Log INFO message with the node and thread tag.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Info, $($fmt_args)*)
    };
}

/// Log WARN message with the node and thread tag.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Warn, $($fmt_args)*)
    };
}

/// Log ERROR message with the node and thread tag.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!(log::Level::Error, $($fmt_args)*)
    };
}

/// Set up `env_logger` with an `info` default filter. Later calls are
/// no-ops.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Logs at ERROR level, then evaluates to an `Err(ParasyncError)` carrying
/// the same text. A leading `Variant;` picks a string-carrying variant
/// other than `Msg`.
///
/// Example:
/// ```no_compile
/// return logged_err!(IdMap; "no free worker slot on node {}", node);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($kind:ident; $($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::ParasyncError::$kind(format!($($fmt_args)*)))
        }
    };

    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::ParasyncError::msg(format!($($fmt_args)*)))
        }
    };
}

#[cfg(test)]
mod print_tests {
    use super::*;
    use crate::utils::ParasyncError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("slot exhausted"),
            Err::<(), ParasyncError>(ParasyncError::msg("slot exhausted"))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("key {} outside all ranges", 777),
            Err::<(), ParasyncError>(ParasyncError::msg(
                "key 777 outside all ranges"
            ))
        );
    }

    #[test]
    fn error_with_kind() {
        assert_eq!(
            logged_err!(IdMap; "no free helper on node {}", 2),
            Err::<(), ParasyncError>(ParasyncError::IdMap(
                "no free helper on node 2".into()
            ))
        );
    }

    #[test]
    fn tag_names_thread() -> Result<(), ParasyncError> {
        let tag = thread::Builder::new()
            .name("worker-w0.3".into())
            .spawn(log_tag)?
            .join()
            .map_err(|_| ParasyncError::msg("tag thread panicked"))?;
        assert!(tag.ends_with("|worker-w0.3"));
        Ok(())
    }
}
