//! Built-in logger initialization.
//!
//! When the `builtin_env_logger` feature is enabled (it is part of the
//! default features), the first recycler instance created in a process
//! initializes `env_logger`, controlled by the `RCY_LOG` environment
//! variable. Hosts that install their own `log` implementation should
//! disable the feature; `try_init` failing because a logger is already set
//! is not an error.

/// Attempt to init a env_logger for the recycler.
pub fn try_init() -> Result<(), ()> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::try_init_from_env(
                // By default, use info level logging.
                env_logger::Env::new().filter_or("RCY_LOG", "info"),
            ).map_err(|_| ())
        } else {
            // The buildin env_logger is disabled. Do nothing.
            Ok(())
        }
    }
}
