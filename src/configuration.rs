//! Config for the battle engine behaviors
//!
//! This module provides configuration options for controlling the behavior of a tournament run.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! The following environment variables can be used to override configuration values. All
//! values are optional, and case-insensitive. Set the value to `"true"` to enable a flag.
//!
//! - `BATTLE_VERBOSE` — Print battle progress to stdout (default: `true`)
//! - `BATTLE_LOG` — Enable logging to a file (default: `false`)
//! - `BATTLE_ALLOW_UNCONTAINED` — Run programs without cgroups if they are not available (default: `false`)
//! - `BATTLE_DEBUG_STDERR` — Forward team programs' stderr to the log (default: `false`)
//! - `BATTLE_RETAIN_PAYLOADS` — Keep instances and certificates in round outcomes (default: `false`)
//! - `BATTLE_SEED` — Base seed used to derive every round seed (default: `0`)

/// Configuration for tournament behaviors.
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) debug_stderr: bool,
    pub(crate) retain_payloads: bool,
    pub(crate) seed: u64,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Battle progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - Uncontained fallbacks (running without cgroups) are not allowed.
    /// - Team programs' stderr is discarded.
    /// - Instances and certificates are dropped once validated.
    /// - The base seed is `0`.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            allow_uncontained: false,
            debug_stderr: false,
            retain_payloads: false,
            seed: 0,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// The recognized variables are listed in the [module documentation](self). Any flag value
    /// other than `"true"` (including unset) falls back to the default, and an unparsable
    /// `BATTLE_SEED` is ignored.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        let seed = std::env::var("BATTLE_SEED")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        Self {
            verbose: get_env_flag("BATTLE_VERBOSE", true),
            log: get_env_flag("BATTLE_LOG", false),
            allow_uncontained: get_env_flag("BATTLE_ALLOW_UNCONTAINED", false),
            debug_stderr: get_env_flag("BATTLE_DEBUG_STDERR", false),
            retain_payloads: get_env_flag("BATTLE_RETAIN_PAYLOADS", false),
            seed,
        }
    }

    /// Enable or disable progress output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Enable or disable uncontained fallbacks.
    ///
    /// When enabled and cgroups v2 is not usable, programs still run but only time and
    /// sampled-memory limits are enforced.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable forwarding of programs' stderr to the log (debug purposes only).
    pub fn with_debug_stderr(mut self, value: bool) -> Self {
        self.debug_stderr = value;
        self
    }

    /// Keep generated instances and certificates inside each round outcome, for audit.
    pub fn with_retain_payloads(mut self, value: bool) -> Self {
        self.retain_payloads = value;
        self
    }

    /// Base seed from which all round seeds are derived.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Whether programs may run without cgroup containment.
    pub fn allow_uncontained(&self) -> bool {
        self.allow_uncontained
    }

    /// Whether programs' stderr is forwarded to the log.
    pub fn debug_stderr(&self) -> bool {
        self.debug_stderr
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
