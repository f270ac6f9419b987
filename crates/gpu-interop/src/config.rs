//! Runtime configuration.

use std::time::Duration;

use ash::vk;
use glvk_procs::ProcDebugOptions;
use tracing::warn;

/// Default bound on a layout-transition fence wait.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(1);

pub const FENCE_TIMEOUT_ENV: &str = "GLVK_FENCE_TIMEOUT_MS";
pub const LOG_GL_CALLS_ENV: &str = "GLVK_LOG_GL_CALLS";
pub const CHECK_GL_ERRORS_ENV: &str = "GLVK_CHECK_GL_ERRORS";
pub const ENFORCE_ONE_THREAD_ENV: &str = "GLVK_ENFORCE_ONE_THREAD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteropConfig {
    /// How long a layout transition may take before the frame is dropped.
    pub fence_timeout: Duration,
    /// Diagnostics applied to every GL entry point.
    pub debug: ProcDebugOptions,
    /// Format of the shared texture. Must have a GL counterpart, see
    /// [`crate::bridge::gl_internal_format`].
    pub format: vk::Format,
}

impl Default for InteropConfig {
    fn default() -> Self {
        Self {
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            debug: ProcDebugOptions::default(),
            format: vk::Format::R8G8B8A8_UNORM,
        }
    }
}

impl InteropConfig {
    /// Defaults overridden by `GLVK_*` environment variables. Unparsable
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup(FENCE_TIMEOUT_ENV) {
            match value.trim().parse::<u64>() {
                Ok(ms) => config.fence_timeout = Duration::from_millis(ms),
                Err(_) => warn!("Ignoring {FENCE_TIMEOUT_ENV}={value:?}: expected milliseconds"),
            }
        }

        let flags = [
            (LOG_GL_CALLS_ENV, &mut config.debug.log_calls),
            (CHECK_GL_ERRORS_ENV, &mut config.debug.check_errors),
            (ENFORCE_ONE_THREAD_ENV, &mut config.debug.enforce_one_thread),
        ];
        for (key, flag) in flags {
            let Some(value) = lookup(key) else {
                continue;
            };
            match parse_flag(&value) {
                Some(enabled) => *flag = enabled,
                None => warn!("Ignoring {key}={value:?}: expected 0/1/true/false"),
            }
        }

        config
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> InteropConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        InteropConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config_from(&[]), InteropConfig::default());
        assert_eq!(InteropConfig::default().fence_timeout, Duration::from_secs(1));
    }

    #[test]
    fn overrides() {
        let config = config_from(&[
            (FENCE_TIMEOUT_ENV, "250"),
            (LOG_GL_CALLS_ENV, "true"),
            (CHECK_GL_ERRORS_ENV, "0"),
            (ENFORCE_ONE_THREAD_ENV, "off"),
        ]);
        assert_eq!(config.fence_timeout, Duration::from_millis(250));
        assert!(config.debug.log_calls);
        assert!(!config.debug.check_errors);
        assert!(!config.debug.enforce_one_thread);
    }

    #[test]
    fn bad_values_are_ignored() {
        let config = config_from(&[(FENCE_TIMEOUT_ENV, "soon"), (LOG_GL_CALLS_ENV, "maybe")]);
        assert_eq!(config, InteropConfig::default());
    }
}
