use std::env;
use std::path::PathBuf;

use crate::protocol::DEFAULT_PORT;

/// Server-side configuration, loaded from `MIRAGE_*` environment
/// variables with CLI flags layered on top.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the control connection.
    pub bind: String,
    /// Shared token clients must present. Generated when absent.
    pub auth_token: Option<String>,
    /// VM name reported in `auth-ok`.
    pub vm_name: String,
    /// Address of the VM's display, forwarded to attached viewers.
    pub display: String,
    /// Cache driver stat directory for startup progress.
    pub chunk_stats: Option<PathBuf>,
    /// Image URL to preflight for range support before serving.
    pub image_url: Option<String>,
    pub max_mouse_rate: u32,
    pub server_timeout_min: u64,
    pub server_timeout_max: u64,
    /// Ask clients to verify the display after a resumed startup.
    pub check_display: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env::var("MIRAGE_BIND").unwrap_or(defaults.bind),
            auth_token: env::var("MIRAGE_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            vm_name: env::var("MIRAGE_VM_NAME").unwrap_or(defaults.vm_name),
            display: env::var("MIRAGE_DISPLAY").unwrap_or(defaults.display),
            chunk_stats: env::var("MIRAGE_CHUNK_STATS").ok().map(PathBuf::from),
            image_url: env::var("MIRAGE_IMAGE_URL").ok().filter(|u| !u.is_empty()),
            max_mouse_rate: parse_env("MIRAGE_MAX_MOUSE_RATE", defaults.max_mouse_rate),
            server_timeout_min: parse_env("MIRAGE_TIMEOUT_MIN", defaults.server_timeout_min),
            server_timeout_max: parse_env("MIRAGE_TIMEOUT_MAX", defaults.server_timeout_max),
            check_display: env::var("MIRAGE_CHECK_DISPLAY")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.check_display),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            auth_token: None,
            vm_name: "vm".to_string(),
            display: "127.0.0.1:5900".to_string(),
            chunk_stats: None,
            image_url: None,
            max_mouse_rate: 30,
            server_timeout_min: 60,
            server_timeout_max: 300,
            check_display: false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::sync::{LazyLock, Mutex};

    use super::*;

    // Environment tests share process-global state.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_without_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        for var in ["MIRAGE_BIND", "MIRAGE_AUTH_TOKEN", "MIRAGE_MAX_MOUSE_RATE"] {
            env::remove_var(var);
        }
        let config = Config::from_env();
        assert_eq!(config.bind, format!("0.0.0.0:{DEFAULT_PORT}"));
        assert_eq!(config.auth_token, None);
        assert_eq!(config.max_mouse_rate, 30);
    }

    #[test]
    fn environment_overrides_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("MIRAGE_BIND", "127.0.0.1:9000");
        env::set_var("MIRAGE_MAX_MOUSE_RATE", "15");
        let config = Config::from_env();
        assert_eq!(config.bind, "127.0.0.1:9000");
        assert_eq!(config.max_mouse_rate, 15);
        env::remove_var("MIRAGE_BIND");
        env::remove_var("MIRAGE_MAX_MOUSE_RATE");
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::set_var("MIRAGE_TIMEOUT_MIN", "soon");
        let config = Config::from_env();
        assert_eq!(config.server_timeout_min, 60);
        env::remove_var("MIRAGE_TIMEOUT_MIN");
    }
}
