//! Load config from file and environment.

use std::path::PathBuf;

use serde::Deserialize;

/// Agent configuration. File: ~/.config/gamedock/agent.toml.
/// Env overrides: GAMEDOCK_NAME, GAMEDOCK_PORT, GAMEDOCK_INSTALL_DIR,
/// GAMEDOCK_SHORTCUTS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name advertised over mDNS (default: system hostname).
    #[serde(default = "default_name")]
    pub name: String,
    /// WebSocket listen port (default 48653; 0 binds an ephemeral port and
    /// advertises whatever was actually bound).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root directory game uploads land under.
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    /// Path to the library's shortcut database.
    #[serde(default = "default_shortcuts_path")]
    pub shortcuts_path: PathBuf,
    /// Refuse new Hub connections without forgetting paired ones.
    #[serde(default = "default_accept_connections")]
    pub accept_connections: bool,
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "gamedock-agent".to_string())
}

fn default_port() -> u16 {
    48653
}

fn default_install_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gamedock")
        .join("games")
}

fn default_shortcuts_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gamedock")
        .join("shortcuts.vdf")
}

fn default_accept_connections() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: default_port(),
            install_dir: default_install_dir(),
            shortcuts_path: default_shortcuts_path(),
            accept_connections: default_accept_connections(),
        }
    }
}

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("GAMEDOCK_NAME") {
        if !s.is_empty() {
            c.name = s;
        }
    }
    if let Ok(s) = std::env::var("GAMEDOCK_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("GAMEDOCK_INSTALL_DIR") {
        if !s.is_empty() {
            c.install_dir = PathBuf::from(s);
        }
    }
    if let Ok(s) = std::env::var("GAMEDOCK_SHORTCUTS") {
        if !s.is_empty() {
            c.shortcuts_path = PathBuf::from(s);
        }
    }
    c
}

fn load_file() -> Option<Config> {
    let path = dirs::config_dir()?.join("gamedock").join("agent.toml");
    let text = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!("ignoring malformed agent.toml: {e}");
            None
        }
    }
}

/// Directory for the trust store and self-identity files.
pub fn state_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gamedock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.port, 48653);
        assert!(c.accept_connections);
        assert!(!c.name.is_empty());
    }

    #[test]
    fn toml_overrides_defaults() {
        let c: Config = toml::from_str(
            r#"
            name = "deck-1"
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(c.name, "deck-1");
        assert_eq!(c.port, 9000);
        assert!(c.accept_connections);
    }
}
