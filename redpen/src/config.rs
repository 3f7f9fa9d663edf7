//! Server configuration.
//!
//! Layered in this order, later layers winning: built-in defaults, the TOML
//! config file, environment variables, command-line flags. A missing or
//! unparsable config file is a soft failure; the server still starts on
//! defaults.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use redpen_core::WatchConfig;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_TARGET: &str = "default";

/// Name of the target-directory override variable.
pub const ENV_TARGET_DIR: &str = "REDPEN_TARGET_DIR";
/// Name of the tmux session override variable.
pub const ENV_TMUX_SESSION: &str = "REDPEN_TMUX_SESSION";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: SocketAddr,
    /// Prefix of the agent's tmux session; the full name is
    /// `<tmux_session>-agent-<target>`.
    pub tmux_session: String,
    pub tmux_enabled: bool,
    pub debounce_ms: u64,
    pub keepalive_secs: u64,
    /// Reviewable roots by name. Iteration order decides the default target.
    pub targets: BTreeMap<String, PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4477)),
            tmux_session: "redpen".to_owned(),
            tmux_enabled: true,
            debounce_ms: 300,
            keepalive_secs: 30,
            targets: BTreeMap::new(),
        }
    }
}

/// Returns the path to the redpen config file.
///
/// Prefers `$XDG_CONFIG_HOME/redpen/config.toml`; falls back to
/// `~/.config/redpen/config.toml` when the env var is absent.
pub fn config_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
        .unwrap_or_else(|| PathBuf::from(".config"));
    base.join("redpen").join("config.toml")
}

impl Config {
    /// Loads the config file at `path`.
    ///
    /// Returns defaults if the file does not exist or cannot be parsed. Never
    /// fails; problems are logged.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "config file unreadable, using defaults");
                return Self::default();
            }
        };
        Self::parse(&raw).unwrap_or_else(|err| {
            warn!(path = %path.display(), %err, "config parse error, using defaults");
            Self::default()
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_TARGET_DIR).filter(|v| !v.trim().is_empty()) {
            self.targets.insert(DEFAULT_TARGET.to_owned(), PathBuf::from(dir));
        }
        if let Some(session) = lookup(ENV_TMUX_SESSION).filter(|v| !v.trim().is_empty()) {
            self.tmux_session = session;
        }
    }

    /// Makes relative target directories absolute against `cwd`, and falls
    /// back to `cwd` itself when no target is configured.
    pub fn finalize(&mut self, cwd: &Path) {
        if self.targets.is_empty() {
            self.targets.insert(DEFAULT_TARGET.to_owned(), cwd.to_path_buf());
        }
        for dir in self.targets.values_mut() {
            if dir.is_relative() {
                *dir = cwd.join(&*dir);
            }
        }
    }

    /// Looks up a target by name; `None` picks the first configured target.
    pub fn target(&self, name: Option<&str>) -> Option<(&str, &Path)> {
        match name.filter(|n| !n.is_empty()) {
            Some(name) => self
                .targets
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v.as_path())),
            None => self
                .targets
                .iter()
                .next()
                .map(|(k, v)| (k.as_str(), v.as_path())),
        }
    }

    pub fn target_names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            ..WatchConfig::default()
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

/// Parses a `NAME=DIR` target flag.
pub fn parse_target_arg(raw: &str) -> Result<(String, PathBuf), String> {
    let (name, dir) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=DIR, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() || dir.trim().is_empty() {
        return Err(format!("expected NAME=DIR, got {raw:?}"));
    }
    Ok((name.to_owned(), PathBuf::from(dir.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
        assert_eq!(Config::default().bind.to_string(), "127.0.0.1:4477");
    }

    #[test]
    fn parses_targets_and_overrides() {
        let cfg = Config::parse(
            r#"
bind = "127.0.0.1:9000"
debounce_ms = 150
tmux_enabled = false

[targets]
web = "/srv/web"
api = "services/api"
"#,
        )
        .unwrap();
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.watch_config().debounce, Duration::from_millis(150));
        assert!(!cfg.tmux_enabled);
        assert_eq!(cfg.tmux_session, "redpen");
        assert_eq!(cfg.target_names(), vec!["api".to_owned(), "web".to_owned()]);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(Config::parse("bind = [").is_err());
        assert!(Config::parse("debounce_ms = \"soon\"").is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(Config::load(&dir.path().join("absent.toml")), Config::default());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "targets = 7").unwrap();
        assert_eq!(Config::load(&bad), Config::default());
    }

    #[test]
    fn env_overrides_default_target_and_session() {
        let mut cfg = Config::default();
        cfg.apply_env(|key| match key {
            ENV_TARGET_DIR => Some("/work/repo".to_owned()),
            ENV_TMUX_SESSION => Some("review".to_owned()),
            _ => None,
        });
        assert_eq!(cfg.target(None), Some((DEFAULT_TARGET, Path::new("/work/repo"))));
        assert_eq!(cfg.tmux_session, "review");
    }

    #[test]
    fn finalize_fills_in_cwd_and_absolutizes() {
        let mut cfg = Config::default();
        cfg.finalize(Path::new("/home/me/project"));
        assert_eq!(cfg.target(None), Some((DEFAULT_TARGET, Path::new("/home/me/project"))));

        let mut cfg = Config::parse("[targets]\napi = \"services/api\"\n").unwrap();
        cfg.finalize(Path::new("/repo"));
        assert_eq!(cfg.target(Some("api")).map(|(_, d)| d), Some(Path::new("/repo/services/api")));
        assert_eq!(cfg.target(Some("nope")), None);
        assert_eq!(cfg.target(Some("")).map(|(n, _)| n), Some("api"));
    }

    #[test]
    fn target_arg_parsing() {
        assert_eq!(
            parse_target_arg("web=../web").unwrap(),
            ("web".to_owned(), PathBuf::from("../web"))
        );
        assert!(parse_target_arg("web").is_err());
        assert!(parse_target_arg("=dir").is_err());
    }
}
