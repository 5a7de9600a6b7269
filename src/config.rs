//! Daemon configuration: TOML file, validated once at load.
//!
//! ```toml
//! data_dir = "/home/me/.local/share/clipsync"
//! transfer_timeout_ms = 500
//!
//! [[clipboard]]
//! label = "default"
//! max_entries = 100
//! allowed_mime_types = ["^text/", "^image/png$"]
//! mime_aliases = [["text/plain", "UTF8_STRING", "STRING"]]
//!
//! [[clipboard.endpoint]]
//! label = "desktop"
//! transport = "x11"
//! display = ":0"
//! selections = ["regular", "primary"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clipboard::{ClipboardSettings, DEFAULT_MAX_ENTRIES};
use crate::endpoint::SelectionKind;

pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 500;

/// Configuration load/validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("cannot determine {0} directory ($HOME is not set)")]
    NoHome(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    X11,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub label: String,
    pub transport: Transport,
    /// X11 display name; `$DISPLAY` when unset.
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default = "default_selections")]
    pub selections: Vec<SelectionKind>,
}

fn default_selections() -> Vec<SelectionKind> {
    vec![SelectionKind::Regular]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClipboardConfig {
    pub label: String,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Regular expressions; empty allows every mime type.
    #[serde(default)]
    pub allowed_mime_types: Vec<String>,
    #[serde(default)]
    pub mime_aliases: Vec<Vec<String>>,
    #[serde(default, rename = "endpoint")]
    pub endpoints: Vec<EndpointConfig>,
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where `history.db` and `data/` live.
    pub data_dir: Option<PathBuf>,
    /// Keep everything in memory; nothing survives a restart.
    pub ephemeral: bool,
    pub transfer_timeout_ms: u64,
    #[serde(rename = "clipboard")]
    pub clipboards: Vec<ClipboardConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            ephemeral: false,
            transfer_timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
            clipboards: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate.
    ///
    /// An explicit `path` must exist. Without one, the default location
    /// is tried and a missing file yields the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (default_path()?, false),
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let config: Config =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            clipboards = config.clipboards.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transfer_timeout_ms must be positive".into(),
            ));
        }

        let mut labels = HashSet::new();
        for clipboard in &self.clipboards {
            let label = clipboard.label.as_str();
            if label.trim().is_empty() {
                return Err(ConfigError::Invalid("clipboard with empty label".into()));
            }
            if !labels.insert(label) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate clipboard label {label:?}"
                )));
            }
            // Compiles the filters as a side effect of the checks.
            self.settings(clipboard)?;

            let mut endpoint_labels = HashSet::new();
            for endpoint in &clipboard.endpoints {
                if endpoint.label.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "clipboard {label:?}: endpoint with empty label"
                    )));
                }
                if !endpoint_labels.insert(endpoint.label.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "clipboard {label:?}: duplicate endpoint label {:?}",
                        endpoint.label
                    )));
                }
                if endpoint.selections.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "clipboard {label:?}: endpoint {:?} has no selections",
                        endpoint.label
                    )));
                }
                if endpoint.transport == Transport::Memory && endpoint.display.is_some() {
                    return Err(ConfigError::Invalid(format!(
                        "clipboard {label:?}: endpoint {:?}: display is only valid for x11",
                        endpoint.label
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validated core settings for one configured clipboard.
    pub fn settings(&self, clipboard: &ClipboardConfig) -> Result<ClipboardSettings, ConfigError> {
        let label = &clipboard.label;
        if clipboard.max_entries == 0 {
            return Err(ConfigError::Invalid(format!(
                "clipboard {label:?}: max_entries must be at least 1"
            )));
        }

        let allowed_mime_types = clipboard
            .allowed_mime_types
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "clipboard {label:?}: bad mime filter {pattern:?}: {e}"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for group in &clipboard.mime_aliases {
            if group.len() < 2 || group.iter().any(|m| m.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "clipboard {label:?}: alias group {group:?} needs at least two non-empty mime types"
                )));
            }
        }

        Ok(ClipboardSettings {
            max_entries: clipboard.max_entries,
            allowed_mime_types,
            mime_aliases: clipboard.mime_aliases.clone(),
            transfer_timeout: self.transfer_timeout(),
        })
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Settings for a clipboard added at runtime.
    pub fn runtime_settings(&self, max_entries: usize) -> ClipboardSettings {
        ClipboardSettings {
            max_entries,
            transfer_timeout: self.transfer_timeout(),
            ..ClipboardSettings::default()
        }
    }

    /// Configured data directory, or `$XDG_DATA_HOME/clipsync`.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(xdg_dir("XDG_DATA_HOME", ".local/share", "data")?.join("clipsync")),
        }
    }
}

/// `$XDG_CONFIG_HOME/clipsync/config.toml`.
pub fn default_path() -> Result<PathBuf, ConfigError> {
    Ok(xdg_dir("XDG_CONFIG_HOME", ".config", "config")?
        .join("clipsync")
        .join("config.toml"))
}

fn xdg_dir(var: &str, fallback: &str, what: &'static str) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = std::env::var_os(var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME").ok_or(ConfigError::NoHome(what))?;
    Ok(PathBuf::from(home).join(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("test.toml"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn empty_file_is_default() {
        let config = parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.transfer_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r#"
            data_dir = "/tmp/clipsync"
            transfer_timeout_ms = 250

            [[clipboard]]
            label = "work"
            max_entries = 5
            allowed_mime_types = ["^text/"]
            mime_aliases = [["text/plain", "UTF8_STRING"]]

            [[clipboard.endpoint]]
            label = "desk"
            transport = "x11"
            display = ":1"
            selections = ["regular", "primary"]

            [[clipboard.endpoint]]
            label = "scratch"
            transport = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/clipsync"));
        let clipboard = &config.clipboards[0];
        assert_eq!(clipboard.endpoints.len(), 2);
        assert_eq!(clipboard.endpoints[0].transport, Transport::X11);
        assert_eq!(
            clipboard.endpoints[0].selections,
            vec![SelectionKind::Regular, SelectionKind::Primary]
        );
        assert_eq!(clipboard.endpoints[1].selections, vec![SelectionKind::Regular]);

        let settings = config.settings(clipboard).unwrap();
        assert_eq!(settings.max_entries, 5);
        assert_eq!(settings.transfer_timeout, Duration::from_millis(250));
        assert!(settings.allows("text/html"));
        assert!(!settings.allows("image/png"));
        assert_eq!(settings.aliases_of("UTF8_STRING").len(), 2);
    }

    #[test]
    fn max_entries_defaults_to_100() {
        let config = parse("[[clipboard]]\nlabel = \"a\"\n").unwrap();
        assert_eq!(config.clipboards[0].max_entries, 100);
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            "transfer_timeout_ms = 0",
            "[[clipboard]]\nlabel = \"\"",
            "[[clipboard]]\nlabel = \"a\"\n[[clipboard]]\nlabel = \"a\"",
            "[[clipboard]]\nlabel = \"a\"\nmax_entries = 0",
            "[[clipboard]]\nlabel = \"a\"\nallowed_mime_types = [\"(\"]",
            "[[clipboard]]\nlabel = \"a\"\nmime_aliases = [[\"text/plain\"]]",
            "[[clipboard]]\nlabel = \"a\"\n[[clipboard.endpoint]]\nlabel = \"e\"\ntransport = \"memory\"\nselections = []",
            "[[clipboard]]\nlabel = \"a\"\n[[clipboard.endpoint]]\nlabel = \"e\"\ntransport = \"memory\"\ndisplay = \":0\"",
        ];
        for case in cases {
            assert!(
                matches!(parse(case), Err(ConfigError::Invalid(_))),
                "accepted: {case}"
            );
        }
    }

    #[test]
    fn rejects_unknown_keys_and_transports() {
        assert!(matches!(parse("colour = true"), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            parse("[[clipboard]]\nlabel = \"a\"\n[[clipboard.endpoint]]\nlabel = \"e\"\ntransport = \"wayland\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            Config::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "ephemeral = true\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert!(config.ephemeral);
    }
}
