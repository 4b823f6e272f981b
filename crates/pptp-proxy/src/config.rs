//! Proxy configuration: TOML file + CLI overrides.

use pptp_core::{ProxyError, ProxyResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub acl: AclSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[proxy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    /// Forwarding pairs, `[listen[:port],]remote[:port]`.
    #[serde(default)]
    pub pairs: Vec<String>,
    /// Accept and advertise the PPTP-IN-TCP extension.
    #[serde(default = "default_true")]
    pub wrap: bool,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            wrap: true,
        }
    }
}

/// `[acl]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AclSection {
    /// Admitted subnets, `net/mask`.
    #[serde(default)]
    pub allow: Vec<String>,
    /// External commands consulted as `CMD <ip>` when no subnet matches.
    #[serde(default)]
    pub commands: Vec<String>,
}

/// `[log]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub packet_dump: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            packet_dump: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Values taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub pairs: Vec<String>,
    pub acl: Vec<String>,
    pub acl_commands: Vec<String>,
    pub force_std: bool,
    pub packet_dump: bool,
    pub debug: bool,
    pub log_file: Option<String>,
    pub log_level: Option<String>,
}

/// Resolved proxy configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub pairs: Vec<String>,
    pub wrap: bool,
    pub acl: Vec<String>,
    pub acl_commands: Vec<String>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub packet_dump: bool,
}

impl ProxyConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// CLI pairs and ACL entries are appended to the file's entries; CLI
    /// switches win over file booleans.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> ProxyResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| ProxyError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut pairs = file_config.proxy.pairs;
        pairs.extend(cli.pairs);
        if pairs.is_empty() {
            return Err(ProxyError::Config(
                "please specify at least one pair with -p".into(),
            ));
        }

        let mut acl = file_config.acl.allow;
        acl.extend(cli.acl);
        let mut acl_commands = file_config.acl.commands;
        acl_commands.extend(cli.acl_commands);

        let packet_dump = cli.packet_dump || file_config.log.packet_dump;
        // Packet dumps are emitted at trace level; debug mode at debug level.
        let log_level = if packet_dump {
            "trace".to_string()
        } else if cli.debug {
            "debug".to_string()
        } else {
            cli.log_level.unwrap_or(file_config.log.level)
        };

        let log_file = cli
            .log_file
            .or(file_config.log.file)
            .map(|f| expand_tilde_str(&f));

        Ok(Self {
            pairs,
            wrap: file_config.proxy.wrap && !cli.force_std,
            acl,
            acl_commands,
            log_level,
            log_file,
            packet_dump,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli_with_pair() -> CliOverrides {
        CliOverrides {
            pairs: vec!["10.0.0.5".into()],
            ..Default::default()
        }
    }

    #[test]
    fn defaults_without_file() {
        let cfg = ProxyConfig::load(None, cli_with_pair()).unwrap();
        assert_eq!(cfg.pairs, vec!["10.0.0.5".to_string()]);
        assert!(cfg.wrap);
        assert!(cfg.acl.is_empty());
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.packet_dump);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ProxyConfig::load(
            Some(Path::new("/nonexistent/pptpproxy/config.toml")),
            cli_with_pair(),
        )
        .unwrap();
        assert!(cfg.wrap);
    }

    #[test]
    fn no_pairs_is_an_error() {
        let err = ProxyConfig::load(None, CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn file_and_cli_are_merged() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[proxy]
pairs = ["0.0.0.0:1723,10.0.0.5:1723"]
wrap = true

[acl]
allow = ["10.0.0.0/255.0.0.0"]
commands = ["/usr/local/bin/check-ip"]

[log]
level = "warn"
file = "/var/log/pptpproxy.log"
"#
        )
        .unwrap();

        let cli = CliOverrides {
            pairs: vec!["127.0.0.1:1724,10.0.0.6".into()],
            acl: vec!["192.168.0.0/16".into()],
            force_std: true,
            ..Default::default()
        };
        let cfg = ProxyConfig::load(Some(file.path()), cli).unwrap();
        assert_eq!(cfg.pairs.len(), 2);
        assert_eq!(cfg.acl.len(), 2);
        assert_eq!(cfg.acl_commands, vec!["/usr/local/bin/check-ip".to_string()]);
        assert!(!cfg.wrap, "--force-std overrides the file");
        assert_eq!(cfg.log_level, "warn");
        assert_eq!(cfg.log_file, Some(PathBuf::from("/var/log/pptpproxy.log")));
    }

    #[test]
    fn packet_dump_raises_level_to_trace() {
        let cli = CliOverrides {
            packet_dump: true,
            log_level: Some("warn".into()),
            ..cli_with_pair()
        };
        let cfg = ProxyConfig::load(None, cli).unwrap();
        assert!(cfg.packet_dump);
        assert_eq!(cfg.log_level, "trace");
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[proxy\npairs = 3").unwrap();
        let err = ProxyConfig::load(Some(file.path()), cli_with_pair()).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }
}
