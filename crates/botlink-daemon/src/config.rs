//! Daemon configuration file.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8765
//! handshake_timeout_secs = 5
//! shutdown_grace_secs = 5
//!
//! [auth]
//! shared_secret = "change-me"      # or BOTLINK_SHARED_SECRET
//! expected_identifier = "my-bot"
//!
//! [snapshot]
//! path = "live.json"
//! ```

use botlink_server::{Credential, ServerSettings};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot resolve listen address {0}")]
    Resolve(String),
    #[error("server.{0} must be greater than zero")]
    Zero(&'static str),
    #[error("no shared secret: set auth.shared_secret or BOTLINK_SHARED_SECRET")]
    MissingSecret,
    #[error("auth.expected_identifier must not be empty")]
    EmptyIdentifier,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub snapshot: SnapshotSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub handshake_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub outbound_queue: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerSettings::default();
        Self {
            host: defaults.bind.ip().to_string(),
            port: defaults.bind.port(),
            handshake_timeout_secs: defaults.handshake_timeout.as_secs(),
            shutdown_grace_secs: defaults.shutdown_grace.as_secs(),
            outbound_queue: defaults.outbound_queue,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    #[serde(default)]
    pub shared_secret: Option<String>,
    pub expected_identifier: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotSection {
    /// JSON or TOML file served for `get_config`.
    pub path: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: DaemonConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        // Relative snapshot paths are relative to the config file.
        if let Some(snapshot) = config.snapshot.path.take() {
            config.snapshot.path = Some(match path.parent() {
                Some(dir) if snapshot.is_relative() => dir.join(snapshot),
                _ => snapshot,
            });
        }
        Ok(config)
    }

    /// Validate the `[server]` section and resolve its listen address.
    pub async fn settings(&self) -> Result<ServerSettings, ConfigError> {
        if self.server.handshake_timeout_secs == 0 {
            return Err(ConfigError::Zero("handshake_timeout_secs"));
        }
        if self.server.outbound_queue == 0 {
            return Err(ConfigError::Zero("outbound_queue"));
        }

        let host = self.server.host.as_str();
        let bind: SocketAddr = tokio::net::lookup_host((host, self.server.port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::Resolve(format!("{host}:{}", self.server.port)))?;

        Ok(ServerSettings {
            bind,
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            shutdown_grace: Duration::from_secs(self.server.shutdown_grace_secs),
            outbound_queue: self.server.outbound_queue,
        })
    }

    /// Build the credential, preferring `secret_override` over the file.
    pub fn credential(&self, secret_override: Option<String>) -> Result<Credential, ConfigError> {
        let secret = secret_override
            .or_else(|| self.auth.shared_secret.clone())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSecret)?;
        if self.auth.expected_identifier.is_empty() {
            return Err(ConfigError::EmptyIdentifier);
        }
        Ok(Credential::new(secret, self.auth.expected_identifier.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botlink_core::generate_token;
    use std::io::Write;

    #[tokio::test]
    async fn minimal_config_uses_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [auth]
            shared_secret = "secret"
            expected_identifier = "pkp"
            "#,
        )
        .unwrap();

        let settings = config.settings().await.unwrap();
        assert_eq!(settings.bind, ([127, 0, 0, 1], 8765).into());
        assert_eq!(settings.handshake_timeout, Duration::from_secs(5));
        assert!(config.snapshot.path.is_none());

        let credential = config.credential(None).unwrap();
        assert_eq!(credential.verify(&generate_token("secret", "pkp"), "pkp"), Ok(()));
    }

    #[test]
    fn secret_override_wins() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [auth]
            shared_secret = "from-file"
            expected_identifier = "pkp"
            "#,
        )
        .unwrap();
        let credential = config.credential(Some("from-env".into())).unwrap();
        assert!(credential.verify(&generate_token("from-env", "pkp"), "pkp").is_ok());
    }

    #[test]
    fn missing_secret_is_an_error() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [auth]
            expected_identifier = "pkp"
            "#,
        )
        .unwrap();
        assert!(matches!(config.credential(None), Err(ConfigError::MissingSecret)));
        assert!(matches!(
            config.credential(Some(String::new())),
            Err(ConfigError::MissingSecret)
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: Result<DaemonConfig, _> = toml::from_str(
            r#"
            [auth]
            expected_identifier = "pkp"
            password = "typo"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn snapshot_path_is_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botlink.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[server]\nport = 9100\n\n[auth]\nexpected_identifier = \"pkp\"\n\n[snapshot]\npath = \"live.json\""
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.snapshot.path, Some(dir.path().join("live.json")));
        assert_eq!(config.settings().await.unwrap().bind.port(), 9100);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = DaemonConfig::load(Path::new("/nonexistent/botlink.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/botlink.toml"));
    }

    #[tokio::test]
    async fn zero_handshake_timeout_is_rejected() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [server]
            handshake_timeout_secs = 0

            [auth]
            expected_identifier = "pkp"
            "#,
        )
        .unwrap();
        let err = config.settings().await.unwrap_err();
        assert!(matches!(err, ConfigError::Zero("handshake_timeout_secs")), "got {err:?}");
    }

    #[tokio::test]
    async fn zero_outbound_queue_is_rejected() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [server]
            outbound_queue = 0

            [auth]
            expected_identifier = "pkp"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.settings().await,
            Err(ConfigError::Zero("outbound_queue"))
        ));
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [server]
            host = "localhost"
            port = 9200

            [auth]
            expected_identifier = "pkp"
            "#,
        )
        .unwrap();
        let settings = config.settings().await.unwrap();
        assert!(settings.bind.ip().is_loopback());
        assert_eq!(settings.bind.port(), 9200);
    }
}
