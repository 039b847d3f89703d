use crate::fingerprint::Fingerprint;
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};

/// Where the engine keeps its keyring and which key the server runs with.
///
/// ```toml
/// keyring = "/var/lib/app/.gnupg"
/// putenv = true
///
/// [server_key]
/// fingerprint = "144BB5819C321070E2BE9FA256485ADB95AE6661"
/// private = "/etc/app/gpg/serverkey_private.asc"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GpgConfig {
    /// Keyring home directory, the engine's default when unset
    pub keyring: Option<PathBuf>,
    /// Hand the keyring to the engine through `GNUPGHOME` instead of `--homedir`
    pub putenv: bool,
    pub server_key: ServerKeyConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerKeyConfig {
    pub fingerprint: Option<Fingerprint>,
    /// Armored private key file
    pub private: Option<PathBuf>,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("reading configuration file {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("parsing configuration"))]
    Parse { source: toml::de::Error },
}

impl GpgConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).context(ParseSnafu)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_toml_str(&content)
    }

    pub fn with_keyring(self, keyring: impl Into<PathBuf>) -> Self {
        Self {
            keyring: Some(keyring.into()),
            ..self
        }
    }

    pub fn with_server_key(self, fingerprint: Fingerprint, private: impl Into<PathBuf>) -> Self {
        Self {
            server_key: ServerKeyConfig {
                fingerprint: Some(fingerprint),
                private: Some(private.into()),
            },
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
keyring = "/var/lib/app/.gnupg"
putenv = true

[server_key]
fingerprint = "144BB5819C321070E2BE9FA256485ADB95AE6661"
private = "/etc/app/gpg/serverkey_private.asc"
"#;

    #[test]
    fn empty_is_default() {
        assert_eq!(GpgConfig::from_toml_str("").unwrap(), GpgConfig::default());
        assert!(!GpgConfig::default().putenv);
    }

    #[test]
    fn full() {
        let config = GpgConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.keyring, Some(PathBuf::from("/var/lib/app/.gnupg")));
        assert!(config.putenv);
        assert_eq!(
            config.server_key.fingerprint.unwrap().to_string(),
            "144BB5819C321070E2BE9FA256485ADB95AE6661"
        );
        assert_eq!(
            config.server_key.private,
            Some(PathBuf::from("/etc/app/gpg/serverkey_private.asc"))
        );
    }

    #[test]
    fn partial_server_key() {
        let config = GpgConfig::from_toml_str("[server_key]\nprivate = \"key.asc\"").unwrap();
        assert_eq!(config.server_key.fingerprint, None);
        assert_eq!(config.keyring, None);
    }

    #[test]
    fn bad_fingerprint() {
        let result = GpgConfig::from_toml_str("[server_key]\nfingerprint = \"1234\"");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = GpgConfig::load(file.path()).unwrap();
        assert_eq!(config, GpgConfig::from_toml_str(FULL).unwrap());
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpg.toml");
        match GpgConfig::load(&path) {
            Err(ConfigError::Read { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn builders() {
        let fingerprint = Fingerprint::from_bytes([1; 20]);
        let config = GpgConfig::default()
            .with_keyring("/tmp/keyring")
            .with_server_key(fingerprint, "/tmp/key.asc");
        assert_eq!(config.keyring, Some(PathBuf::from("/tmp/keyring")));
        assert_eq!(config.server_key.fingerprint, Some(fingerprint));
        assert_eq!(config.server_key.private, Some(PathBuf::from("/tmp/key.asc")));
    }
}
