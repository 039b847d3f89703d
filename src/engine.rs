//! The capability interface the façade drives. An engine owns the keyring and
//! does the actual cryptography; it is never shared between units of work.

#[cfg(any(test, feature = "memory-engine"))]
pub mod memory;

use crate::fingerprint::Fingerprint;
use crate::roles::Role;
use jiff::Timestamp;
use snafu::Snafu;

/// One signature reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SignatureInfo {
    /// Primary key fingerprint of the signer
    pub fingerprint: Fingerprint,
    pub valid: bool,
    pub created: Option<Timestamp>,
}

/// What the engine knows about a key in its keyring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineKeyInfo {
    pub fingerprint: Fingerprint,
    pub has_secret: bool,
    pub uids: Vec<String>,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
    #[snafu(display("key {fingerprint} is not in the keyring"))]
    UnknownKey { fingerprint: Fingerprint },
    #[snafu(display("secret key {fingerprint} is not in the keyring"))]
    MissingSecretKey { fingerprint: Fingerprint },
    #[snafu(display("bad passphrase for key {fingerprint}"))]
    BadPassphrase { fingerprint: Fingerprint },
    #[snafu(display("key {fingerprint} cannot be used: {reason}"))]
    Unusable {
        fingerprint: Fingerprint,
        reason: String,
    },
    #[snafu(display("no {role} key set"))]
    NoKeySet { role: Role },
    #[snafu(display("{message}"))]
    Operation { message: String },
    #[snafu(display("running the engine process"))]
    Spawn { source: std::io::Error },
    #[snafu(display("engine output is not valid UTF-8"))]
    Utf8 { source: std::string::FromUtf8Error },
}

impl EngineError {
    /// The engine does not hold the key (or its secret half) at all. This is
    /// the only failure an import can repair.
    pub fn is_unknown_key(&self) -> bool {
        matches!(self, Self::UnknownKey { .. } | Self::MissingSecretKey { .. })
    }
}

/// Keyring and cryptographic operations of an OpenPGP implementation.
///
/// Key registration calls accumulate: an engine encrypts to every registered
/// encrypt key until the matching `clear_*` call.
pub trait Engine {
    /// Import an armored key, returning the fingerprint of its primary key.
    fn import(&mut self, armored_key: &str) -> Result<Fingerprint, EngineError>;

    /// `Ok(None)` when the key is not in the keyring.
    fn key_info(&self, fingerprint: &Fingerprint) -> Result<Option<EngineKeyInfo>, EngineError>;

    fn add_encrypt_key(&mut self, fingerprint: &Fingerprint) -> Result<(), EngineError>;

    fn add_decrypt_key(
        &mut self,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<(), EngineError>;

    fn add_sign_key(&mut self, fingerprint: &Fingerprint, passphrase: &str)
        -> Result<(), EngineError>;

    fn encrypt(&mut self, text: &str) -> Result<String, EngineError>;

    fn encrypt_and_sign(&mut self, text: &str) -> Result<String, EngineError>;

    fn decrypt(&mut self, text: &str) -> Result<String, EngineError>;

    /// Plaintext and the signatures found on it, possibly none.
    fn decrypt_and_verify(
        &mut self,
        text: &str,
    ) -> Result<(String, Vec<SignatureInfo>), EngineError>;

    fn sign(&mut self, text: &str) -> Result<String, EngineError>;

    /// Signatures found on the message and the signed plaintext.
    fn verify(&mut self, signed_text: &str) -> Result<(Vec<SignatureInfo>, String), EngineError>;

    fn clear_encrypt_keys(&mut self);

    fn clear_decrypt_keys(&mut self);

    fn clear_sign_keys(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_keys_are_repairable() {
        let fingerprint = Fingerprint::from_bytes([7; 20]);
        assert!(EngineError::UnknownKey { fingerprint }.is_unknown_key());
        assert!(EngineError::MissingSecretKey { fingerprint }.is_unknown_key());
        assert!(!EngineError::BadPassphrase { fingerprint }.is_unknown_key());
        assert!(!EngineError::Unusable {
            fingerprint,
            reason: "revoked".into()
        }
        .is_unknown_key());
        assert!(!EngineError::Operation {
            message: "boom".into()
        }
        .is_unknown_key());
    }

    #[test]
    fn signature_info_json() {
        let info = SignatureInfo {
            fingerprint: "CC25E778A361F67E80D4A11BD4D49816891A9023".parse().unwrap(),
            valid: true,
            created: None,
        };
        assert_eq!(
            serde_json::to_string(&info).unwrap(),
            r#"{"fingerprint":"CC25E778A361F67E80D4A11BD4D49816891A9023","valid":true,"created":null}"#
        );

        let json = r#"{"fingerprint":"CC25E778A361F67E80D4A11BD4D49816891A9023","valid":false,"created":"2026-10-19T18:13:57Z"}"#;
        let info: SignatureInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.created.map(|t| t.as_second()), Some(1792433637));
        assert_eq!(serde_json::to_string(&info).unwrap(), json);

        let garbage = json.replace("2026-10-19T18:13:57Z", "toto mange du gateau");
        assert!(serde_json::from_str::<SignatureInfo>(&garbage).is_err());
    }
}
