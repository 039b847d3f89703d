//! The operation façade: role preconditions, slot consumption and the server
//! key bootstrap, on top of an [`Engine`].

use crate::armor;
use crate::config::GpgConfig;
use crate::engine::{Engine, EngineError, SignatureInfo};
use crate::fingerprint::Fingerprint;
use crate::key_info::KeyInfoError;
use crate::roles::{Role, RoleBindings};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid key"))]
    KeyInfo { source: KeyInfoError },
    #[snafu(display("the key {fingerprint} was not found in the keyring"))]
    KeyNotInKeyring { fingerprint: Fingerprint },
    #[snafu(display("no {role} key set"))]
    KeyNotSet { role: Role },
    #[snafu(display("could not import the key"))]
    KeyImport { source: EngineError },
    #[snafu(display("the key {fingerprint} cannot be used to {role}"))]
    KeyUsage {
        fingerprint: Fingerprint,
        role: Role,
        source: EngineError,
    },
    #[snafu(display("could not encrypt the text"))]
    Encryption { source: EngineError },
    #[snafu(display("could not decrypt the text"))]
    Decryption { source: EngineError },
    #[snafu(display("could not sign the text"))]
    Signing { source: EngineError },
    #[snafu(display("could not verify the signed text"))]
    Verification { source: EngineError },
    #[snafu(display("expected a signature by {expected}"))]
    SignatureMismatch {
        expected: Fingerprint,
        found: Option<Fingerprint>,
    },
    #[snafu(display("the signature by {fingerprint} is not valid"))]
    BadSignature { fingerprint: Fingerprint },
    #[snafu(display("invalid server key configuration"))]
    Configuration { source: ServerKeyError },
    #[snafu(display("the server key in {} is not a valid private key", path.display()))]
    Validation { path: PathBuf },
    #[snafu(display("the server key {fingerprint} is not in the keyring after import"))]
    Consistency { fingerprint: Fingerprint },
}

/// Why the configured server key cannot be loaded.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServerKeyError {
    #[snafu(display("the secret key file is not defined"))]
    NoKeyFile,
    #[snafu(display("the server key fingerprint is not defined"))]
    NoFingerprint,
    #[snafu(display("reading server key {}", path.display()))]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A verified cleartext signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub signature: SignatureInfo,
    pub plaintext: String,
}

/// One unit of work against one engine session.
///
/// Not meant to be shared: create one per request or job and drop it after.
#[derive(Debug)]
pub struct OpenPgp<E> {
    pub(crate) engine: E,
    pub(crate) bindings: RoleBindings,
    config: GpgConfig,
}

impl<E: Engine> OpenPgp<E> {
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, GpgConfig::default())
    }

    pub fn with_config(engine: E, config: GpgConfig) -> Self {
        Self {
            engine,
            bindings: RoleBindings::default(),
            config,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    pub fn bindings(&self) -> &RoleBindings {
        &self.bindings
    }

    pub fn config(&self) -> &GpgConfig {
        &self.config
    }

    /// Encrypt for the bound encrypt key, and sign with the bound sign key
    /// when `sign` is set.
    ///
    /// The decrypt slot is cleared by every call. The sign slot is consumed
    /// when the signed encryption succeeds.
    pub fn encrypt(&mut self, text: &str, sign: bool) -> Result<String, Error> {
        self.assert_bound(Role::Encrypt)?;
        if sign {
            self.assert_bound(Role::Sign)?;
        }

        let result = if sign {
            self.engine.encrypt_and_sign(text)
        } else {
            self.engine.encrypt(text)
        };
        self.clear_decrypt_keys();
        if sign && result.is_ok() {
            self.clear_sign_keys();
        }
        result
            .inspect_err(|error| warn!(%error, sign, "encryption failed"))
            .context(EncryptionSnafu)
    }

    pub fn encrypt_sign(&mut self, text: &str) -> Result<String, Error> {
        self.encrypt(text, true)
    }

    /// Decrypt with the bound decrypt key.
    ///
    /// With `verify_signature`, the message must carry a signature by the
    /// bound verify key; that binding is consumed before the engine runs.
    /// The decrypt slot is cleared whatever the outcome.
    pub fn decrypt(&mut self, text: &str, verify_signature: bool) -> Result<String, Error> {
        self.assert_bound(Role::Decrypt)?;
        let expected = if verify_signature {
            let fingerprint = self.assert_bound(Role::Verify)?;
            self.clear_verify_keys();
            Some(fingerprint)
        } else {
            None
        };

        let result = match expected {
            None => self.engine.decrypt(text).map(|plaintext| (plaintext, None)),
            Some(_) => self
                .engine
                .decrypt_and_verify(text)
                .map(|(plaintext, signatures)| (plaintext, Some(signatures))),
        };
        self.clear_decrypt_keys();

        let (plaintext, signatures) = result
            .inspect_err(|error| warn!(%error, "decryption failed"))
            .context(DecryptionSnafu)?;
        if let (Some(expected), Some(signatures)) = (expected, signatures) {
            check_signer(expected, signatures.first())?;
        }
        Ok(plaintext)
    }

    /// Clearsign with the bound sign key. The sign slot is consumed even when
    /// signing fails.
    pub fn sign(&mut self, text: &str) -> Result<String, Error> {
        self.assert_bound(Role::Sign)?;
        let result = self.engine.sign(text);
        self.clear_sign_keys();
        result
            .inspect_err(|error| warn!(%error, "signing failed"))
            .context(SigningSnafu)
    }

    /// Verify a cleartext signed message against the bound verify key, which
    /// stays bound.
    pub fn verify(&mut self, signed_text: &str) -> Result<Verified, Error> {
        let expected = self.assert_bound(Role::Verify)?;
        let (signatures, plaintext) = self
            .engine
            .verify(signed_text)
            .inspect_err(|error| warn!(%error, "verification failed"))
            .context(VerificationSnafu)?;

        let signature = check_signer(expected, signatures.first())?.clone();
        Ok(Verified {
            signature,
            plaintext,
        })
    }

    /// Import the configured server private key and check that the
    /// configured fingerprint is what landed in the keyring.
    pub fn import_server_key_in_keyring(&mut self) -> Result<Fingerprint, Error> {
        let server_key = &self.config.server_key;
        let path = server_key
            .private
            .clone()
            .context(NoKeyFileSnafu)
            .context(ConfigurationSnafu)?;
        let expected = server_key
            .fingerprint
            .context(NoFingerprintSnafu)
            .context(ConfigurationSnafu)?;

        let armored = std::fs::read_to_string(&path)
            .context(UnreadableSnafu { path: &path })
            .context(ConfigurationSnafu)?;
        ensure!(
            armor::is_parsable_armored_private_key(&armored),
            ValidationSnafu { path }
        );

        let imported = self.import_key_into_keyring(&armored)?;
        ensure!(
            imported == expected && self.is_key_in_keyring(&expected),
            ConsistencySnafu {
                fingerprint: expected
            }
        );
        info!(fingerprint = %expected, "server key imported");
        Ok(expected)
    }

    /// Import an armored key, returning the engine's fingerprint for it.
    pub fn import_key_into_keyring(&mut self, armored_key: &str) -> Result<Fingerprint, Error> {
        let fingerprint = self.engine.import(armored_key).context(KeyImportSnafu)?;
        debug!(%fingerprint, "key imported");
        Ok(fingerprint)
    }

    /// Engine errors count as absent.
    pub fn is_key_in_keyring(&self, fingerprint: &Fingerprint) -> bool {
        match self.engine.key_info(fingerprint) {
            Ok(info) => info.is_some(),
            Err(error) => {
                warn!(%fingerprint, %error, "keyring lookup failed");
                false
            }
        }
    }

    pub fn assert_key_in_keyring(&self, fingerprint: &Fingerprint) -> Result<(), Error> {
        ensure!(
            self.is_key_in_keyring(fingerprint),
            KeyNotInKeyringSnafu {
                fingerprint: *fingerprint
            }
        );
        Ok(())
    }
}

fn check_signer<'a>(
    expected: Fingerprint,
    signature: Option<&'a SignatureInfo>,
) -> Result<&'a SignatureInfo, Error> {
    let found = signature.map(|signature| signature.fingerprint);
    let signature = signature
        .filter(|signature| signature.fingerprint == expected)
        .context(SignatureMismatchSnafu { expected, found })?;
    ensure!(
        signature.valid,
        BadSignatureSnafu {
            fingerprint: expected
        }
    );
    Ok(signature)
}
