use crate::engine::{Engine, EngineError, UnknownKeySnafu};
use crate::facade::{Error, KeyInfoSnafu, KeyNotSetSnafu, KeyUsageSnafu, OpenPgp};
use crate::fingerprint::Fingerprint;
use crate::key_info;
use crate::roles::Role;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, warn};

impl<E: Engine> OpenPgp<E> {
    /// Bind the public part of `armored_key` (public or private block) for
    /// encryption, importing it when the keyring does not know it yet.
    pub fn set_encrypt_key(&mut self, armored_key: &str) -> Result<Fingerprint, Error> {
        self.bind_armored(Role::Encrypt, armored_key, "")
    }

    pub fn set_encrypt_key_from_fingerprint(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> Result<(), Error> {
        self.bind_fingerprint(Role::Encrypt, fingerprint, "")
    }

    pub fn set_decrypt_key(
        &mut self,
        armored_key: &str,
        passphrase: &str,
    ) -> Result<Fingerprint, Error> {
        self.bind_armored(Role::Decrypt, armored_key, passphrase)
    }

    pub fn set_decrypt_key_from_fingerprint(
        &mut self,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<(), Error> {
        self.bind_fingerprint(Role::Decrypt, fingerprint, passphrase)
    }

    pub fn set_sign_key(&mut self, armored_key: &str, passphrase: &str) -> Result<Fingerprint, Error> {
        self.bind_armored(Role::Sign, armored_key, passphrase)
    }

    pub fn set_sign_key_from_fingerprint(
        &mut self,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<(), Error> {
        self.bind_fingerprint(Role::Sign, fingerprint, passphrase)
    }

    pub fn set_verify_key(&mut self, armored_key: &str) -> Result<Fingerprint, Error> {
        self.bind_armored(Role::Verify, armored_key, "")
    }

    pub fn set_verify_key_from_fingerprint(
        &mut self,
        fingerprint: &Fingerprint,
    ) -> Result<(), Error> {
        self.bind_fingerprint(Role::Verify, fingerprint, "")
    }

    /// Fingerprint bound to `role`, or [`Error::KeyNotSet`].
    pub fn assert_bound(&self, role: Role) -> Result<Fingerprint, Error> {
        self.bindings.get(role).context(KeyNotSetSnafu { role })
    }

    pub fn clear_encrypt_keys(&mut self) {
        self.release(Role::Encrypt);
    }

    pub fn clear_decrypt_keys(&mut self) {
        self.release(Role::Decrypt);
    }

    pub fn clear_sign_keys(&mut self) {
        self.release(Role::Sign);
    }

    pub fn clear_verify_keys(&mut self) {
        self.release(Role::Verify);
    }

    pub fn clear_keys(&mut self) {
        for role in Role::ALL {
            self.release(role);
        }
    }

    fn release(&mut self, role: Role) {
        match role {
            Role::Encrypt => self.engine.clear_encrypt_keys(),
            Role::Decrypt => self.engine.clear_decrypt_keys(),
            Role::Sign => self.engine.clear_sign_keys(),
            // verification keys are not registered with the engine
            Role::Verify => {}
        }
        if let Some(fingerprint) = self.bindings.clear(role) {
            debug!(%fingerprint, %role, "key unbound");
        }
    }

    fn register(
        &mut self,
        role: Role,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<(), EngineError> {
        match role {
            Role::Encrypt => self.engine.add_encrypt_key(fingerprint),
            Role::Decrypt => self.engine.add_decrypt_key(fingerprint, passphrase),
            Role::Sign => self.engine.add_sign_key(fingerprint, passphrase),
            Role::Verify => match self.engine.key_info(fingerprint)? {
                Some(_) => Ok(()),
                None => UnknownKeySnafu {
                    fingerprint: *fingerprint,
                }
                .fail(),
            },
        }
    }

    /// Register the key for `role`; when the engine does not know it, import
    /// `armored_key` and try exactly once more.
    fn bind_armored(
        &mut self,
        role: Role,
        armored_key: &str,
        passphrase: &str,
    ) -> Result<Fingerprint, Error> {
        self.release(role);

        let info = match role {
            Role::Encrypt | Role::Verify => key_info::get_public_key_info(armored_key),
            Role::Decrypt | Role::Sign => key_info::get_key_info(armored_key),
        }
        .context(KeyInfoSnafu)?;
        let fingerprint = info.fingerprint();

        match self.register(role, &fingerprint, passphrase) {
            Ok(()) => {}
            Err(error) if error.is_unknown_key() => {
                warn!(%fingerprint, %role, %error, "importing key before binding");
                self.import_key_into_keyring(armored_key)?;
                self.register(role, &fingerprint, passphrase)
                    .context(KeyUsageSnafu { fingerprint, role })?;
            }
            Err(source) => {
                return Err(Error::KeyUsage {
                    fingerprint,
                    role,
                    source,
                })
            }
        }

        self.bindings.bind(role, fingerprint);
        debug!(%fingerprint, %role, "key bound");
        Ok(fingerprint)
    }

    fn bind_fingerprint(
        &mut self,
        role: Role,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<(), Error> {
        let fingerprint = *fingerprint;
        self.release(role);
        self.assert_key_in_keyring(&fingerprint)?;
        self.register(role, &fingerprint, passphrase)
            .inspect_err(|error| warn!(%fingerprint, %role, %error, "key cannot be bound"))
            .context(KeyUsageSnafu { fingerprint, role })?;

        self.bindings.bind(role, fingerprint);
        debug!(%fingerprint, %role, "key bound");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::key_info::KeyInfoError;

    const ALICE_PUBLIC: &str = include_str!("../tests/fixtures/alice_public.asc");
    const ALICE_PRIVATE: &str = include_str!("../tests/fixtures/alice_private.asc");
    const BOB_PUBLIC: &str = include_str!("../tests/fixtures/bob_public.asc");
    const BOB_PRIVATE: &str = include_str!("../tests/fixtures/bob_private.asc");
    const MESSAGE: &str = include_str!("../tests/fixtures/message_to_alice.asc");

    fn alice() -> Fingerprint {
        "144BB5819C321070E2BE9FA256485ADB95AE6661".parse().unwrap()
    }

    fn bob() -> Fingerprint {
        "CC25E778A361F67E80D4A11BD4D49816891A9023".parse().unwrap()
    }

    fn openpgp() -> OpenPgp<MemoryEngine> {
        OpenPgp::new(MemoryEngine::new().with_passphrase(bob(), "bob-passphrase"))
    }

    mod armored {
        use super::*;

        #[test]
        fn imports_unknown_key_once() {
            let mut gpg = openpgp();
            assert_eq!(gpg.set_encrypt_key(ALICE_PUBLIC).unwrap(), alice());
            assert_eq!(gpg.engine().import_count(), 1);
            assert_eq!(gpg.assert_bound(Role::Encrypt).unwrap(), alice());

            gpg.set_encrypt_key(ALICE_PUBLIC).unwrap();
            assert_eq!(gpg.engine().import_count(), 1);
        }

        #[test]
        fn private_key_binds_for_encryption() {
            let mut gpg = openpgp();
            assert_eq!(gpg.set_encrypt_key(BOB_PRIVATE).unwrap(), bob());
        }

        #[test]
        fn imports_secret_half_when_only_public_is_known() {
            let mut gpg = openpgp();
            gpg.import_key_into_keyring(BOB_PUBLIC).unwrap();
            gpg.set_decrypt_key(BOB_PRIVATE, "bob-passphrase").unwrap();
            assert_eq!(gpg.engine().import_count(), 2);
            assert_eq!(gpg.bindings().get(Role::Decrypt), Some(bob()));
        }

        #[test]
        fn wrong_passphrase_does_not_import() {
            let mut gpg = openpgp();
            gpg.import_key_into_keyring(BOB_PRIVATE).unwrap();
            match gpg.set_sign_key(BOB_PRIVATE, "wrong") {
                Err(Error::KeyUsage {
                    fingerprint,
                    role,
                    source: EngineError::BadPassphrase { .. },
                }) => {
                    assert_eq!(fingerprint, bob());
                    assert_eq!(role, Role::Sign);
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(gpg.engine().import_count(), 1);
            assert!(!gpg.bindings().is_bound(Role::Sign));
        }

        #[test]
        fn second_failure_is_fatal() {
            let mut gpg = openpgp();
            assert!(matches!(
                gpg.set_decrypt_key(BOB_PRIVATE, "wrong"),
                Err(Error::KeyUsage {
                    source: EngineError::BadPassphrase { .. },
                    ..
                })
            ));
            assert_eq!(gpg.engine().import_count(), 1);
        }

        #[test]
        fn public_key_cannot_decrypt() {
            let mut gpg = openpgp();
            assert!(matches!(
                gpg.set_decrypt_key(ALICE_PUBLIC, ""),
                Err(Error::KeyUsage {
                    source: EngineError::MissingSecretKey { .. },
                    ..
                })
            ));
        }

        #[test]
        fn not_a_key() {
            let mut gpg = openpgp();
            assert!(matches!(
                gpg.set_encrypt_key(MESSAGE),
                Err(Error::KeyInfo {
                    source: KeyInfoError::NotAKey
                })
            ));
            assert!(matches!(
                gpg.set_sign_key("hello", ""),
                Err(Error::KeyInfo { .. })
            ));
            assert_eq!(gpg.engine().import_count(), 0);
        }

        #[test]
        fn verify_key_is_imported() {
            let mut gpg = openpgp();
            assert_eq!(gpg.set_verify_key(BOB_PUBLIC).unwrap(), bob());
            assert!(gpg.is_key_in_keyring(&bob()));
        }
    }

    mod fingerprint {
        use super::*;

        #[test]
        fn must_be_in_keyring() {
            let mut gpg = openpgp();
            for result in [
                gpg.set_encrypt_key_from_fingerprint(&alice()),
                gpg.set_decrypt_key_from_fingerprint(&alice(), ""),
                gpg.set_sign_key_from_fingerprint(&alice(), ""),
                gpg.set_verify_key_from_fingerprint(&alice()),
            ] {
                assert!(matches!(result, Err(Error::KeyNotInKeyring { .. })));
            }
            assert_eq!(gpg.engine().import_count(), 0);
        }

        #[test]
        fn binds_known_keys() {
            let mut gpg = openpgp();
            gpg.import_key_into_keyring(ALICE_PRIVATE).unwrap();
            gpg.set_encrypt_key_from_fingerprint(&alice()).unwrap();
            gpg.set_decrypt_key_from_fingerprint(&alice(), "").unwrap();
            gpg.set_sign_key_from_fingerprint(&alice(), "").unwrap();
            gpg.set_verify_key_from_fingerprint(&alice()).unwrap();
            assert_eq!(gpg.bindings().bound().count(), 4);
        }

        #[test]
        fn wrong_passphrase_is_a_usage_error() {
            let mut gpg = openpgp();
            gpg.import_key_into_keyring(BOB_PRIVATE).unwrap();
            let error = gpg
                .set_decrypt_key_from_fingerprint(&bob(), "wrong")
                .unwrap_err();
            assert!(matches!(
                error,
                Error::KeyUsage {
                    source: EngineError::BadPassphrase { .. },
                    ..
                }
            ));
            assert_eq!(
                error.to_string(),
                "the key CC25E778A361F67E80D4A11BD4D49816891A9023 cannot be used to decrypt"
            );
        }
    }

    mod slots {
        use super::*;

        #[test]
        fn failed_bind_leaves_slot_unset() {
            let mut gpg = openpgp();
            gpg.set_sign_key(ALICE_PRIVATE, "").unwrap();
            assert!(gpg.set_sign_key(BOB_PRIVATE, "wrong").is_err());
            assert!(matches!(
                gpg.assert_bound(Role::Sign),
                Err(Error::KeyNotSet { role: Role::Sign })
            ));
        }

        #[test]
        fn rebinding_replaces_the_engine_key() {
            let mut gpg = openpgp();
            gpg.set_encrypt_key(ALICE_PUBLIC).unwrap();
            gpg.set_encrypt_key(BOB_PUBLIC).unwrap();
            let ciphertext = gpg.encrypt("for bob only", false).unwrap();

            gpg.set_decrypt_key(ALICE_PRIVATE, "").unwrap();
            assert!(matches!(
                gpg.decrypt(&ciphertext, false),
                Err(Error::Decryption { .. })
            ));
            gpg.set_decrypt_key(BOB_PRIVATE, "bob-passphrase").unwrap();
            assert_eq!(gpg.decrypt(&ciphertext, false).unwrap(), "for bob only");
        }

        #[test]
        fn clear_keys() {
            let mut gpg = openpgp();
            gpg.set_encrypt_key(ALICE_PUBLIC).unwrap();
            gpg.set_decrypt_key(ALICE_PRIVATE, "").unwrap();
            gpg.set_sign_key(ALICE_PRIVATE, "").unwrap();
            gpg.set_verify_key(ALICE_PUBLIC).unwrap();

            gpg.clear_encrypt_keys();
            assert!(!gpg.bindings().is_bound(Role::Encrypt));
            assert!(gpg.bindings().is_bound(Role::Decrypt));

            gpg.clear_keys();
            for role in Role::ALL {
                assert!(matches!(
                    gpg.assert_bound(role),
                    Err(Error::KeyNotSet { role: unset }) if unset == role
                ));
            }
        }

        #[test]
        fn clearing_is_unconditional() {
            let mut gpg = openpgp();
            gpg.clear_verify_keys();
            gpg.clear_keys();
            assert_eq!(gpg.bindings().bound().count(), 0);
        }
    }
}
