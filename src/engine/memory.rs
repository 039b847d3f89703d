//! An [`Engine`] with an in-memory keyring.
//!
//! It performs no cryptography. Messages are wrapped in a private packet type
//! naming their recipients, and signatures are SHA-1 digests over the signer
//! fingerprint and the text. That is enough to drive the façade, its role
//! rules and its fingerprint checks without a `gpg` binary.

use super::{
    BadPassphraseSnafu, Engine, EngineError, EngineKeyInfo, MissingSecretKeySnafu,
    NoKeySetSnafu, OperationSnafu, SignatureInfo, UnknownKeySnafu,
};
use crate::armor::{self, ArmorMarker, SIGNATURE_LABEL};
use crate::fingerprint::Fingerprint;
use crate::key_info::{self, KeyInfo};
use crate::packet::{self, SignaturePacket, Tag};
use crate::roles::Role;
use sha1::{Digest, Sha1};
use snafu::{ensure, OptionExt};
use std::collections::{BTreeMap, HashMap};

/// Private packet tag carrying an envelope.
const ENVELOPE_TAG: u8 = 60;
const SHA1_ID: u8 = 2;

#[derive(Debug, Clone)]
struct StoredKey {
    info: KeyInfo,
    secret: bool,
}

#[derive(Debug, Default)]
pub struct MemoryEngine {
    keys: BTreeMap<Fingerprint, StoredKey>,
    passphrases: HashMap<Fingerprint, String>,
    encrypt_keys: Vec<Fingerprint>,
    decrypt_keys: Vec<Fingerprint>,
    sign_keys: Vec<Fingerprint>,
    imports: usize,
}

fn invalid(message: impl Into<String>) -> EngineError {
    OperationSnafu {
        message: message.into(),
    }
    .build()
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the secret key of `fingerprint` behind `passphrase`. Secret keys
    /// otherwise unlock with the empty passphrase.
    pub fn with_passphrase(mut self, fingerprint: Fingerprint, passphrase: impl Into<String>) -> Self {
        self.passphrases.insert(fingerprint, passphrase.into());
        self
    }

    /// Number of successful imports so far.
    pub fn import_count(&self) -> usize {
        self.imports
    }

    fn stored(&self, fingerprint: &Fingerprint) -> Result<&StoredKey, EngineError> {
        self.keys.get(fingerprint).context(UnknownKeySnafu {
            fingerprint: *fingerprint,
        })
    }

    fn unlock(&self, fingerprint: &Fingerprint, passphrase: &str) -> Result<(), EngineError> {
        let fingerprint = *fingerprint;
        ensure!(
            self.stored(&fingerprint)?.secret,
            MissingSecretKeySnafu { fingerprint }
        );
        let expected = self.passphrases.get(&fingerprint).map_or("", String::as_str);
        ensure!(expected == passphrase, BadPassphraseSnafu { fingerprint });
        Ok(())
    }

    fn seal(&self, text: &str, signer: Option<Fingerprint>) -> Result<String, EngineError> {
        ensure!(
            !self.encrypt_keys.is_empty(),
            NoKeySetSnafu {
                role: Role::Encrypt
            }
        );
        let envelope = Envelope {
            recipients: self.encrypt_keys.clone(),
            signer,
            plaintext: text.to_owned(),
        };
        Ok(armor::enarmor(ArmorMarker::Message, &envelope.encode()?))
    }

    fn open(&self, text: &str) -> Result<Envelope, EngineError> {
        ensure!(
            !self.decrypt_keys.is_empty(),
            NoKeySetSnafu {
                role: Role::Decrypt
            }
        );
        let envelope = Envelope::parse(text)?;
        ensure!(
            envelope
                .recipients
                .iter()
                .any(|recipient| self.decrypt_keys.contains(recipient)),
            OperationSnafu {
                message: "no bound decrypt key can open the message"
            }
        );
        Ok(envelope)
    }

    fn signer(&self) -> Result<&StoredKey, EngineError> {
        let fingerprint = self
            .sign_keys
            .first()
            .context(NoKeySetSnafu { role: Role::Sign })?;
        self.stored(fingerprint)
    }
}

impl Engine for MemoryEngine {
    fn import(&mut self, armored_key: &str) -> Result<Fingerprint, EngineError> {
        let info = key_info::get_key_info(armored_key).map_err(|error| invalid(error.to_string()))?;
        let secret = armor::get_marker(armored_key) == Ok(ArmorMarker::PrivateKey);
        let fingerprint = info.fingerprint();

        let stored = self
            .keys
            .entry(fingerprint)
            .or_insert(StoredKey { info, secret });
        stored.secret |= secret;
        self.imports += 1;
        Ok(fingerprint)
    }

    fn key_info(&self, fingerprint: &Fingerprint) -> Result<Option<EngineKeyInfo>, EngineError> {
        Ok(self.keys.get(fingerprint).map(|key| EngineKeyInfo {
            fingerprint: key.info.fingerprint(),
            has_secret: key.secret,
            uids: vec![key.info.uid().to_owned()],
        }))
    }

    fn add_encrypt_key(&mut self, fingerprint: &Fingerprint) -> Result<(), EngineError> {
        self.stored(fingerprint)?;
        self.encrypt_keys.push(*fingerprint);
        Ok(())
    }

    fn add_decrypt_key(
        &mut self,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<(), EngineError> {
        self.unlock(fingerprint, passphrase)?;
        self.decrypt_keys.push(*fingerprint);
        Ok(())
    }

    fn add_sign_key(
        &mut self,
        fingerprint: &Fingerprint,
        passphrase: &str,
    ) -> Result<(), EngineError> {
        self.unlock(fingerprint, passphrase)?;
        self.sign_keys.push(*fingerprint);
        Ok(())
    }

    fn encrypt(&mut self, text: &str) -> Result<String, EngineError> {
        self.seal(text, None)
    }

    fn encrypt_and_sign(&mut self, text: &str) -> Result<String, EngineError> {
        let signer = self.signer()?.info.fingerprint();
        self.seal(text, Some(signer))
    }

    fn decrypt(&mut self, text: &str) -> Result<String, EngineError> {
        Ok(self.open(text)?.plaintext)
    }

    fn decrypt_and_verify(
        &mut self,
        text: &str,
    ) -> Result<(String, Vec<SignatureInfo>), EngineError> {
        let envelope = self.open(text)?;
        let signatures = envelope
            .signer
            .map(|fingerprint| SignatureInfo {
                fingerprint,
                valid: self.keys.contains_key(&fingerprint),
                created: None,
            })
            .into_iter()
            .collect();
        Ok((envelope.plaintext, signatures))
    }

    fn sign(&mut self, text: &str) -> Result<String, EngineError> {
        let signature = signature_packet(&self.signer()?.info, text);

        let mut signed = format!(
            "-----BEGIN {}-----\nHash: SHA1\n\n",
            ArmorMarker::SignedMessage.label()
        );
        for line in text.split('\n') {
            if line.starts_with('-') {
                signed.push_str("- ");
            }
            signed.push_str(line);
            signed.push('\n');
        }
        signed.push_str(&armor::enarmor_label(SIGNATURE_LABEL, &signature));
        Ok(signed)
    }

    fn verify(&mut self, signed_text: &str) -> Result<(Vec<SignatureInfo>, String), EngineError> {
        let plaintext = cleartext(signed_text)?;
        let bytes = armor::unarmor_label(signed_text, SIGNATURE_LABEL)
            .map_err(|error| invalid(error.to_string()))?;
        let packets = packet::parse_packets(&bytes).map_err(|error| invalid(error.to_string()))?;
        let signature = packets
            .first()
            .map(SignaturePacket::parse)
            .transpose()
            .map_err(|error| invalid(error.to_string()))?
            .context(OperationSnafu {
                message: "no signature found",
            })?;
        let fingerprint = signature.issuer_fingerprint.context(OperationSnafu {
            message: "signature carries no issuer fingerprint",
        })?;

        let valid = self
            .keys
            .get(&fingerprint)
            .is_some_and(|key| signature_packet(&key.info, &plaintext) == bytes);
        let info = SignatureInfo {
            fingerprint,
            valid,
            created: None,
        };
        Ok((vec![info], plaintext))
    }

    fn clear_encrypt_keys(&mut self) {
        self.encrypt_keys.clear();
    }

    fn clear_decrypt_keys(&mut self) {
        self.decrypt_keys.clear();
    }

    fn clear_sign_keys(&mut self) {
        self.sign_keys.clear();
    }
}

/// Recipients, optional signer, then the plaintext.
#[derive(Debug, PartialEq, Eq)]
struct Envelope {
    recipients: Vec<Fingerprint>,
    signer: Option<Fingerprint>,
    plaintext: String,
}

impl Envelope {
    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let count = u16::try_from(self.recipients.len())
            .ok()
            .context(OperationSnafu {
                message: "too many recipients",
            })?;

        let mut body = count.to_be_bytes().to_vec();
        for recipient in &self.recipients {
            body.extend_from_slice(recipient.as_bytes());
        }
        match &self.signer {
            Some(signer) => {
                body.push(1);
                body.extend_from_slice(signer.as_bytes());
            }
            None => body.push(0),
        }
        body.extend_from_slice(self.plaintext.as_bytes());

        let length = u32::try_from(body.len()).ok().context(OperationSnafu {
            message: "message too large",
        })?;
        let mut packet = vec![0xC0 | ENVELOPE_TAG, 0xFF];
        packet.extend_from_slice(&length.to_be_bytes());
        packet.extend(body);
        Ok(packet)
    }

    fn parse(text: &str) -> Result<Self, EngineError> {
        let bytes =
            armor::unarmor(text, ArmorMarker::Message).map_err(|error| invalid(error.to_string()))?;
        let packets = packet::parse_packets(&bytes).map_err(|error| invalid(error.to_string()))?;
        let body = packets
            .first()
            .filter(|packet| packet.tag == Tag::Other(ENVELOPE_TAG))
            .context(OperationSnafu {
                message: "not a message of this engine",
            })?;
        Self::decode(&body.body).context(OperationSnafu {
            message: "corrupted message",
        })
    }

    fn decode(mut data: &[u8]) -> Option<Self> {
        fn split<'a>(data: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
            let current: &'a [u8] = *data;
            if current.len() < len {
                return None;
            }
            let (head, tail) = current.split_at(len);
            *data = tail;
            Some(head)
        }
        fn fingerprint(data: &mut &[u8]) -> Option<Fingerprint> {
            Some(Fingerprint::from_bytes(split(data, 20)?.try_into().ok()?))
        }

        let count = split(&mut data, 2)?;
        let count = u16::from_be_bytes([count[0], count[1]]);
        let recipients = (0..count)
            .map(|_| fingerprint(&mut data))
            .collect::<Option<Vec<_>>>()?;
        let signer = match split(&mut data, 1)?[0] {
            0 => None,
            1 => Some(fingerprint(&mut data)?),
            _ => return None,
        };
        let plaintext = String::from_utf8(data.to_vec()).ok()?;

        Some(Self {
            recipients,
            signer,
            plaintext,
        })
    }
}

/// A v4 binary-document signature whose value is SHA-1(fingerprint || text).
fn signature_packet(key: &KeyInfo, text: &str) -> Vec<u8> {
    let fingerprint = key.fingerprint();
    let digest = Sha1::new()
        .chain_update(fingerprint.as_bytes())
        .chain_update(text.as_bytes())
        .finalize();

    let mut body = vec![4, 0x00, key.algorithm().id(), SHA1_ID];
    // hashed: issuer fingerprint
    body.extend_from_slice(&[0, 23, 22, 33, 4]);
    body.extend_from_slice(fingerprint.as_bytes());
    // unhashed: issuer
    body.extend_from_slice(&[0, 10, 9, 16]);
    body.extend_from_slice(fingerprint.key_id().as_bytes());
    body.extend_from_slice(&digest[..2]);
    body.extend_from_slice(&160u16.to_be_bytes());
    body.extend_from_slice(&digest);

    let mut packet = vec![0xC2, body.len() as u8];
    packet.extend(body);
    packet
}

/// The dash-unescaped text of a cleartext signed message.
fn cleartext(signed: &str) -> Result<String, EngineError> {
    let signed = signed.replace("\r\n", "\n");
    let header = format!("-----BEGIN {}-----\n", ArmorMarker::SignedMessage.label());
    let footer = format!("\n-----BEGIN {SIGNATURE_LABEL}-----");

    let text = signed
        .find(&header)
        .map(|start| start + header.len())
        .and_then(|start| Some(start + signed[start..].find("\n\n")? + 2))
        .and_then(|body| Some(&signed[body..body + signed[body..].find(&footer)?]))
        .context(OperationSnafu {
            message: "not a cleartext signed message",
        })?;

    Ok(text
        .split('\n')
        .map(|line| line.strip_prefix("- ").unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE_PUBLIC: &str = include_str!("../../tests/fixtures/alice_public.asc");
    const ALICE_PRIVATE: &str = include_str!("../../tests/fixtures/alice_private.asc");
    const BOB_PUBLIC: &str = include_str!("../../tests/fixtures/bob_public.asc");
    const BOB_PRIVATE: &str = include_str!("../../tests/fixtures/bob_private.asc");
    const SIGNED_BY_BOB: &str = include_str!("../../tests/fixtures/signed_by_bob.asc");

    fn alice() -> Fingerprint {
        "144BB5819C321070E2BE9FA256485ADB95AE6661".parse().unwrap()
    }

    fn bob() -> Fingerprint {
        "CC25E778A361F67E80D4A11BD4D49816891A9023".parse().unwrap()
    }

    fn engine() -> MemoryEngine {
        let mut engine = MemoryEngine::new().with_passphrase(bob(), "bob-passphrase");
        for key in [ALICE_PRIVATE, BOB_PRIVATE] {
            engine.import(key).unwrap();
        }
        engine
    }

    mod keyring {
        use super::*;

        #[test]
        fn import_reports_primary_fingerprint() {
            let mut engine = MemoryEngine::new();
            assert_eq!(engine.import(ALICE_PUBLIC).unwrap(), alice());
            assert_eq!(engine.import_count(), 1);

            let info = engine.key_info(&alice()).unwrap().unwrap();
            assert_eq!(info.fingerprint, alice());
            assert!(!info.has_secret);
            assert_eq!(info.uids, ["Alice Example <alice@example.com>"]);
            assert_eq!(engine.key_info(&bob()).unwrap(), None);
        }

        #[test]
        fn private_import_upgrades_public_key() {
            let mut engine = MemoryEngine::new();
            engine.import(BOB_PUBLIC).unwrap();
            engine.import(BOB_PRIVATE).unwrap();
            engine.import(BOB_PUBLIC).unwrap();
            assert!(engine.key_info(&bob()).unwrap().unwrap().has_secret);
            assert_eq!(engine.import_count(), 3);
        }

        #[test]
        fn garbage_import() {
            let mut engine = MemoryEngine::new();
            assert!(matches!(
                engine.import("not a key"),
                Err(EngineError::Operation { .. })
            ));
            assert_eq!(engine.import_count(), 0);
        }

        #[test]
        fn registration_failures() {
            let mut engine = MemoryEngine::new().with_passphrase(bob(), "bob-passphrase");
            engine.import(ALICE_PUBLIC).unwrap();

            assert!(matches!(
                engine.add_encrypt_key(&bob()),
                Err(EngineError::UnknownKey { .. })
            ));
            assert!(matches!(
                engine.add_decrypt_key(&alice(), ""),
                Err(EngineError::MissingSecretKey { .. })
            ));

            engine.import(BOB_PRIVATE).unwrap();
            assert!(matches!(
                engine.add_sign_key(&bob(), "wrong"),
                Err(EngineError::BadPassphrase { .. })
            ));
            engine.add_sign_key(&bob(), "bob-passphrase").unwrap();
        }
    }

    mod messages {
        use super::*;

        #[test]
        fn round_trip() {
            let mut engine = engine();
            engine.add_encrypt_key(&alice()).unwrap();
            let ciphertext = engine.encrypt("hello world").unwrap();
            assert!(armor::is_valid_message(&ciphertext));
            assert!(!ciphertext.contains("hello world"));

            engine.add_decrypt_key(&alice(), "").unwrap();
            assert_eq!(engine.decrypt(&ciphertext).unwrap(), "hello world");
        }

        #[test]
        fn wrong_recipient() {
            let mut engine = engine();
            engine.add_encrypt_key(&alice()).unwrap();
            let ciphertext = engine.encrypt("hello").unwrap();

            engine.add_decrypt_key(&bob(), "bob-passphrase").unwrap();
            assert!(matches!(
                engine.decrypt(&ciphertext),
                Err(EngineError::Operation { .. })
            ));
        }

        #[test]
        fn requires_registered_keys() {
            let mut engine = engine();
            assert!(matches!(
                engine.encrypt("hello"),
                Err(EngineError::NoKeySet {
                    role: Role::Encrypt
                })
            ));
            engine.add_encrypt_key(&alice()).unwrap();
            assert!(matches!(
                engine.encrypt_and_sign("hello"),
                Err(EngineError::NoKeySet { role: Role::Sign })
            ));

            let ciphertext = engine.encrypt("hello").unwrap();
            engine.clear_encrypt_keys();
            assert!(engine.encrypt("hello").is_err());
            assert!(matches!(
                engine.decrypt(&ciphertext),
                Err(EngineError::NoKeySet {
                    role: Role::Decrypt
                })
            ));
        }

        #[test]
        fn signed_envelope() {
            let mut engine = engine();
            engine.add_encrypt_key(&alice()).unwrap();
            engine.add_sign_key(&bob(), "bob-passphrase").unwrap();
            let ciphertext = engine.encrypt_and_sign("attack at dawn").unwrap();

            engine.add_decrypt_key(&alice(), "").unwrap();
            let (plaintext, signatures) = engine.decrypt_and_verify(&ciphertext).unwrap();
            assert_eq!(plaintext, "attack at dawn");
            assert_eq!(
                signatures,
                [SignatureInfo {
                    fingerprint: bob(),
                    valid: true,
                    created: None
                }]
            );

            let unsigned = engine.encrypt("quiet").unwrap();
            assert!(engine.decrypt_and_verify(&unsigned).unwrap().1.is_empty());
        }

        #[test]
        fn foreign_messages() {
            let mut engine = engine();
            engine.add_decrypt_key(&alice(), "").unwrap();
            let gpg = include_str!("../../tests/fixtures/message_to_alice.asc");
            assert!(engine.decrypt(gpg).is_err());
            assert!(engine.decrypt("hello").is_err());
        }
    }

    mod signatures {
        use super::*;

        #[test]
        fn sign_then_verify() {
            let mut engine = engine();
            engine.add_sign_key(&bob(), "bob-passphrase").unwrap();
            let text = "first line\n-- dashed\n\nlast";
            let signed = engine.sign(text).unwrap();
            assert!(armor::is_parsable_armored_signed_message(&signed));
            assert!(signed.contains("\n- -- dashed\n"));

            let (signatures, plaintext) = engine.verify(&signed).unwrap();
            assert_eq!(plaintext, text);
            assert_eq!(signatures.len(), 1);
            assert_eq!(signatures[0].fingerprint, bob());
            assert!(signatures[0].valid);
        }

        #[test]
        fn tampered_text_is_invalid() {
            let mut engine = engine();
            engine.add_sign_key(&alice(), "").unwrap();
            let signed = engine.sign("pay 10").unwrap().replace("pay 10", "pay 99");

            let (signatures, plaintext) = engine.verify(&signed).unwrap();
            assert_eq!(plaintext, "pay 99");
            assert_eq!(signatures[0].fingerprint, alice());
            assert!(!signatures[0].valid);
        }

        #[test]
        fn unknown_signer_is_invalid() {
            let mut signer = engine();
            signer.add_sign_key(&alice(), "").unwrap();
            let signed = signer.sign("hello").unwrap();

            let mut verifier = MemoryEngine::new();
            let (signatures, _) = verifier.verify(&signed).unwrap();
            assert!(!signatures[0].valid);
        }

        #[test]
        fn gnupg_signature_is_read_but_not_trusted() {
            let mut engine = engine();
            let (signatures, plaintext) = engine.verify(SIGNED_BY_BOB).unwrap();
            assert_eq!(plaintext, "signed by bob");
            assert_eq!(signatures[0].fingerprint, bob());
            assert!(!signatures[0].valid);
        }

        #[test]
        fn sign_requires_key() {
            let mut engine = engine();
            assert!(matches!(
                engine.sign("hello"),
                Err(EngineError::NoKeySet { role: Role::Sign })
            ));
            engine.add_sign_key(&alice(), "").unwrap();
            engine.clear_sign_keys();
            assert!(engine.sign("hello").is_err());
        }
    }
}
