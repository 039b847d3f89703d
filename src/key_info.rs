use crate::armor::{self, ArmorError};
use crate::fingerprint::{Fingerprint, KeyId};
use crate::packet::{self, KeyPacket, PacketError, PublicKeyAlgorithm, Tag};
use crate::timestamp::{self, TimestampError};
use jiff::Timestamp;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

/// Metadata read structurally from an armored key, without any engine.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeyInfo {
    fingerprint: Fingerprint,
    key_id: KeyId,
    bits: u32,
    algorithm: PublicKeyAlgorithm,
    created: Timestamp,
    expires: Option<Timestamp>,
    uid: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum KeyInfoError {
    #[snafu(display("invalid key, no OpenPGP public key packet found"))]
    Armor { source: ArmorError },
    #[snafu(display("invalid key, no OpenPGP public key packet found"))]
    Packet { source: PacketError },
    #[snafu(display("invalid key, no user ID found"))]
    NoUserId,
    #[snafu(display("could not parse the OpenPGP public key"))]
    NotAKey,
    #[snafu(display("invalid key time field"))]
    Timestamp { source: TimestampError },
}

impl KeyInfo {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn algorithm(&self) -> PublicKeyAlgorithm {
        self.algorithm
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn expires(&self) -> Option<Timestamp> {
        self.expires
    }

    /// The first user id of the key, usually `Name (comment) <email>`
    pub fn uid(&self) -> &str {
        &self.uid
    }
}

/// Read the primary key metadata of any armored key block, public or private.
pub fn get_key_info(armored_key: &str) -> Result<KeyInfo, KeyInfoError> {
    let marker = armor::get_marker(armored_key).context(ArmorSnafu)?;
    let bytes = armor::unarmor(armored_key, marker).context(ArmorSnafu)?;
    let packets = packet::parse_packets(&bytes).context(PacketSnafu)?;

    // Subkeys parse as key packets too, but cannot open a key block
    let primary = packets.first().context(NotAKeySnafu)?;
    if !matches!(primary.tag, Tag::PublicKey | Tag::SecretKey) {
        return Err(KeyInfoError::Packet {
            source: PacketError::UnexpectedPacket {
                expected: Tag::PublicKey,
                found: primary.tag,
            },
        });
    }
    let key = KeyPacket::parse(primary).context(PacketSnafu)?;

    let uid = packets[1..]
        .iter()
        .find_map(packet::Packet::user_id)
        .context(NoUserIdSnafu)?;

    let expires = packet::primary_key_expiration(&packets[1..], &key)
        .map(|offset| timestamp::expiration(key.created, offset))
        .transpose()
        .context(TimestampSnafu)?
        .flatten();

    Ok(KeyInfo {
        fingerprint: key.fingerprint,
        key_id: key.key_id(),
        bits: key.bits,
        algorithm: key.algorithm,
        created: timestamp::from_epoch(key.created).context(TimestampSnafu)?,
        expires,
        uid,
    })
}

/// Like [`get_key_info`], but only for text that parses as a public key or a
/// private key (whose public half is still usable).
pub fn get_public_key_info(armored_key: &str) -> Result<KeyInfo, KeyInfoError> {
    ensure!(
        armor::is_parsable_armored_public_key(armored_key)
            || armor::is_parsable_armored_private_key(armored_key),
        NotAKeySnafu
    );
    get_key_info(armored_key)
}
