//! Just enough of the OpenPGP packet grammar (RFC 4880 / RFC 9580) to read key
//! metadata. No key material is ever interpreted, only measured.

use crate::fingerprint::{Fingerprint, KeyId};
use sha1::{Digest, Sha1};
use snafu::{ensure, OptionExt, Snafu};
use std::borrow::Cow;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PacketError {
    #[snafu(display("truncated {what}"))]
    Truncated { what: &'static str },
    #[snafu(display("invalid packet header at offset {offset}"))]
    InvalidHeader { offset: usize },
    #[snafu(display("no OpenPGP packet found"))]
    Empty,
    #[snafu(display("expected {expected:?} packet, found {found:?}"))]
    UnexpectedPacket { expected: Tag, found: Tag },
    #[snafu(display("unsupported packet version {version}"))]
    UnsupportedVersion { version: u8 },
    #[snafu(display("unsupported public key algorithm {algorithm}"))]
    UnsupportedAlgorithm { algorithm: u8 },
    #[snafu(display("public key of {length} bytes does not fit a v4 fingerprint"))]
    KeyTooLarge { length: usize },
}

/// Packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    PublicKeyEncryptedSessionKey,
    Signature,
    SymKeyEncryptedSessionKey,
    OnePassSignature,
    SecretKey,
    PublicKey,
    SecretSubkey,
    CompressedData,
    LiteralData,
    UserId,
    PublicSubkey,
    UserAttribute,
    SymEncryptedIntegrityProtectedData,
    Other(u8),
}

impl From<u8> for Tag {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::PublicKeyEncryptedSessionKey,
            2 => Self::Signature,
            3 => Self::SymKeyEncryptedSessionKey,
            4 => Self::OnePassSignature,
            5 => Self::SecretKey,
            6 => Self::PublicKey,
            7 => Self::SecretSubkey,
            8 => Self::CompressedData,
            11 => Self::LiteralData,
            13 => Self::UserId,
            14 => Self::PublicSubkey,
            17 => Self::UserAttribute,
            18 => Self::SymEncryptedIntegrityProtectedData,
            other => Self::Other(other),
        }
    }
}

impl Tag {
    pub fn is_subkey(&self) -> bool {
        matches!(self, Self::PublicSubkey | Self::SecretSubkey)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub tag: Tag,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn user_id(&self) -> Option<String> {
        (self.tag == Tag::UserId).then(|| String::from_utf8_lossy(&self.body).into_owned())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], PacketError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .context(TruncatedSnafu { what })?;
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, PacketError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, PacketError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, PacketError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Multiprecision integer: bit count, then the big-endian magnitude.
    fn mpi(&mut self) -> Result<&'a [u8], PacketError> {
        let bits = usize::from(self.u16("mpi length")?);
        self.take(bits.div_ceil(8), "mpi")
    }

    /// Length-prefixed field: curve OIDs and KDF parameters.
    fn short_field(&mut self, what: &'static str) -> Result<&'a [u8], PacketError> {
        let len = usize::from(self.u8(what)?);
        self.take(len, what)
    }
}

/// Split a binary OpenPGP stream into packets; at least one must be present.
pub fn parse_packets(data: &[u8]) -> Result<Vec<Packet>, PacketError> {
    let mut reader = Reader::new(data);
    let mut packets = Vec::new();
    while !reader.is_empty() {
        packets.push(read_packet(&mut reader)?);
    }
    ensure!(!packets.is_empty(), EmptySnafu);
    Ok(packets)
}

fn read_packet(reader: &mut Reader<'_>) -> Result<Packet, PacketError> {
    let offset = reader.offset;
    let ctb = reader.u8("packet header")?;
    ensure!(ctb & 0x80 != 0, InvalidHeaderSnafu { offset });

    // New format: 6-bit tag, variable length with partial body chunks
    if ctb & 0x40 != 0 {
        let tag = Tag::from(ctb & 0x3f);
        let mut body = Vec::new();
        loop {
            let first = reader.u8("packet length")?;
            let (len, partial) = match first {
                0..=191 => (usize::from(first), false),
                192..=223 => {
                    let second = reader.u8("packet length")?;
                    ((usize::from(first - 192) << 8) + usize::from(second) + 192, false)
                }
                255 => (reader.u32("packet length")? as usize, false),
                _ => (1usize << (first & 0x1f), true),
            };
            body.extend_from_slice(reader.take(len, "packet body")?);
            if !partial {
                return Ok(Packet { tag, body });
            }
        }
    }

    // Old format: 4-bit tag, length size in the low bits
    let tag = Tag::from((ctb >> 2) & 0x0f);
    let len = match ctb & 0x03 {
        0 => usize::from(reader.u8("packet length")?),
        1 => usize::from(reader.u16("packet length")?),
        2 => reader.u32("packet length")? as usize,
        _ => reader.remaining(),
    };
    let body = reader.take(len, "packet body")?.to_vec();
    Ok(Packet { tag, body })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicKeyAlgorithm {
    Rsa,
    RsaEncryptOnly,
    RsaSignOnly,
    Elgamal,
    Dsa,
    Ecdh,
    Ecdsa,
    ElgamalEncryptSign,
    EdDsaLegacy,
    X25519,
    X448,
    Ed25519,
    Ed448,
    Unknown(u8),
}

impl From<u8> for PublicKeyAlgorithm {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Rsa,
            2 => Self::RsaEncryptOnly,
            3 => Self::RsaSignOnly,
            16 => Self::Elgamal,
            17 => Self::Dsa,
            18 => Self::Ecdh,
            19 => Self::Ecdsa,
            20 => Self::ElgamalEncryptSign,
            22 => Self::EdDsaLegacy,
            25 => Self::X25519,
            26 => Self::X448,
            27 => Self::Ed25519,
            28 => Self::Ed448,
            other => Self::Unknown(other),
        }
    }
}

impl PublicKeyAlgorithm {
    pub fn id(&self) -> u8 {
        match self {
            Self::Rsa => 1,
            Self::RsaEncryptOnly => 2,
            Self::RsaSignOnly => 3,
            Self::Elgamal => 16,
            Self::Dsa => 17,
            Self::Ecdh => 18,
            Self::Ecdsa => 19,
            Self::ElgamalEncryptSign => 20,
            Self::EdDsaLegacy => 22,
            Self::X25519 => 25,
            Self::X448 => 26,
            Self::Ed25519 => 27,
            Self::Ed448 => 28,
            Self::Unknown(id) => *id,
        }
    }

    /// Family name, the way key listings show it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rsa | Self::RsaEncryptOnly | Self::RsaSignOnly => "RSA",
            Self::Elgamal | Self::ElgamalEncryptSign => "ELGAMAL",
            Self::Dsa => "DSA",
            Self::Ecdh => "ECDH",
            Self::Ecdsa => "ECDSA",
            Self::EdDsaLegacy => "EdDSA",
            Self::X25519 => "X25519",
            Self::X448 => "X448",
            Self::Ed25519 => "Ed25519",
            Self::Ed448 => "Ed448",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Serialized form: the family name, except for the flavours that would
    /// otherwise collapse into their family.
    fn serde_name(&self) -> Cow<'static, str> {
        match self {
            Self::RsaEncryptOnly => "RSA-E".into(),
            Self::RsaSignOnly => "RSA-S".into(),
            Self::ElgamalEncryptSign => "ELGAMAL-ES".into(),
            Self::Unknown(id) => format!("unknown-{id}").into(),
            other => other.name().into(),
        }
    }

    fn from_serde_name(name: &str) -> Option<Self> {
        if let Some(id) = name.strip_prefix("unknown-") {
            return id.parse::<u8>().ok().map(Self::from);
        }
        let algorithm = match name {
            "RSA" => Self::Rsa,
            "RSA-E" => Self::RsaEncryptOnly,
            "RSA-S" => Self::RsaSignOnly,
            "ELGAMAL" => Self::Elgamal,
            "ELGAMAL-ES" => Self::ElgamalEncryptSign,
            "DSA" => Self::Dsa,
            "ECDH" => Self::Ecdh,
            "ECDSA" => Self::Ecdsa,
            "EdDSA" => Self::EdDsaLegacy,
            "X25519" => Self::X25519,
            "X448" => Self::X448,
            "Ed25519" => Self::Ed25519,
            "Ed448" => Self::Ed448,
            _ => return None,
        };
        Some(algorithm)
    }
}

impl fmt::Display for PublicKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl serde::Serialize for PublicKeyAlgorithm {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.serde_name())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKeyAlgorithm {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::from_serde_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown algorithm `{name}`")))
    }
}

/// Curve OIDs (RFC 9580 section 9.2) and the size reported for them.
const CURVES: &[(&[u8], u32)] = &[
    // Ed25519Legacy
    (&[0x2B, 0x06, 0x01, 0x04, 0x01, 0xDA, 0x47, 0x0F, 0x01], 255),
    // Curve25519Legacy
    (&[0x2B, 0x06, 0x01, 0x04, 0x01, 0x97, 0x55, 0x01, 0x05, 0x01], 255),
    // NIST P-256
    (&[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07], 256),
    // NIST P-384
    (&[0x2B, 0x81, 0x04, 0x00, 0x22], 384),
    // NIST P-521
    (&[0x2B, 0x81, 0x04, 0x00, 0x23], 521),
    // secp256k1
    (&[0x2B, 0x81, 0x04, 0x00, 0x0A], 256),
    // brainpoolP256r1
    (&[0x2B, 0x24, 0x03, 0x03, 0x02, 0x08, 0x01, 0x01, 0x07], 256),
    // brainpoolP384r1
    (&[0x2B, 0x24, 0x03, 0x03, 0x02, 0x08, 0x01, 0x01, 0x0B], 384),
    // brainpoolP512r1
    (&[0x2B, 0x24, 0x03, 0x03, 0x02, 0x08, 0x01, 0x01, 0x0D], 512),
];

fn curve_bits(oid: &[u8]) -> u32 {
    CURVES
        .iter()
        .find(|(known, _)| *known == oid)
        .map_or(0, |(_, bits)| *bits)
}

/// Significant bits of a big-endian magnitude.
fn bit_length(bytes: &[u8]) -> u32 {
    match bytes.iter().position(|byte| *byte != 0) {
        Some(first) => {
            let significant = (bytes.len() - first) as u32;
            significant * 8 - bytes[first].leading_zeros()
        }
        None => 0,
    }
}

/// Walk the public key material and return the key size in bits.
fn read_key_material(
    reader: &mut Reader<'_>,
    algorithm: PublicKeyAlgorithm,
) -> Result<u32, PacketError> {
    use PublicKeyAlgorithm::*;

    let bits = match algorithm {
        Rsa | RsaEncryptOnly | RsaSignOnly => {
            let n = reader.mpi()?;
            reader.mpi()?;
            bit_length(n)
        }
        Elgamal | ElgamalEncryptSign => {
            let p = reader.mpi()?;
            reader.mpi()?;
            reader.mpi()?;
            bit_length(p)
        }
        Dsa => {
            let p = reader.mpi()?;
            for _ in 0..3 {
                reader.mpi()?;
            }
            bit_length(p)
        }
        Ecdh => {
            let oid = reader.short_field("curve oid")?;
            reader.mpi()?;
            reader.short_field("kdf parameters")?;
            curve_bits(oid)
        }
        Ecdsa | EdDsaLegacy => {
            let oid = reader.short_field("curve oid")?;
            reader.mpi()?;
            curve_bits(oid)
        }
        X25519 => {
            reader.take(32, "x25519 key")?;
            255
        }
        X448 => {
            reader.take(56, "x448 key")?;
            448
        }
        Ed25519 => {
            reader.take(32, "ed25519 key")?;
            255
        }
        Ed448 => {
            reader.take(57, "ed448 key")?;
            448
        }
        Unknown(algorithm) => return UnsupportedAlgorithmSnafu { algorithm }.fail(),
    };
    Ok(bits)
}

/// Public part of a (primary or sub) key packet. Secret key packets carry the
/// same public prefix, the secret part that follows is never read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPacket {
    pub tag: Tag,
    pub created: u32,
    pub algorithm: PublicKeyAlgorithm,
    pub bits: u32,
    pub fingerprint: Fingerprint,
}

impl KeyPacket {
    pub fn parse(packet: &Packet) -> Result<Self, PacketError> {
        ensure!(
            matches!(
                packet.tag,
                Tag::PublicKey | Tag::SecretKey | Tag::PublicSubkey | Tag::SecretSubkey
            ),
            UnexpectedPacketSnafu {
                expected: Tag::PublicKey,
                found: packet.tag
            }
        );

        let mut reader = Reader::new(&packet.body);
        let version = reader.u8("key version")?;
        ensure!(version == 4, UnsupportedVersionSnafu { version });
        let created = reader.u32("key creation time")?;
        let algorithm = PublicKeyAlgorithm::from(reader.u8("key algorithm")?);
        let bits = read_key_material(&mut reader, algorithm)?;

        let public = &packet.body[..reader.offset];
        let length = u16::try_from(public.len())
            .ok()
            .context(KeyTooLargeSnafu {
                length: public.len(),
            })?;

        let mut hasher = Sha1::new();
        hasher.update([0x99]);
        hasher.update(length.to_be_bytes());
        hasher.update(public);
        let digest = hasher.finalize();
        let mut fingerprint = [0u8; 20];
        fingerprint.copy_from_slice(&digest);

        Ok(Self {
            tag: packet.tag,
            created,
            algorithm,
            bits,
            fingerprint: Fingerprint::from_bytes(fingerprint),
        })
    }

    pub fn key_id(&self) -> KeyId {
        self.fingerprint.key_id()
    }

    pub fn is_secret(&self) -> bool {
        matches!(self.tag, Tag::SecretKey | Tag::SecretSubkey)
    }
}

/// Signature types that bind a user id or the key itself to the primary key.
const SELF_CERTIFICATIONS: &[u8] = &[0x10, 0x11, 0x12, 0x13, 0x1F];

mod subpacket {
    pub const CREATION_TIME: u8 = 2;
    pub const KEY_EXPIRATION_TIME: u8 = 9;
    pub const ISSUER: u8 = 16;
    pub const ISSUER_FINGERPRINT: u8 = 33;
}

/// The metadata of a signature packet; the signature value is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignaturePacket {
    pub signature_type: u8,
    pub created: Option<u32>,
    pub key_expiration: Option<u32>,
    pub issuer: Option<KeyId>,
    pub issuer_fingerprint: Option<Fingerprint>,
}

impl SignaturePacket {
    pub fn parse(packet: &Packet) -> Result<Self, PacketError> {
        ensure!(
            packet.tag == Tag::Signature,
            UnexpectedPacketSnafu {
                expected: Tag::Signature,
                found: packet.tag
            }
        );

        let mut reader = Reader::new(&packet.body);
        match reader.u8("signature version")? {
            3 => Self::parse_v3(&mut reader),
            4 => Self::parse_v4(&mut reader),
            version => UnsupportedVersionSnafu { version }.fail(),
        }
    }

    fn parse_v3(reader: &mut Reader<'_>) -> Result<Self, PacketError> {
        let hashed = reader.u8("signature hashed length")?;
        ensure!(hashed == 5, UnsupportedVersionSnafu { version: 3u8 });
        let signature_type = reader.u8("signature type")?;
        let created = reader.u32("signature creation time")?;
        let mut issuer = [0u8; 8];
        issuer.copy_from_slice(reader.take(8, "signature issuer")?);
        // algorithms and the left 16 bits of the hash
        reader.take(4, "signature header")?;

        Ok(Self {
            signature_type,
            created: Some(created),
            issuer: Some(KeyId::from_bytes(issuer)),
            ..Default::default()
        })
    }

    fn parse_v4(reader: &mut Reader<'_>) -> Result<Self, PacketError> {
        let mut signature = Self {
            signature_type: reader.u8("signature type")?,
            ..Default::default()
        };
        // public key and hash algorithms
        reader.take(2, "signature algorithms")?;

        let hashed_len = usize::from(reader.u16("hashed subpackets length")?);
        let hashed = reader.take(hashed_len, "hashed subpackets")?;
        let unhashed_len = usize::from(reader.u16("unhashed subpackets length")?);
        let unhashed = reader.take(unhashed_len, "unhashed subpackets")?;
        reader.take(2, "signature hash prefix")?;

        signature.read_subpackets(hashed, true)?;
        signature.read_subpackets(unhashed, false)?;
        Ok(signature)
    }

    fn read_subpackets(&mut self, area: &[u8], hashed: bool) -> Result<(), PacketError> {
        let mut reader = Reader::new(area);
        while !reader.is_empty() {
            let first = reader.u8("subpacket length")?;
            let len = match first {
                0..=191 => usize::from(first),
                192..=254 => {
                    let second = reader.u8("subpacket length")?;
                    (usize::from(first - 192) << 8) + usize::from(second) + 192
                }
                255 => reader.u32("subpacket length")? as usize,
            };
            ensure!(len > 0, TruncatedSnafu { what: "subpacket" });
            let kind = reader.u8("subpacket type")? & 0x7f;
            let data = reader.take(len - 1, "subpacket")?;

            match kind {
                subpacket::CREATION_TIME if hashed && data.len() == 4 => {
                    self.created = Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                subpacket::KEY_EXPIRATION_TIME if hashed && data.len() == 4 => {
                    self.key_expiration =
                        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                subpacket::ISSUER if data.len() == 8 => {
                    let mut issuer = [0u8; 8];
                    issuer.copy_from_slice(data);
                    self.issuer.get_or_insert(KeyId::from_bytes(issuer));
                }
                subpacket::ISSUER_FINGERPRINT if data.len() == 21 && data[0] == 4 => {
                    let mut fingerprint = [0u8; 20];
                    fingerprint.copy_from_slice(&data[1..]);
                    self.issuer_fingerprint
                        .get_or_insert(Fingerprint::from_bytes(fingerprint));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Key id of the issuer, from either issuer subpacket.
    pub fn issuer_key_id(&self) -> Option<KeyId> {
        self.issuer
            .or_else(|| self.issuer_fingerprint.map(|fingerprint| fingerprint.key_id()))
    }

    pub fn is_self_certification(&self, key: &KeyPacket) -> bool {
        SELF_CERTIFICATIONS.contains(&self.signature_type)
            && self
                .issuer_key_id()
                .map_or(true, |issuer| issuer == key.key_id())
    }
}

/// The key expiration offset of the newest self-certification on the primary
/// key, looking only at the packets before the first subkey.
pub fn primary_key_expiration(packets: &[Packet], key: &KeyPacket) -> Option<u32> {
    packets
        .iter()
        .take_while(|packet| !packet.tag.is_subkey())
        .filter(|packet| packet.tag == Tag::Signature)
        .filter_map(|packet| SignaturePacket::parse(packet).ok())
        .filter(|signature| signature.is_self_certification(key))
        .max_by_key(|signature| signature.created.unwrap_or(0))
        .and_then(|signature| signature.key_expiration)
}
