//! ASCII armor: markers, unarmoring and the non-throwing validity probes.
//!
//! Nothing in here talks to an engine. The probes are the gate every piece of
//! untrusted armored text goes through before it is handed to one.

use crate::packet::{self, KeyPacket, SignaturePacket, Tag};
use base64ct::{Base64, Encoding};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::fmt;

const BEGIN: &str = "-----BEGIN ";
const DASHES: &str = "-----";
const LINE_WIDTH: usize = 64;

/// Label of the detached block trailing a cleartext signed message.
pub const SIGNATURE_LABEL: &str = "PGP SIGNATURE";

/// Kind of OpenPGP object inside an armored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArmorMarker {
    PublicKey,
    PrivateKey,
    Message,
    SignedMessage,
}

impl ArmorMarker {
    pub const fn label(&self) -> &'static str {
        match self {
            Self::PublicKey => "PGP PUBLIC KEY BLOCK",
            Self::PrivateKey => "PGP PRIVATE KEY BLOCK",
            Self::Message => "PGP MESSAGE",
            Self::SignedMessage => "PGP SIGNED MESSAGE",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        [
            Self::PublicKey,
            Self::PrivateKey,
            Self::Message,
            Self::SignedMessage,
        ]
        .into_iter()
        .find(|marker| marker.label() == label)
    }
}

impl fmt::Display for ArmorMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArmorError {
    #[snafu(display("no OpenPGP marker found"))]
    MarkerNotFound,
    #[snafu(display("unsupported OpenPGP marker `{label}`"))]
    UnsupportedMarker { label: String },
    #[snafu(display("expected marker `{expected}`, found `{found}`"))]
    WrongMarker {
        expected: ArmorMarker,
        found: ArmorMarker,
    },
    #[snafu(display("no `{label}` header found"))]
    HeaderNotFound { label: String },
    #[snafu(display("armored block has no body"))]
    MissingBody,
    #[snafu(display("armored block has no checksum"))]
    MissingChecksum,
    #[snafu(display("decoding base64"))]
    Base64 { source: base64ct::Error },
}

/// Find the marker of the first `-----BEGIN ...-----` line.
pub fn get_marker(armored: &str) -> Result<ArmorMarker, ArmorError> {
    let label = armored
        .lines()
        .filter_map(|line| line.trim().strip_prefix(BEGIN)?.strip_suffix(DASHES))
        .next()
        .context(MarkerNotFoundSnafu)?;

    ArmorMarker::from_label(label).context(UnsupportedMarkerSnafu { label })
}

pub fn assert_marker(armored: &str, expected: ArmorMarker) -> Result<(), ArmorError> {
    let found = get_marker(armored)?;
    ensure!(found == expected, WrongMarkerSnafu { expected, found });
    Ok(())
}

/// Decode the body of the `expected` block.
///
/// A block without a `=XXXX` checksum line is rejected even when the body
/// itself would decode.
pub fn unarmor(text: &str, expected: ArmorMarker) -> Result<Vec<u8>, ArmorError> {
    unarmor_label(text, expected.label())
}

pub(crate) fn unarmor_label(text: &str, label: &str) -> Result<Vec<u8>, ArmorError> {
    let header = format!("{BEGIN}{label}{DASHES}");
    let text = text.replace("\r\n", "\n").replace('\r', "");

    let start = text.find(&header).context(HeaderNotFoundSnafu { label })? + header.len();
    let body = start + text[start..].find("\n\n").context(MissingBodySnafu)? + 2;
    let end = body + text[body..].find("\n=").context(MissingChecksumSnafu)?;

    let encoded: String = text[body..end].split_whitespace().collect();
    Base64::decode_vec(&encoded).context(Base64Snafu)
}

/// Armor `data` as a `marker` block, with a CRC-24 checksum line.
pub fn enarmor(marker: ArmorMarker, data: &[u8]) -> String {
    enarmor_label(marker.label(), data)
}

pub(crate) fn enarmor_label(label: &str, data: &[u8]) -> String {
    let encoded = Base64::encode_string(data);
    let checksum = crc24(data).to_be_bytes();

    let mut armored = format!("{BEGIN}{label}{DASHES}\n\n");
    // base64 output is ASCII, splitting on byte boundaries is safe
    for line in encoded.as_bytes().chunks(LINE_WIDTH) {
        armored.push_str(&String::from_utf8_lossy(line));
        armored.push('\n');
    }
    armored.push('=');
    armored.push_str(&Base64::encode_string(&checksum[1..]));
    armored.push_str(&format!("\n-----END {label}{DASHES}\n"));
    armored
}

/// The OpenPGP armor checksum (RFC 4880, section 6.1).
pub fn crc24(data: &[u8]) -> u32 {
    const INIT: u32 = 0x00B7_04CE;
    const POLY: u32 = 0x0186_4CFB;

    let mut crc = INIT;
    for byte in data {
        crc ^= u32::from(*byte) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}

fn parsable_key(text: &str, marker: ArmorMarker, tag: Tag) -> Option<KeyPacket> {
    assert_marker(text, marker).ok()?;
    let bytes = unarmor(text, marker).ok()?;
    let packets = packet::parse_packets(&bytes).ok()?;
    let first = packets.first().filter(|packet| packet.tag == tag)?;
    KeyPacket::parse(first).ok()
}

pub fn is_parsable_armored_public_key(text: &str) -> bool {
    parsable_key(text, ArmorMarker::PublicKey, Tag::PublicKey).is_some()
}

pub fn is_parsable_armored_private_key(text: &str) -> bool {
    parsable_key(text, ArmorMarker::PrivateKey, Tag::SecretKey).is_some()
}

/// A cleartext signed message is parsable when its trailing signature block is.
pub fn is_parsable_armored_signed_message(text: &str) -> bool {
    let signature = || -> Option<SignaturePacket> {
        assert_marker(text, ArmorMarker::SignedMessage).ok()?;
        let bytes = unarmor_label(text, SIGNATURE_LABEL).ok()?;
        let packets = packet::parse_packets(&bytes).ok()?;
        SignaturePacket::parse(packets.first()?).ok()
    };
    signature().is_some()
}

pub fn is_valid_message(text: &str) -> bool {
    assert_marker(text, ArmorMarker::Message).is_ok()
        && unarmor(text, ArmorMarker::Message)
            .ok()
            .and_then(|bytes| packet::parse_packets(&bytes).ok())
            .is_some()
}
