pub mod armor;
mod binder;
mod config;
pub mod engine;
mod facade;
mod fingerprint;
mod gnupg;
mod key_info;
pub mod packet;
mod roles;
mod timestamp;

pub use armor::ArmorMarker;
pub use config::{GpgConfig, ServerKeyConfig};
pub use engine::{Engine, EngineKeyInfo, SignatureInfo};
pub use facade::{OpenPgp, Verified};
pub use fingerprint::{Fingerprint, KeyId};
pub use gnupg::GnupgEngine;
pub use key_info::{get_key_info, get_public_key_info, KeyInfo};
pub use packet::PublicKeyAlgorithm;
pub use roles::{Role, RoleBindings};

#[cfg(feature = "memory-engine")]
pub use engine::memory::MemoryEngine;

pub mod error {
    pub use crate::armor::ArmorError;
    pub use crate::config::ConfigError;
    pub use crate::engine::EngineError;
    pub use crate::facade::{Error, ServerKeyError};
    pub use crate::fingerprint::FingerprintError;
    pub use crate::key_info::KeyInfoError;
    pub use crate::packet::PacketError;
    pub use crate::timestamp::TimestampError;
}
