use crate::fingerprint::Fingerprint;
use std::fmt;

/// What a bound key is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Encrypt, Role::Decrypt, Role::Sign, Role::Verify];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Encrypt => "encrypt",
            Role::Decrypt => "decrypt",
            Role::Sign => "sign",
            Role::Verify => "verify",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One optional fingerprint per [`Role`]. Slots never influence each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleBindings {
    encrypt: Option<Fingerprint>,
    decrypt: Option<Fingerprint>,
    sign: Option<Fingerprint>,
    verify: Option<Fingerprint>,
}

impl RoleBindings {
    fn slot(&self, role: Role) -> &Option<Fingerprint> {
        match role {
            Role::Encrypt => &self.encrypt,
            Role::Decrypt => &self.decrypt,
            Role::Sign => &self.sign,
            Role::Verify => &self.verify,
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<Fingerprint> {
        match role {
            Role::Encrypt => &mut self.encrypt,
            Role::Decrypt => &mut self.decrypt,
            Role::Sign => &mut self.sign,
            Role::Verify => &mut self.verify,
        }
    }

    pub fn get(&self, role: Role) -> Option<Fingerprint> {
        *self.slot(role)
    }

    pub fn is_bound(&self, role: Role) -> bool {
        self.slot(role).is_some()
    }

    /// Bind `fingerprint`, replacing whatever was bound. Returns the previous binding.
    pub fn bind(&mut self, role: Role, fingerprint: Fingerprint) -> Option<Fingerprint> {
        self.slot_mut(role).replace(fingerprint)
    }

    pub fn clear(&mut self, role: Role) -> Option<Fingerprint> {
        self.slot_mut(role).take()
    }

    pub fn clear_all(&mut self) {
        *self = Self::default();
    }

    /// Roles currently bound, in [`Role::ALL`] order.
    pub fn bound(&self) -> impl Iterator<Item = (Role, Fingerprint)> + '_ {
        Role::ALL
            .into_iter()
            .filter_map(|role| self.get(role).map(|fingerprint| (role, fingerprint)))
    }
}
