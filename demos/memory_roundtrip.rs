//! Run this example with the following command in a terminal:
//!
//! ```console
//! $ cargo run --example memory_roundtrip --features="memory-engine"
//! ```

use openpgp_roles::{MemoryEngine, OpenPgp};

const ALICE_PUBLIC: &str = include_str!("../tests/fixtures/alice_public.asc");
const ALICE_PRIVATE: &str = include_str!("../tests/fixtures/alice_private.asc");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // No keyring on disk, keys are imported on first use
    let mut gpg = OpenPgp::new(MemoryEngine::new());

    let alice = gpg.set_encrypt_key(ALICE_PUBLIC)?;
    let ciphertext = gpg.encrypt("meet me at noon", false)?;
    println!("{ciphertext}");

    // The decrypt slot is consumed by each decryption
    gpg.set_decrypt_key(ALICE_PRIVATE, "")?;
    let plaintext = gpg.decrypt(&ciphertext, false)?;
    println!("{alice} decrypted: {plaintext}");

    Ok(())
}
