//! Run this example with the following command in a terminal:
//!
//! ```console
//! $ cargo run --example key_info < tests/fixtures/alice_public.asc
//! ```
//!
//! This example reads an armored public or private key on stdin and prints
//! what the key says about itself, in json.

use openpgp_roles::get_key_info;
use std::io::Read;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut armored = String::new();
    std::io::stdin().read_to_string(&mut armored)?;

    // Rejects anything that is not a key: messages, signatures, garbage
    let info = get_key_info(&armored)?;

    let json = serde_json::to_string_pretty(&info)?;
    println!("{json}");

    Ok(())
}
