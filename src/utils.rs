//! Utility functions for identifiers and key display

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique time-ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

// first eight hex characters, enough to tell keys apart in logs
pub fn short_hex(bytes: &[u8]) -> String {
    let mut encoded = hex::encode(bytes);
    encoded.truncate(8);
    encoded
}
