//! Minimal ABI helpers for the platform contract.
//!
//! The contract surface used by this service is small and fixed (a handful
//! of view functions and one event), so calldata is built and decoded by
//! hand over 32-byte words rather than pulling in a full ABI codec.

use lode_loyalty_core::{Error, Result};
use primitive_types::U256;
use sha3::{Digest, Keccak256};

/// Compute the 4-byte function selector for a signature like
/// `"isRegistered(address)"`.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    digest[..4].try_into().expect("keccak output is 32 bytes")
}

/// Compute the topic-0 hash for an event signature, as a `0x` hex string.
pub fn event_topic(signature: &str) -> String {
    let digest = Keccak256::digest(signature.as_bytes());
    format!("0x{}", hex::encode(digest))
}

/// Left-pad an address to a 32-byte topic, as a `0x` hex string.
pub fn address_topic(address: &str) -> Result<String> {
    let body = strip_0x(address);
    if body.len() != 40 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidInput(format!("invalid address: {}", address)));
    }
    Ok(format!("0x{}{}", "0".repeat(24), body.to_ascii_lowercase()))
}

/// Build `0x`-prefixed calldata from a function signature and address
/// arguments (the only argument type this contract surface needs).
pub fn call_data(signature: &str, address_args: &[&str]) -> Result<String> {
    let mut data = format!("0x{}", hex::encode(selector(signature)));
    for arg in address_args {
        let body = strip_0x(arg);
        if body.len() != 40 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!("invalid address: {}", arg)));
        }
        data.push_str(&"0".repeat(24));
        data.push_str(&body.to_ascii_lowercase());
    }
    Ok(data)
}

/// Strip an optional `0x` prefix.
pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

/// Decode a hex string (with or without `0x`) into bytes.
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(strip_0x(s)).map_err(|e| Error::InvalidInput(format!("invalid hex: {}", e)))
}

/// Parse a JSON-RPC quantity (`"0x1a"`) into a u64.
pub fn parse_quantity(s: &str) -> Result<u64> {
    u64::from_str_radix(strip_0x(s), 16)
        .map_err(|e| Error::ChainRead(format!("invalid quantity {}: {}", s, e)))
}

/// Get the i-th 32-byte word of ABI-encoded data.
pub fn word(data: &[u8], index: usize) -> Result<&[u8]> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return Err(Error::ChainRead(format!(
            "ABI data too short: want word {}, have {} bytes",
            index,
            data.len()
        )));
    }
    Ok(&data[start..end])
}

/// Decode a word as a bool.
pub fn decode_bool(word: &[u8]) -> bool {
    word.iter().any(|b| *b != 0)
}

/// Decode a word as a U256.
pub fn decode_u256(word: &[u8]) -> U256 {
    U256::from_big_endian(word)
}

/// Decode a word as a lower-case `0x` address (last 20 bytes).
pub fn decode_address(word: &[u8]) -> String {
    format!("0x{}", hex::encode(&word[12..32]))
}

/// Decode a dynamically-encoded string return value.
///
/// Layout: word 0 is the offset to the string head, which holds a length
/// word followed by the UTF-8 bytes.
pub fn decode_string(data: &[u8]) -> Result<String> {
    let offset = decode_u256(word(data, 0)?);
    if offset > U256::from(data.len()) {
        return Err(Error::ChainRead("string offset out of range".to_string()));
    }
    let offset = offset.as_usize();

    if data.len() < offset + 32 {
        return Err(Error::ChainRead("string head out of range".to_string()));
    }
    let len = decode_u256(&data[offset..offset + 32]);
    if len > U256::from(data.len()) {
        return Err(Error::ChainRead("string length out of range".to_string()));
    }
    let len = len.as_usize();

    let start = offset + 32;
    if data.len() < start + len {
        return Err(Error::ChainRead("string body out of range".to_string()));
    }

    String::from_utf8(data[start..start + len].to_vec())
        .map_err(|_| Error::ChainRead("string is not valid UTF-8".to_string()))
}
