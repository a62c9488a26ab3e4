//! Key layout for the metadata store.
//!
//! Keys are printable and zero-padded so that byte order equals the order
//! queries need: volumes by id, slots by (volume, index), cursors by name.

use keep_types::{FileContractId, Hash256};

pub const VOLUME_PREFIX: &[u8] = b"volume:";
pub const SLOT_PREFIX: &[u8] = b"slot:";
pub const SECTOR_PREFIX: &[u8] = b"sector:";
pub const CONTRACT_PREFIX: &[u8] = b"contract:";
pub const ROOTS_PREFIX: &[u8] = b"roots:";
pub const TEMP_PREFIX: &[u8] = b"temp:";
pub const CURSOR_PREFIX: &[u8] = b"cursor:";
pub const LOCKED_PREFIX: &[u8] = b"locked:";

pub const DB_VERSION_KEY: &[u8] = b"meta:db_version";
pub const HOST_KEY_KEY: &[u8] = b"meta:host_key";
pub const NEXT_VOLUME_ID_KEY: &[u8] = b"meta:next_volume_id";

pub fn volume_key(id: u32) -> Vec<u8> {
    format!("volume:{id:08x}").into_bytes()
}

pub fn slot_key(volume: u32, index: u64) -> Vec<u8> {
    format!("slot:{volume:08x}:{index:016x}").into_bytes()
}

pub fn slot_prefix(volume: u32) -> Vec<u8> {
    format!("slot:{volume:08x}:").into_bytes()
}

pub fn sector_key(root: &Hash256) -> Vec<u8> {
    format!("sector:{}", root.to_hex()).into_bytes()
}

pub fn contract_key(id: &FileContractId) -> Vec<u8> {
    format!("contract:{}", id.to_hex()).into_bytes()
}

pub fn roots_key(id: &FileContractId) -> Vec<u8> {
    format!("roots:{}", id.to_hex()).into_bytes()
}

pub fn temp_key(root: &Hash256) -> Vec<u8> {
    format!("temp:{}", root.to_hex()).into_bytes()
}

pub fn cursor_key(subscriber: &str) -> Vec<u8> {
    format!("cursor:{subscriber}").into_bytes()
}

pub fn locked_key(volume: u32, index: u64) -> Vec<u8> {
    format!("locked:{volume:08x}:{index:016x}").into_bytes()
}

/// Parses the `(volume, index)` encoded in a slot key.
pub fn parse_slot_key(key: &[u8]) -> Option<(u32, u64)> {
    let rest = key.strip_prefix(SLOT_PREFIX)?;
    let rest = std::str::from_utf8(rest).ok()?;
    let (volume, index) = rest.split_once(':')?;
    Some((
        u32::from_str_radix(volume, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

/// Parses the contract id encoded in a roots key.
pub fn parse_roots_key(key: &[u8]) -> Option<FileContractId> {
    let rest = key.strip_prefix(ROOTS_PREFIX)?;
    FileContractId::from_hex(std::str::from_utf8(rest).ok()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_keys_order_by_volume_then_index() {
        assert!(slot_key(0, 5) < slot_key(0, 6));
        assert!(slot_key(0, u64::MAX) < slot_key(1, 0));
    }

    #[test]
    fn slot_key_round_trip() {
        let key = slot_key(7, 123_456);
        assert_eq!(parse_slot_key(&key), Some((7, 123_456)));
    }
}
