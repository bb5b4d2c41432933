//! Metabase keyspace layout
//!
//! Every key starts with a one-byte bucket prefix:
//! - `0x01 | addr` → [`IndexRecord`]
//! - `0x02 | epoch BE | addr` → object type tag (expiration index)
//! - `0x03 | addr` → [`Grave`] (graveyard)
//! - `0x04 | addr` → empty (garbage marks)
//! - `0x05 | member addr | locker oid` → empty (member → locker)
//! - `0x06 | locker addr | member oid` → empty (locker → member)
//! - `0x07 | name` → shard info values

use cairn_common::{Address, ContainerId, Epoch, Error, ID_SIZE, ObjectHeader, ObjectId, Result};
use serde::{Deserialize, Serialize};

pub const PRIMARY: u8 = 0x01;
pub const EXPIRATION: u8 = 0x02;
pub const GRAVEYARD: u8 = 0x03;
pub const GARBAGE: u8 = 0x04;
pub const LOCKED: u8 = 0x05;
pub const LOCKERS: u8 = 0x06;
pub const SHARD_INFO: u8 = 0x07;

pub const PHY_COUNTER: &[u8] = b"phy_counter";
pub const LOGIC_COUNTER: &[u8] = b"logic_counter";
pub const VERSION: &[u8] = b"version";

/// Current on-disk layout version
pub const CURRENT_VERSION: u64 = 1;

/// Stored primary entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub header: ObjectHeader,
    /// Blob store descriptor; `None` while the payload sits in the write-cache
    pub storage_id: Option<Vec<u8>>,
}

impl IndexRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(addr: &Address, data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| Error::corruption(format!("undecodable index record for {addr}: {e}")))
    }
}

/// Graveyard entry: the tombstone covering a member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grave {
    pub tombstone: Address,
    pub expiration: Epoch,
}

impl Grave {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::corruption(format!("undecodable grave: {e}")))
    }
}

fn with_prefix(prefix: u8, parts: &[&[u8]]) -> Vec<u8> {
    let len = 1 + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    key.push(prefix);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

pub fn primary(addr: &Address) -> Vec<u8> {
    with_prefix(PRIMARY, &[&addr.to_bytes()])
}

pub fn primary_container(cid: &ContainerId) -> Vec<u8> {
    with_prefix(PRIMARY, &[cid.as_bytes()])
}

pub fn expiration(epoch: Epoch, addr: &Address) -> Vec<u8> {
    with_prefix(EXPIRATION, &[&epoch.to_be_bytes(), &addr.to_bytes()])
}

/// Exclusive upper bound of expiration keys with epoch `< epoch`
pub fn expiration_before(epoch: Epoch) -> Vec<u8> {
    with_prefix(EXPIRATION, &[&epoch.to_be_bytes()])
}

pub fn graveyard(addr: &Address) -> Vec<u8> {
    with_prefix(GRAVEYARD, &[&addr.to_bytes()])
}

pub fn garbage(addr: &Address) -> Vec<u8> {
    with_prefix(GARBAGE, &[&addr.to_bytes()])
}

pub fn locked(member: &Address, locker: &ObjectId) -> Vec<u8> {
    with_prefix(LOCKED, &[&member.to_bytes(), locker.as_bytes()])
}

pub fn locked_prefix(member: &Address) -> Vec<u8> {
    with_prefix(LOCKED, &[&member.to_bytes()])
}

pub fn lockers(locker: &Address, member: &ObjectId) -> Vec<u8> {
    with_prefix(LOCKERS, &[&locker.to_bytes(), member.as_bytes()])
}

pub fn lockers_prefix(locker: &Address) -> Vec<u8> {
    with_prefix(LOCKERS, &[&locker.to_bytes()])
}

pub fn shard_info(name: &[u8]) -> Vec<u8> {
    with_prefix(SHARD_INFO, &[name])
}

/// Address stored right after the one-byte prefix
pub fn address_after_prefix(key: &[u8]) -> Option<Address> {
    Address::from_bytes(key.get(1..=Address::SIZE)?)
}

/// Address stored after the prefix and an epoch
pub fn address_after_epoch(key: &[u8]) -> Option<(Epoch, Address)> {
    let epoch = Epoch::from_be_bytes(key.get(1..9)?.try_into().ok()?);
    Some((epoch, Address::from_bytes(key.get(9..9 + Address::SIZE)?)?))
}

/// Trailing object ID of a lock relation key
pub fn trailing_object(key: &[u8]) -> Option<ObjectId> {
    ObjectId::from_slice(key.get(key.len().checked_sub(ID_SIZE)?..)?)
}

/// Decode a little-endian `u64` info value
pub fn decode_u64(data: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(data.try_into().ok()?))
}
