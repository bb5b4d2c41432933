//! Core type definitions for Cairn
//!
//! This module defines the object model shared by every component:
//! identifiers, addresses, object headers and the system payloads
//! carried by tombstone and lock objects.

use crate::checksum::{Checksum, open_frame, seal_frame};
use crate::epoch::Epoch;
use crate::error::{Error, Result};
use bytes::Bytes;
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Length of container, object and owner identifiers
pub const ID_SIZE: usize = 32;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
        )]
        pub struct $name([u8; ID_SIZE]);

        impl $name {
            /// Create from raw bytes
            #[must_use]
            pub const fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
                Self(bytes)
            }

            /// Create from a slice, which must be exactly 32 bytes long
            #[must_use]
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(Self)
            }

            /// Get as bytes
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let bytes = hex::decode(s).map_err(|e| {
                    Error::validation(format!("invalid {}: {e}", stringify!($name)))
                })?;
                Self::from_slice(&bytes).ok_or_else(|| {
                    Error::validation(format!(
                        "invalid {}: expected {ID_SIZE} bytes, got {}",
                        stringify!($name),
                        bytes.len()
                    ))
                })
            }
        }
    };
}

define_id!(
    /// Identifier of a container
    ContainerId
);

define_id!(
    /// Identifier of an object within its container
    ObjectId
);

define_id!(
    /// Identifier of an object owner
    OwnerId
);

impl ContainerId {
    /// Generate a new random container ID
    #[must_use]
    pub fn random() -> Self {
        Self(random_bytes())
    }
}

impl ObjectId {
    /// Generate a new random object ID
    #[must_use]
    pub fn random() -> Self {
        Self(random_bytes())
    }
}

impl OwnerId {
    /// Generate a new random owner ID
    #[must_use]
    pub fn random() -> Self {
        Self(random_bytes())
    }
}

fn random_bytes() -> [u8; ID_SIZE] {
    let mut out = [0u8; ID_SIZE];
    out[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    out[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    out
}

/// Globally unique object address
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub container: ContainerId,
    pub object: ObjectId,
}

impl Address {
    /// Size of the binary key form
    pub const SIZE: usize = ID_SIZE * 2;

    #[must_use]
    pub const fn new(container: ContainerId, object: ObjectId) -> Self {
        Self { container, object }
    }

    /// Binary key form: container bytes followed by object bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..ID_SIZE].copy_from_slice(self.container.as_bytes());
        out[ID_SIZE..].copy_from_slice(self.object.as_bytes());
        out
    }

    /// Parse the binary key form
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            container: ContainerId::from_slice(&bytes[..ID_SIZE])?,
            object: ObjectId::from_slice(&bytes[ID_SIZE..])?,
        })
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.object)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (cid, oid) = s
            .split_once('/')
            .ok_or_else(|| Error::validation(format!("invalid address: {s}")))?;
        Ok(Self::new(cid.parse()?, oid.parse()?))
    }
}

/// Object type relevant to the storage engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    #[default]
    Regular,
    Tombstone,
    Lock,
}

impl ObjectType {
    /// Single-byte tag used in index keys
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Regular => 0,
            Self::Tombstone => 1,
            Self::Lock => 2,
        }
    }

    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Regular),
            1 => Some(Self::Tombstone),
            2 => Some(Self::Lock),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Regular => "REGULAR",
            Self::Tombstone => "TOMBSTONE",
            Self::Lock => "LOCK",
        };
        f.write_str(s)
    }
}

/// User-defined key/value attribute
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Object header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    /// Container the object belongs to
    pub container: ContainerId,
    /// Object identifier
    pub id: ObjectId,
    /// Object owner
    pub owner: OwnerId,
    /// Object type
    pub object_type: ObjectType,
    /// Payload size in bytes
    pub payload_size: u64,
    /// SHA-256 of the payload
    pub payload_checksum: Checksum,
    /// Last epoch the object is alive in
    pub expiration: Option<Epoch>,
    /// Parent object of a split chain
    pub parent: Option<ObjectId>,
    /// Split chain identifier
    pub split_id: Option<Uuid>,
    /// Children of a split parent
    pub children: Vec<ObjectId>,
    /// User attributes
    pub attributes: Vec<Attribute>,
}

impl ObjectHeader {
    /// Get the object address
    #[must_use]
    pub const fn address(&self) -> Address {
        Address::new(self.container, self.id)
    }

    /// Whether the object is not a part of a split chain
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Look up an attribute value
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }
}

/// A complete object: header plus payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub header: ObjectHeader,
    pub payload: Bytes,
}

#[derive(Serialize)]
struct EncodeObject<'a> {
    header: &'a ObjectHeader,
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct DecodeObject {
    header: ObjectHeader,
    payload: Vec<u8>,
}

impl Object {
    /// Build an object with a fresh random ID
    ///
    /// Payload size and checksum are computed from `payload`.
    pub fn new(
        container: ContainerId,
        owner: OwnerId,
        object_type: ObjectType,
        payload: impl Into<Bytes>,
    ) -> Self {
        let payload = payload.into();
        Self {
            header: ObjectHeader {
                container,
                id: ObjectId::random(),
                owner,
                object_type,
                payload_size: payload.len() as u64,
                payload_checksum: Checksum::compute(&payload),
                expiration: None,
                parent: None,
                split_id: None,
                children: Vec::new(),
                attributes: Vec::new(),
            },
            payload,
        }
    }

    /// Build a tombstone object covering `tombstone.members`
    pub fn tombstone(container: ContainerId, owner: OwnerId, tombstone: &Tombstone) -> Result<Self> {
        let payload = tombstone.encode()?;
        Ok(Self::new(container, owner, ObjectType::Tombstone, payload)
            .with_expiration(tombstone.expiration))
    }

    /// Build a lock object protecting `lock.members`
    pub fn lock(container: ContainerId, owner: OwnerId, lock: &Lock) -> Result<Self> {
        Ok(Self::new(container, owner, ObjectType::Lock, lock.encode()?))
    }

    #[must_use]
    pub const fn with_expiration(mut self, epoch: Epoch) -> Self {
        self.header.expiration = Some(epoch);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.attributes.push(Attribute::new(key, value));
        self
    }

    #[must_use]
    pub const fn with_parent(mut self, parent: ObjectId, split_id: Uuid) -> Self {
        self.header.parent = Some(parent);
        self.header.split_id = Some(split_id);
        self
    }

    /// Get the object address
    #[must_use]
    pub const fn address(&self) -> Address {
        self.header.address()
    }

    /// Check the payload against the size and checksum recorded in the header
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() as u64 != self.header.payload_size {
            return Err(Error::validation(format!(
                "payload size mismatch for {}: header {} != actual {}",
                self.address(),
                self.header.payload_size,
                self.payload.len()
            )));
        }
        if !self.header.payload_checksum.verify(&self.payload) {
            return Err(Error::validation(format!(
                "payload checksum mismatch for {}",
                self.address()
            )));
        }
        Ok(())
    }

    /// Encode to the binary object format
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let mut buf = bincode::serialize(&EncodeObject {
            header: &self.header,
            payload: &self.payload,
        })
        .map_err(|e| Error::Serialization(e.to_string()))?;
        seal_frame(&mut buf);
        Ok(buf)
    }

    /// Decode and validate the binary object format
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let body = open_frame(data).ok_or_else(|| Error::validation("object CRC mismatch"))?;
        let decoded: DecodeObject = bincode::deserialize(body)
            .map_err(|e| Error::validation(format!("malformed object: {e}")))?;
        let object = Self {
            header: decoded.header,
            payload: Bytes::from(decoded.payload),
        };
        object.validate()?;
        Ok(object)
    }
}

/// Payload of a tombstone object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Epoch after which the tombstone and its graves may be collected
    pub expiration: Epoch,
    /// Removed objects, in the tombstone's own container
    pub members: Vec<ObjectId>,
}

impl Tombstone {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::validation(format!("malformed tombstone: {e}")))
    }
}

/// Payload of a lock object
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    /// Protected objects, in the lock's own container
    pub members: Vec<ObjectId>,
}

impl Lock {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::validation(format!("malformed lock: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Object {
        Object::new(
            ContainerId::random(),
            OwnerId::random(),
            ObjectType::Regular,
            b"0123456789".to_vec(),
        )
        .with_attribute("FileName", "report.pdf")
        .with_expiration(42)
    }

    #[test]
    fn test_id_string_roundtrip() {
        let id = ObjectId::random();
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("abcd".parse::<ObjectId>().is_err());
        assert!("not hex".parse::<ContainerId>().is_err());
    }

    #[test]
    fn test_address_forms() {
        let addr = sample().address();
        let text = addr.to_string();
        assert_eq!(text.len(), 64 * 2 + 1);
        assert_eq!(text.parse::<Address>().unwrap(), addr);
        assert_eq!(Address::from_bytes(&addr.to_bytes()), Some(addr));
        assert!(Address::from_bytes(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_object_marshal() {
        let obj = sample();
        let data = obj.marshal().unwrap();
        let decoded = Object::unmarshal(&data).unwrap();
        assert_eq!(decoded, obj);
        assert_eq!(decoded.header.attribute("FileName"), Some("report.pdf"));
    }

    #[test]
    fn test_object_unmarshal_detects_corruption() {
        let data = sample().marshal().unwrap();
        for pos in [0, 5, data.len() / 2, data.len() - 1] {
            let mut bad = data.clone();
            bad[pos] ^= 0xFF;
            let err = Object::unmarshal(&bad).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "byte {pos}: {err}");
        }
        assert!(Object::unmarshal(&data[..data.len() - 3]).is_err());
    }

    #[test]
    fn test_object_validate_checksum() {
        let mut obj = sample();
        obj.payload = Bytes::from_static(b"9876543210");
        assert!(obj.validate().is_err());

        // Re-encoding a tampered payload still fails on decode.
        let data = obj.marshal().unwrap();
        assert!(matches!(Object::unmarshal(&data), Err(Error::Validation(_))));
    }

    #[test]
    fn test_tombstone_object() {
        let cnr = ContainerId::random();
        let ts = Tombstone {
            expiration: 10,
            members: vec![ObjectId::random(), ObjectId::random()],
        };
        let obj = Object::tombstone(cnr, OwnerId::random(), &ts).unwrap();
        assert_eq!(obj.header.object_type, ObjectType::Tombstone);
        assert_eq!(obj.header.expiration, Some(10));
        assert_eq!(Tombstone::decode(&obj.payload).unwrap(), ts);
        assert!(Lock::decode(b"\x01").is_err());
    }

    #[test]
    fn test_object_type_tag() {
        for t in [ObjectType::Regular, ObjectType::Tombstone, ObjectType::Lock] {
            assert_eq!(ObjectType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(ObjectType::from_u8(9), None);
    }
}
