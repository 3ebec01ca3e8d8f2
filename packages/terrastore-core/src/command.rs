//! Command protocol (§4.5) and wire framing (§6).
//!
//! A [`Command`] is a tagged variant: kind tag plus a payload struct per
//! kind, dispatched by a `match` on the executing side rather than by
//! reflection (§9, "dynamic dispatch over commands"). [`CommandKind`] is the
//! small, stable, wire-visible discriminant carried ahead of the body so a
//! peer can reject an unrecognized kind before attempting to deserialize it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Version of the self-describing body codec. Bumped only on breaking wire
/// changes; mismatched versions are a [`crate::RouteError::ProtocolError`].
pub const PROTOCOL_VERSION: u16 = 1;

/// Stable wire discriminant for a [`Command`] variant.
///
/// `TryFrom<u16>` is the decode path: an out-of-range value is a
/// `protocol-mismatch` per §4.5, not a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum CommandKind {
    GetBuckets = 0,
    GetKeys = 1,
    KeysInRange = 2,
    GetValue = 3,
    GetValues = 4,
    PutValue = 5,
    RemoveValue = 6,
    RemoveValues = 7,
    RemoveBucket = 8,
    Update = 9,
    Membership = 10,
}

impl TryFrom<u16> for CommandKind {
    type Error = u16;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::GetBuckets),
            1 => Ok(Self::GetKeys),
            2 => Ok(Self::KeysInRange),
            3 => Ok(Self::GetValue),
            4 => Ok(Self::GetValues),
            5 => Ok(Self::PutValue),
            6 => Ok(Self::RemoveValue),
            7 => Ok(Self::RemoveValues),
            8 => Ok(Self::RemoveBucket),
            9 => Ok(Self::Update),
            10 => Ok(Self::Membership),
            other => Err(other),
        }
    }
}

/// A byte range for [`Command::KeysInRange`]; either bound may be open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Address of a cluster member, as returned by [`Command::Membership`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAddress {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// A serializable request with a kind tag, executed by a node against the
/// storage engine (§4.5). The minimal set of kinds the core must support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Any node: set of bucket names local to that node.
    GetBuckets,
    /// Any node: set of keys local to that node, within `bucket`.
    GetKeys { bucket: String },
    /// Any node: sorted keys in `range`, ordered by `comparator`, capped at `limit`.
    KeysInRange {
        bucket: String,
        range: KeyRange,
        comparator: String,
        limit: Option<u32>,
        ttl_ms: Option<u64>,
    },
    /// Owning node: a single value, optionally constrained by `predicate`.
    GetValue {
        bucket: String,
        key: String,
        predicate: Option<String>,
    },
    /// Owning node: a batch of values for `keys`.
    GetValues {
        bucket: String,
        keys: Vec<String>,
        predicate: Option<String>,
    },
    /// Owning node: write `value` at `key`, optionally gated by `predicate`.
    PutValue {
        bucket: String,
        key: String,
        value: Vec<u8>,
        predicate: Option<String>,
    },
    /// Owning node: remove a single key.
    RemoveValue { bucket: String, key: String },
    /// Owning node: remove a batch of keys, optionally gated by `predicate`.
    RemoveValues {
        bucket: String,
        keys: Vec<String>,
        predicate: Option<String>,
    },
    /// One node per cluster: drop an entire bucket (§9 open question: not
    /// atomic cluster-wide, preserved as-is).
    RemoveBucket { bucket: String },
    /// Owning node: apply a named server-side function to `key`, bounded by
    /// `timeout_ms`, which the owning node enforces end-to-end.
    Update {
        bucket: String,
        key: String,
        function: String,
        params: Vec<u8>,
        timeout_ms: u64,
    },
    /// Any node: this cluster's current members with addresses.
    Membership,
}

impl Command {
    /// The wire kind tag for this command, used ahead of the serialized body.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::GetBuckets => CommandKind::GetBuckets,
            Self::GetKeys { .. } => CommandKind::GetKeys,
            Self::KeysInRange { .. } => CommandKind::KeysInRange,
            Self::GetValue { .. } => CommandKind::GetValue,
            Self::GetValues { .. } => CommandKind::GetValues,
            Self::PutValue { .. } => CommandKind::PutValue,
            Self::RemoveValue { .. } => CommandKind::RemoveValue,
            Self::RemoveValues { .. } => CommandKind::RemoveValues,
            Self::RemoveBucket { .. } => CommandKind::RemoveBucket,
            Self::Update { .. } => CommandKind::Update,
            Self::Membership => CommandKind::Membership,
        }
    }

    /// The bucket this command targets, when it targets exactly one.
    #[must_use]
    pub fn bucket(&self) -> Option<&str> {
        match self {
            Self::GetBuckets | Self::Membership => None,
            Self::GetKeys { bucket }
            | Self::KeysInRange { bucket, .. }
            | Self::GetValue { bucket, .. }
            | Self::GetValues { bucket, .. }
            | Self::PutValue { bucket, .. }
            | Self::RemoveValue { bucket, .. }
            | Self::RemoveValues { bucket, .. }
            | Self::RemoveBucket { bucket }
            | Self::Update { bucket, .. } => Some(bucket),
        }
    }

    /// The key this command targets, when it targets exactly one key.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::GetValue { key, .. }
            | Self::PutValue { key, .. }
            | Self::RemoveValue { key, .. }
            | Self::Update { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// The result of executing a [`Command`] against the storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    Buckets(Vec<String>),
    Keys(Vec<String>),
    KeysInRange(Vec<String>),
    Value(Option<Vec<u8>>),
    Values(BTreeMap<String, Vec<u8>>),
    Ack,
    RemovedValues(BTreeMap<String, Vec<u8>>),
    UpdatedValue(Vec<u8>),
    Members(Vec<MemberAddress>),
}

/// Wire framing (§6): length-prefixed binary frames on a persistent TCP
/// connection. All numeric fields are big-endian.
///
/// ```text
/// frame    = uint32 length | payload(length bytes)
/// payload  = uint64 requestId | uint16 kind | uint16 version | body
/// response = uint64 requestId | uint8 status | body
/// ```
pub mod wire {
    /// `status` byte values for a [`ResponseHeader`].
    pub const STATUS_OK: u8 = 0;
    pub const STATUS_PROCESSING_ERROR: u8 = 1;
    pub const STATUS_VALIDATION_ERROR: u8 = 2;
    pub const STATUS_PROTOCOL_ERROR: u8 = 3;

    /// Fixed-size header prefixing every request body: `requestId | kind | version`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestHeader {
        pub request_id: u64,
        pub kind: u16,
        pub version: u16,
    }

    impl RequestHeader {
        pub const LEN: usize = 8 + 2 + 2;

        #[must_use]
        pub fn encode(&self) -> [u8; Self::LEN] {
            let mut buf = [0u8; Self::LEN];
            buf[0..8].copy_from_slice(&self.request_id.to_be_bytes());
            buf[8..10].copy_from_slice(&self.kind.to_be_bytes());
            buf[10..12].copy_from_slice(&self.version.to_be_bytes());
            buf
        }

        #[must_use]
        pub fn decode(buf: &[u8]) -> Option<Self> {
            if buf.len() < Self::LEN {
                return None;
            }
            Some(Self {
                request_id: u64::from_be_bytes(buf[0..8].try_into().ok()?),
                kind: u16::from_be_bytes(buf[8..10].try_into().ok()?),
                version: u16::from_be_bytes(buf[10..12].try_into().ok()?),
            })
        }
    }

    /// Fixed-size header prefixing every response body: `requestId | status`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResponseHeader {
        pub request_id: u64,
        pub status: u8,
    }

    impl ResponseHeader {
        pub const LEN: usize = 8 + 1;

        #[must_use]
        pub fn encode(&self) -> [u8; Self::LEN] {
            let mut buf = [0u8; Self::LEN];
            buf[0..8].copy_from_slice(&self.request_id.to_be_bytes());
            buf[8] = self.status;
            buf
        }

        #[must_use]
        pub fn decode(buf: &[u8]) -> Option<Self> {
            if buf.len() < Self::LEN {
                return None;
            }
            Some(Self {
                request_id: u64::from_be_bytes(buf[0..8].try_into().ok()?),
                status: buf[8],
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_kind_round_trips_through_u16() {
        let all = [
            CommandKind::GetBuckets,
            CommandKind::GetKeys,
            CommandKind::KeysInRange,
            CommandKind::GetValue,
            CommandKind::GetValues,
            CommandKind::PutValue,
            CommandKind::RemoveValue,
            CommandKind::RemoveValues,
            CommandKind::RemoveBucket,
            CommandKind::Update,
            CommandKind::Membership,
        ];
        for kind in all {
            let raw = kind as u16;
            assert_eq!(CommandKind::try_from(raw).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_command_kind_is_rejected() {
        assert_eq!(CommandKind::try_from(9999), Err(9999));
    }

    #[test]
    fn command_kind_matches_variant() {
        let cmd = Command::PutValue {
            bucket: "b".into(),
            key: "k".into(),
            value: vec![1, 2, 3],
            predicate: None,
        };
        assert_eq!(cmd.kind(), CommandKind::PutValue);
        assert_eq!(cmd.bucket(), Some("b"));
        assert_eq!(cmd.key(), Some("k"));
    }

    #[test]
    fn get_buckets_and_membership_have_no_bucket() {
        assert_eq!(Command::GetBuckets.bucket(), None);
        assert_eq!(Command::Membership.bucket(), None);
    }

    #[test]
    fn command_msgpack_round_trips() {
        let cmd = Command::KeysInRange {
            bucket: "b".into(),
            range: KeyRange { start: Some("a".into()), end: None },
            comparator: "lexicographic".into(),
            limit: Some(10),
            ttl_ms: None,
        };
        let bytes = rmp_serde::to_vec(&cmd).unwrap();
        let decoded: Command = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.kind(), CommandKind::KeysInRange);
    }

    #[test]
    fn request_header_round_trips() {
        let header = wire::RequestHeader { request_id: 42, kind: CommandKind::PutValue as u16, version: PROTOCOL_VERSION };
        let encoded = header.encode();
        let decoded = wire::RequestHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn request_header_decode_rejects_short_buffer() {
        assert!(wire::RequestHeader::decode(&[0u8; 3]).is_none());
    }

    #[test]
    fn response_header_round_trips() {
        let header = wire::ResponseHeader { request_id: 7, status: wire::STATUS_PROCESSING_ERROR };
        let encoded = header.encode();
        let decoded = wire::ResponseHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn request_header_is_big_endian() {
        let header = wire::RequestHeader { request_id: 1, kind: 0, version: 1 };
        let encoded = header.encode();
        // Big-endian: the high bytes of a small u64 are the leading zeros.
        assert_eq!(&encoded[0..7], &[0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encoded[7], 1);
    }
}
