//! Inbound message representation and the string encodings shared with the
//! rest of the broker: the property key-value format, host packing, message
//! ids and the tags hash used by downstream dispatch.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Separates a property key from its value inside the encoded string.
pub const NAME_VALUE_SEPARATOR: char = '\u{1}';
/// Terminates each key-value pair inside the encoded string.
pub const PROPERTY_SEPARATOR: char = '\u{2}';

pub const PROPERTY_REAL_TOPIC: &str = "REAL_TOPIC";
pub const PROPERTY_REAL_QUEUE_ID: &str = "REAL_QID";
pub const PROPERTY_KEYS: &str = "KEYS";
pub const PROPERTY_UNIQ_KEY: &str = "UNIQ_KEY";
pub const PROPERTY_TAGS: &str = "TAGS";

/// Topic that delayed messages are retargeted to; the scheduler redelivers
/// them to the topic preserved in `REAL_TOPIC`.
pub const SCHEDULE_TOPIC: &str = "SCHEDULE_TOPIC_XXXX";

pub const TRANSACTION_NOT_TYPE: i32 = 0;
pub const TRANSACTION_PREPARED_TYPE: i32 = 0x1 << 2;
pub const TRANSACTION_COMMIT_TYPE: i32 = 0x2 << 2;
pub const TRANSACTION_ROLLBACK_TYPE: i32 = 0x3 << 2;

/// Extracts the transaction bits from a sys flag.
pub fn transaction_type(sys_flag: i32) -> i32 {
    sys_flag & TRANSACTION_ROLLBACK_TYPE
}

/// A message handed to the commit log by the broker front end.
///
/// `store_timestamp` and `body_crc` are stamped by the commit log itself;
/// everything else is producer- or broker-supplied.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub queue_id: i32,
    pub flag: i32,
    pub body: Vec<u8>,
    pub sys_flag: i32,
    /// Producer clock, ms.
    pub born_timestamp: u64,
    pub born_host: SocketAddrV4,
    pub store_host: SocketAddrV4,
    pub reconsume_times: i32,
    pub prepared_transaction_offset: u64,
    /// Non-zero requests scheduled delivery; remapped at append time.
    pub delay_level: i32,
    /// Whether the producer wants confirmation of durability (and, on a
    /// sync master, replication) before the put returns.
    pub wait_store_msg_ok: bool,
    pub properties: HashMap<String, String>,
    pub store_timestamp: u64,
    pub body_crc: u32,
}

impl Message {
    pub fn new(topic: impl Into<String>, queue_id: i32, body: Vec<u8>) -> Self {
        let loopback = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        Self {
            topic: topic.into(),
            queue_id,
            flag: 0,
            body,
            sys_flag: 0,
            born_timestamp: 0,
            born_host: loopback,
            store_host: loopback,
            reconsume_times: 0,
            prepared_transaction_offset: 0,
            delay_level: 0,
            wait_store_msg_ok: true,
            properties: HashMap::new(),
            store_timestamp: 0,
            body_crc: 0,
        }
    }
}

/// Encodes a property map as `key\u{1}value\u{2}` pairs.
pub fn properties_to_string(properties: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in properties {
        out.push_str(key);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(value);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

/// Parses the `key\u{1}value\u{2}` property encoding. Pairs without a value
/// separator are dropped.
pub fn string_to_properties(encoded: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    for pair in encoded.split(PROPERTY_SEPARATOR) {
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once(NAME_VALUE_SEPARATOR) {
            properties.insert(key.to_string(), value.to_string());
        }
    }
    properties
}

/// Packs an IPv4 host as 4 address octets followed by the port as a
/// big-endian u32, the fixed 8-byte wire form of the host fields.
pub fn host_to_bytes(addr: &SocketAddrV4) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&addr.ip().octets());
    buf[4..8].copy_from_slice(&u32::from(addr.port()).to_be_bytes());
    buf
}

/// Renders a message id: 8-byte store host followed by the 8-byte physical
/// offset the record was written at, as 32 uppercase hex characters.
pub fn create_message_id(store_host: &SocketAddrV4, wrote_offset: u64) -> String {
    let mut raw = [0u8; 16];
    raw[0..8].copy_from_slice(&host_to_bytes(store_host));
    raw[8..16].copy_from_slice(&wrote_offset.to_be_bytes());

    use std::fmt::Write;
    let mut id = String::with_capacity(32);
    for byte in raw {
        let _ = write!(id, "{byte:02X}");
    }
    id
}

/// The JVM `String.hashCode` recurrence, kept so tag codes agree with
/// clients that computed them on the producer side.
pub fn java_string_hash(s: &str) -> i32 {
    let mut hash: i32 = 0;
    for unit in s.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(unit as i32);
    }
    hash
}

/// Tag filter code carried on dispatch records.
pub fn tags_code(tags: &str) -> i64 {
    i64::from(java_string_hash(tags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_round_trip() {
        let mut props = HashMap::new();
        props.insert("KEYS".to_string(), "order-42".to_string());
        props.insert("TAGS".to_string(), "TagA".to_string());
        props.insert("empty".to_string(), String::new());

        let encoded = properties_to_string(&props);
        let decoded = string_to_properties(&encoded);
        assert_eq!(decoded, props);
    }

    #[test]
    fn properties_empty() {
        assert_eq!(properties_to_string(&HashMap::new()), "");
        assert!(string_to_properties("").is_empty());
    }

    #[test]
    fn java_hash_matches_jvm() {
        // Values produced by String.hashCode on a JVM.
        assert_eq!(java_string_hash(""), 0);
        assert_eq!(java_string_hash("TagA"), 2598919);
        assert_eq!(java_string_hash("a"), 97);
    }

    #[test]
    fn message_id_layout() {
        let host = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 10911);
        let id = create_message_id(&host, 0);
        assert_eq!(id, "7F00000100002A9F0000000000000000");
        assert_eq!(id.len(), 32);

        let id = create_message_id(&host, 0x1234);
        assert!(id.ends_with("0000000000001234"));
    }

    #[test]
    fn transaction_bits() {
        assert_eq!(transaction_type(0), TRANSACTION_NOT_TYPE);
        assert_eq!(
            transaction_type(TRANSACTION_PREPARED_TYPE | 1),
            TRANSACTION_PREPARED_TYPE
        );
        assert_eq!(
            transaction_type(TRANSACTION_ROLLBACK_TYPE),
            TRANSACTION_ROLLBACK_TYPE
        );
    }
}
