// blockchain-core/src/types.rs

/// Consensus round a block was produced in
pub type Round = i64;

/// Timestamp in Unix epoch seconds
pub type Timestamp = i64;

/// Length of a hex encoded block hash
pub const HASH_HEX_LEN: usize = 64;

/// Serde adapter storing raw bytes as a hex string
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
