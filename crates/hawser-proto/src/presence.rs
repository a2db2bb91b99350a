/// Value stored in a presence hash field. The expiry is embedded so that
/// readers can filter entries that outlived their refresh even before the
/// Redis key-level TTL sweeps them.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ExpiringValue {
    #[prost(int64, tag = "1")]
    pub expires_at: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Timestamp-only view of [`ExpiringValue`]. GC decodes with this type to
/// skip the payload; prost discards the unknown value field.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ExpiringValueTimestamp {
    #[prost(int64, tag = "1")]
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use prost::Message as _;

    use super::*;

    #[test]
    fn timestamp_view_decodes_full_value() {
        let full = ExpiringValue {
            expires_at: 1_700_000_000,
            value: b"https://peer.example".to_vec(),
        };
        let ts = ExpiringValueTimestamp::decode(full.encode_to_vec().as_slice()).unwrap();
        assert_eq!(ts.expires_at, full.expires_at);
    }
}
