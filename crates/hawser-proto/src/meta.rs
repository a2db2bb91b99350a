use std::collections::HashMap;

/// Multi-valued metadata entry, mirroring gRPC metadata shape.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Values {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

/// Request/response metadata carried in tunnel frames. Proxied HTTP
/// requests use the `:method`/`:path` pseudo keys next to ordinary header
/// names; responses carry the HTTP status under `:status`.
pub type Meta = HashMap<String, Values>;

pub const META_METHOD: &str = ":method";
pub const META_PATH: &str = ":path";
pub const META_STATUS: &str = ":status";

pub fn meta_insert(meta: &mut Meta, key: impl Into<String>, value: impl Into<String>) {
    meta.entry(key.into())
        .or_insert_with(|| Values { values: Vec::new() })
        .values
        .push(value.into());
}

/// First value for a key, if any.
pub fn meta_first<'a>(meta: &'a Meta, key: &str) -> Option<&'a str> {
    meta.get(key)?.values.first().map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_appends_to_existing_key() {
        let mut meta = Meta::new();
        meta_insert(&mut meta, "accept", "application/json");
        meta_insert(&mut meta, "accept", "application/yaml");
        assert_eq!(meta_first(&meta, "accept"), Some("application/json"));
        assert_eq!(meta["accept"].values.len(), 2);
        assert_eq!(meta_first(&meta, "missing"), None);
    }
}
