//! Key and index-value codec.
//!
//! Layout:
//! - meta keys:   `m...` (catalog bookkeeping, never table data)
//! - record keys: `t` + 8-byte order-preserving table id + `_r` + 8-byte handle
//! - index keys:  `t` + 8-byte order-preserving table id + `_i` + 8-byte index id + column bytes
//!
//! Index values carry a leading flag byte; the remainder is the payload.
//! Integer ids are big-endian with the sign bit flipped so byte order equals
//! numeric order.

use kestrel_common::types::TableId;

pub const TABLE_PREFIX: &[u8] = b"t";
pub const META_PREFIX: &[u8] = b"m";
const RECORD_SEP: &[u8] = b"_r";
const INDEX_SEP: &[u8] = b"_i";

/// Index-value flag: the index is declared unique.
pub const INDEX_VALUE_UNIQUE: u8 = 0b0000_0001;
/// Index-value flag: the write is "untouched" — the key was locked for a
/// potential update that turned out not to change the indexed columns.
pub const INDEX_VALUE_UNTOUCHED: u8 = 0b0000_0010;

fn push_ordered_i64(buf: &mut Vec<u8>, v: i64) {
    let encoded = (v as u64) ^ (1u64 << 63);
    buf.extend_from_slice(&encoded.to_be_bytes());
}

/// Key prefix covering every record and index key of `table_id`.
pub fn encode_table_prefix(table_id: TableId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.extend_from_slice(TABLE_PREFIX);
    push_ordered_i64(&mut buf, table_id.0);
    buf
}

/// Row key for `(table_id, handle)`.
pub fn encode_record_key(table_id: TableId, handle: i64) -> Vec<u8> {
    let mut buf = encode_table_prefix(table_id);
    buf.extend_from_slice(RECORD_SEP);
    push_ordered_i64(&mut buf, handle);
    buf
}

/// Index key for `(table_id, index_id)` and the encoded column bytes.
pub fn encode_index_key(table_id: TableId, index_id: i64, column_bytes: &[u8]) -> Vec<u8> {
    let mut buf = encode_table_prefix(table_id);
    buf.extend_from_slice(INDEX_SEP);
    push_ordered_i64(&mut buf, index_id);
    buf.extend_from_slice(column_bytes);
    buf
}

/// Build an index value from the flag byte and payload.
pub fn encode_index_value(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(flags);
    buf.extend_from_slice(payload);
    buf
}

pub fn is_table_key(key: &[u8]) -> bool {
    key.starts_with(TABLE_PREFIX) && key.len() > TABLE_PREFIX.len()
}

pub fn is_record_key(key: &[u8]) -> bool {
    is_table_key(key) && key.len() >= 11 && &key[9..11] == RECORD_SEP
}

pub fn is_index_key(key: &[u8]) -> bool {
    is_table_key(key) && key.len() >= 11 && &key[9..11] == INDEX_SEP
}

/// True when an index write's value is flagged unique.
pub fn index_value_is_unique(value: &[u8]) -> bool {
    !value.is_empty() && value[0] & INDEX_VALUE_UNIQUE != 0
}

/// True for an index write whose value carries the untouched marker.
pub fn is_untouched_index_kv(key: &[u8], value: &[u8]) -> bool {
    is_index_key(key) && !value.is_empty() && value[0] & INDEX_VALUE_UNTOUCHED != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_roundtrip_predicates() {
        let k = encode_record_key(TableId(42), 7);
        assert!(is_table_key(&k));
        assert!(is_record_key(&k));
        assert!(!is_index_key(&k));
    }

    #[test]
    fn test_index_key_predicates() {
        let k = encode_index_key(TableId(42), 1, b"abc");
        assert!(is_table_key(&k));
        assert!(is_index_key(&k));
        assert!(!is_record_key(&k));
    }

    #[test]
    fn test_meta_key_is_not_table_key() {
        assert!(!is_table_key(b"mSchema:1"));
    }

    #[test]
    fn test_table_prefix_orders_numerically() {
        let a = encode_table_prefix(TableId(-1));
        let b = encode_table_prefix(TableId(0));
        let c = encode_table_prefix(TableId(10));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_prefix_covers_record_and_index_keys() {
        let prefix = encode_table_prefix(TableId(5));
        assert!(encode_record_key(TableId(5), 1).starts_with(&prefix));
        assert!(encode_index_key(TableId(5), 2, b"x").starts_with(&prefix));
        assert!(!encode_record_key(TableId(6), 1).starts_with(&prefix));
    }

    #[test]
    fn test_index_value_flags() {
        let unique = encode_index_value(INDEX_VALUE_UNIQUE, b"h");
        assert!(index_value_is_unique(&unique));
        let untouched = encode_index_value(INDEX_VALUE_UNIQUE | INDEX_VALUE_UNTOUCHED, b"h");
        let k = encode_index_key(TableId(1), 1, b"c");
        assert!(is_untouched_index_kv(&k, &untouched));
        assert!(!is_untouched_index_kv(&k, &unique));
        // Untouched marker only applies to index keys.
        let rk = encode_record_key(TableId(1), 1);
        assert!(!is_untouched_index_kv(&rk, &untouched));
    }
}
