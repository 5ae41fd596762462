// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Key spans of the upstream store, and the row/meta key layout the
//! changefeed observes.
//!
//! Row keys are `t{table_id:BE}_r{handle:BE}`; DDL jobs live under the meta
//! prefix `m`. Spans are half-open `[start, end)` byte ranges.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::TableId;

const ROW_KEY_PREFIX: u8 = b't';
const META_KEY_PREFIX: u8 = b'm';
const RECORD_INFIX: &[u8] = b"_r";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeySpan {
    pub start: Bytes,
    pub end: Bytes,
}

impl KeySpan {
    /// The span covering all row keys of one table.
    pub fn table_span(table_id: TableId) -> Self {
        Self {
            start: table_prefix(table_id),
            end: table_prefix(table_id + 1),
        }
    }

    /// The span covering the upstream meta region, where DDL jobs are
    /// written.
    pub fn ddl_span() -> Self {
        Self {
            start: Bytes::from_static(&[META_KEY_PREFIX]),
            end: Bytes::from_static(&[META_KEY_PREFIX + 1]),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start.as_ref() && key < self.end.as_ref()
    }
}

fn table_prefix(table_id: TableId) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(ROW_KEY_PREFIX);
    buf.put_i64(table_id);
    buf.freeze()
}

/// Encode the row key for `handle` in `table_id`.
pub fn row_key(table_id: TableId, handle: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(19);
    buf.put_u8(ROW_KEY_PREFIX);
    buf.put_i64(table_id);
    buf.put_slice(RECORD_INFIX);
    buf.put_i64(handle);
    buf.freeze()
}

/// Decode a row key into `(table_id, handle)`. Returns `None` for keys that
/// are not in the row-key layout (meta keys, index keys of future layouts).
pub fn decode_row_key(key: &[u8]) -> Option<(TableId, i64)> {
    if key.len() != 19 || key[0] != ROW_KEY_PREFIX || &key[9..11] != RECORD_INFIX {
        return None;
    }
    let table_id = i64::from_be_bytes(key[1..9].try_into().unwrap());
    let handle = i64::from_be_bytes(key[11..19].try_into().unwrap());
    Some((table_id, handle))
}

pub fn is_meta_key(key: &[u8]) -> bool {
    !key.is_empty() && key[0] == META_KEY_PREFIX
}

/// An arbitrary key inside the meta span, used by sources that address
/// resolved events by key.
pub fn meta_key() -> Bytes {
    Bytes::from_static(&[META_KEY_PREFIX])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_key_round_trip() {
        let key = row_key(99, 12345);
        assert_eq!(decode_row_key(&key), Some((99, 12345)));
        assert!(KeySpan::table_span(99).contains(&key));
        assert!(!KeySpan::table_span(100).contains(&key));
    }

    #[test]
    fn test_table_span_orders_adjacent_tables() {
        let span = KeySpan::table_span(7);
        assert_eq!(span.end, KeySpan::table_span(8).start);
        assert!(!span.contains(&row_key(8, 0)));
    }

    #[test]
    fn test_ddl_span() {
        let span = KeySpan::ddl_span();
        assert!(span.contains(&meta_key()));
        assert!(is_meta_key(&meta_key()));
        assert!(!span.contains(&row_key(1, 1)));
    }
}
