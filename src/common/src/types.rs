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

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A hybrid logical timestamp: 46 bits of physical milliseconds followed by
/// 18 bits of logical counter. `0` is the "unknown" sentinel.
pub type Ts = u64;

pub type TableId = i64;
pub type RegionId = u64;

const PHYSICAL_SHIFT_BITS: u32 = 18;

/// Compose a [`Ts`] from a physical unix-millisecond part and a logical
/// counter.
pub fn compose_ts(physical_millis: u64, logical: u64) -> Ts {
    (physical_millis << PHYSICAL_SHIFT_BITS) | (logical & ((1 << PHYSICAL_SHIFT_BITS) - 1))
}

/// The physical unix-millisecond part of a [`Ts`].
pub fn extract_physical_millis(ts: Ts) -> u64 {
    ts >> PHYSICAL_SHIFT_BITS
}

pub fn ts_to_time(ts: Ts) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(extract_physical_millis(ts))
}

/// The largest [`Ts`] whose physical time is at least `lag` earlier than
/// `ts`'s. Saturates at zero.
pub fn ts_minus_duration(ts: Ts, lag: Duration) -> Ts {
    let physical = extract_physical_millis(ts).saturating_sub(lag.as_millis() as u64);
    compose_ts(physical, 0)
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_compose_extract() {
        let ts = compose_ts(1_690_000_000_000, 7);
        assert_eq!(extract_physical_millis(ts), 1_690_000_000_000);
        assert_eq!(ts & ((1 << PHYSICAL_SHIFT_BITS) - 1), 7);
    }

    #[test]
    fn test_ts_minus_duration_saturates() {
        assert_eq!(ts_minus_duration(compose_ts(10, 0), Duration::from_millis(20)), 0);
        let ts = compose_ts(1_000_000, 3);
        assert_eq!(
            ts_minus_duration(ts, Duration::from_millis(400_000)),
            compose_ts(600_000, 0)
        );
    }
}
