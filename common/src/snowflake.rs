//! Monotonic 64-bit task id generator.
//!
//! Layout (MSB to LSB): 41-bit milliseconds since `EPOCH_MS`, 10-bit node id,
//! 12-bit intra-millisecond sequence. Strict uniqueness across processes
//! depends on every process being handed a distinct node id.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch so the 41-bit timestamp field doesn't run out until 2109.
const EPOCH_MS: u64 = 1_700_000_000_000;

const NODE_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE_ID: u64 = (1 << NODE_ID_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const NODE_ID_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + NODE_ID_BITS;

#[derive(Debug, thiserror::Error)]
pub enum SnowflakeError {
    #[error("node id {0} exceeds the 10-bit field (max {MAX_NODE_ID})")]
    NodeIdOutOfRange(u64),
    #[error("system clock moved backwards by more than the retry budget")]
    ClockWentBackwards,
}

struct SnowflakeState {
    last_ms: u64,
    sequence: u64,
}

/// Issues strictly increasing 64-bit ids for one process.
pub struct Snowflake {
    node_id: u64,
    state: Mutex<SnowflakeState>,
}

impl Snowflake {
    pub fn new(node_id: u64) -> Result<Self, SnowflakeError> {
        if node_id > MAX_NODE_ID {
            return Err(SnowflakeError::NodeIdOutOfRange(node_id));
        }
        Ok(Self {
            node_id,
            state: Mutex::new(SnowflakeState {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    /// Derives a node id in range from an arbitrary string (e.g. hostname),
    /// for deployments that don't want to assign node ids by hand.
    pub fn node_id_from_name(name: &str) -> u64 {
        let mut hash: u64 = 1469598103934665603; // FNV-1a offset basis
        for byte in name.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        hash & MAX_NODE_ID
    }

    pub fn next_id(&self) -> Result<i64, SnowflakeError> {
        let mut state = self.state.lock().expect("snowflake mutex poisoned");
        let mut now = current_millis();

        if now < state.last_ms {
            // Clock stepped backwards (NTP correction, etc). Spin briefly
            // rather than issuing a duplicate or out-of-order id.
            let mut retries = 0;
            while now < state.last_ms {
                if retries > 1000 {
                    return Err(SnowflakeError::ClockWentBackwards);
                }
                std::thread::yield_now();
                now = current_millis();
                retries += 1;
            }
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond; busy-wait for the next one.
                while now <= state.last_ms {
                    now = current_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let id = ((now - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.node_id << NODE_ID_SHIFT)
            | state.sequence;
        Ok(id as i64)
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_strictly_increase_within_a_process() {
        let sf = Snowflake::new(1).unwrap();
        let mut last = sf.next_id().unwrap();
        for _ in 0..5000 {
            let id = sf.next_id().unwrap();
            assert!(id > last, "ids must strictly increase");
            last = id;
        }
    }

    #[test]
    fn ids_are_unique_under_concurrent_generation() {
        let sf = std::sync::Arc::new(Snowflake::new(2).unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            handles.push(std::thread::spawn(move || {
                (0..2000).map(move |_| sf.next_id().unwrap()).collect::<Vec<_>>()
            }));
        }
        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id generated: {id}");
            }
        }
    }

    #[test]
    fn distinct_node_ids_never_collide_in_the_node_field() {
        let a = Snowflake::new(3).unwrap();
        let b = Snowflake::new(4).unwrap();
        let id_a = a.next_id().unwrap() as u64;
        let id_b = b.next_id().unwrap() as u64;
        let node_of = |id: u64| (id >> NODE_ID_SHIFT) & MAX_NODE_ID;
        assert_ne!(node_of(id_a), node_of(id_b));
    }

    #[test]
    fn rejects_node_id_out_of_range() {
        assert!(matches!(
            Snowflake::new(MAX_NODE_ID + 1),
            Err(SnowflakeError::NodeIdOutOfRange(_))
        ));
    }
}
