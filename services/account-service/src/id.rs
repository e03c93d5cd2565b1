//! Time-ordered 64-bit account identifiers
//!
//! Layout, most significant first:
//!
//! ```text
//! | 1 bit unused | 41 bits ms since EPOCH_MS | 10 bits node | 12 bits sequence |
//! ```
//!
//! Ids from one generator are strictly increasing. Up to 4096 ids are issued
//! per millisecond; past that the generator borrows the next millisecond
//! instead of blocking.

use crate::errors::StartupError;
use chrono::Utc;
use ledger_core::AccountId;
use parking_lot::Mutex;

/// 2010-11-04T01:42:54.657Z
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

pub const DEFAULT_NODE: u16 = 888;

#[derive(Debug)]
pub struct IdGenerator {
    node: i64,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    last_ms: i64,
    sequence: i64,
}

impl IdGenerator {
    pub fn new(node: u16) -> Result<Self, StartupError> {
        if node > MAX_NODE {
            return Err(StartupError::Config(format!(
                "id node {} exceeds {}",
                node, MAX_NODE
            )));
        }
        Ok(Self {
            node: i64::from(node),
            state: Mutex::new(State::default()),
        })
    }

    pub fn next_id(&self) -> AccountId {
        let now = Utc::now().timestamp_millis() - EPOCH_MS;

        let mut state = self.state.lock();
        if now > state.last_ms {
            state.last_ms = now;
            state.sequence = 0;
        } else {
            // Same millisecond, or the clock stepped back
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.last_ms += 1;
            }
        }

        AccountId::new(
            (state.last_ms << (NODE_BITS + SEQUENCE_BITS))
                | (self.node << SEQUENCE_BITS)
                | state.sequence,
        )
    }
}

/// Split an id into (ms since epoch, node, sequence)
pub fn decompose(id: AccountId) -> (i64, u16, u16) {
    let raw = id.as_i64();
    let ms = raw >> (NODE_BITS + SEQUENCE_BITS);
    let node = ((raw >> SEQUENCE_BITS) & i64::from(MAX_NODE)) as u16;
    let sequence = (raw & SEQUENCE_MASK) as u16;
    (ms, node, sequence)
}
