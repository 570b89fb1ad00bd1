//! # Pump Commands
//!
//! Command descriptors and the engine that executes them.
//!
//! A command is described by data, not by type: a [`CommandSpec`] names the
//! opcode and the [`Exchange`] it needs, and a [`PumpCommand`] adds the
//! request payload and the decoding of the response.
//!
//! ```text
//! Simple:       request ──> response (Get: same opcode, Set: ACK)
//! BigTransfer:  [prelude x init_attempts] request ──> fragment 1
//!               ACK ──> fragment 2 ... until index >= end_marker
//!               any link failure ──> NAK (x nak_retries)
//! ```

pub mod engine;

pub use engine::{CommandEngine, EngineProbe};

use crate::codec::protocol::{ResponseShape, DEFAULT_END_MARKER};
use crate::error::Result;

/// Whether a command reads or changes pump state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Answered with data under the request opcode
    Get,
    /// Answered with the ACK sequence
    Set,
}

/// Retry counters for one big transfer, fresh on every invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Prelude transmissions before giving up on waking the pump
    pub init_attempts: u32,
    /// ACKs sent to pull fragments after the first
    pub ack_repeats: u32,
    /// NAKs sent after a failed exchange
    pub nak_retries: u32,
}

impl RetryBudget {
    pub const fn new(init_attempts: u32, ack_repeats: u32, nak_retries: u32) -> Self {
        Self {
            init_attempts,
            ack_repeats,
            nak_retries,
        }
    }

    /// Most fragments a transfer may carry
    pub fn fragment_limit(&self) -> u32 {
        self.ack_repeats.saturating_add(1)
    }
}

/// Wake-up command sent before the main exchange of a big transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prelude {
    pub opcode: u8,
    /// Extra back-to-back copies per transmission
    pub repeat: u8,
}

/// Exchange pattern of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Simple {
        kind: CommandKind,
    },
    BigTransfer {
        prelude: Option<Prelude>,
        kind: CommandKind,
        budget: RetryBudget,
        /// Fragment index at or above which a fragment is the last one
        end_marker: u8,
    },
}

/// Static description of one pump command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub opcode: u8,
    pub exchange: Exchange,
}

impl CommandSpec {
    pub const fn simple_get(name: &'static str, opcode: u8) -> Self {
        Self {
            name,
            opcode,
            exchange: Exchange::Simple { kind: CommandKind::Get },
        }
    }

    pub const fn simple_set(name: &'static str, opcode: u8) -> Self {
        Self {
            name,
            opcode,
            exchange: Exchange::Simple { kind: CommandKind::Set },
        }
    }

    /// Multi-fragment read of at most `1 + ack_repeats` fragments
    pub const fn big_get(name: &'static str, opcode: u8, ack_repeats: u32) -> Self {
        Self {
            name,
            opcode,
            exchange: Exchange::BigTransfer {
                prelude: None,
                kind: CommandKind::Get,
                budget: RetryBudget::new(1, ack_repeats, 0),
                end_marker: DEFAULT_END_MARKER,
            },
        }
    }

    /// Acknowledged write preceded by a wake-up burst of the same opcode
    pub const fn woken_set(name: &'static str, opcode: u8, repeat: u8) -> Self {
        Self {
            name,
            opcode,
            exchange: Exchange::BigTransfer {
                prelude: Some(Prelude { opcode, repeat }),
                kind: CommandKind::Set,
                budget: RetryBudget::new(1, 0, 0),
                end_marker: DEFAULT_END_MARKER,
            },
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self.exchange {
            Exchange::Simple { kind } | Exchange::BigTransfer { kind, .. } => kind,
        }
    }

    /// How byte 5 of the main response is read
    pub fn response_shape(&self) -> ResponseShape {
        match self.exchange {
            Exchange::BigTransfer {
                kind: CommandKind::Get, ..
            } => ResponseShape::Fragment,
            _ => ResponseShape::Simple,
        }
    }
}

/// Raw result of an executed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Opcode of the (first) response packet
    pub opcode: u8,
    /// Payload, or the concatenated fragment payloads of a big transfer
    pub payload: Vec<u8>,
    /// Signal strength of the last packet received
    pub rssi_dbm: i16,
    /// Packets that contributed to `payload`
    pub fragments: usize,
}

/// A command the engine can execute
pub trait PumpCommand: Sync {
    type Output;

    fn spec(&self) -> CommandSpec;

    fn build_payload(&self) -> Vec<u8> {
        Vec::new()
    }

    fn decode_response(&self, response: &Response) -> Result<Self::Output>;

    fn response_shape(&self) -> ResponseShape {
        self.spec().response_shape()
    }
}

/// A command built from a spec, a payload and a decode function
#[derive(Debug, Clone)]
pub struct Query<T> {
    pub spec: CommandSpec,
    pub payload: Vec<u8>,
    pub decode: fn(&Response) -> Result<T>,
}

impl<T> Query<T> {
    pub fn new(spec: CommandSpec, decode: fn(&Response) -> Result<T>) -> Self {
        Self {
            spec,
            payload: Vec::new(),
            decode,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

impl<T> PumpCommand for Query<T> {
    type Output = T;

    fn spec(&self) -> CommandSpec {
        self.spec
    }

    fn build_payload(&self) -> Vec<u8> {
        self.payload.clone()
    }

    fn decode_response(&self, response: &Response) -> Result<T> {
        (self.decode)(response)
    }
}
