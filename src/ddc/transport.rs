//! Bus transport boundary
//!
//! The transport is the platform capability that actually moves bytes over a
//! display's I2C bus. The controller only ever talks to it through
//! [`BusTransport`], so tests and other platforms can plug in their own.

use std::time::Duration;

use thiserror::Error;

use super::{
    framing::{BusCapabilities, ReplyFraming},
    resolver::{BusId, PhysicalEndpoint},
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no device answered on the bus")]
    NoDevice,
    #[error("the bus does not support the requested transaction type")]
    UnsupportedFraming,
    #[error("bus transaction failed: {0}")]
    Io(anyhow::Error),
}

/// One atomic send + reply exchange on a bus.
///
/// Addresses are 8 bit bus addresses (write address even, read address odd),
/// as they appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub send_address: u8,
    pub send_sub_address: Option<u8>,
    pub send: Vec<u8>,
    pub reply_address: u8,
    pub reply_sub_address: Option<u8>,
    pub reply_len: usize,
    /// minimum time between the end of the send phase and the start of the reply phase
    pub min_reply_delay: Duration,
    pub reply_framing: ReplyFraming,
}

impl TransactionRequest {
    pub fn expects_reply(&self) -> bool {
        self.reply_framing != ReplyFraming::None && self.reply_len > 0
    }
}

/// Result of a successful exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOutcome {
    pub reply: Vec<u8>,
    /// the bus asks for this much quiet time before the next transaction
    pub min_delay: Option<Duration>,
}

impl TransactionOutcome {
    pub fn with_reply(reply: Vec<u8>) -> Self {
        Self {
            reply,
            min_delay: None,
        }
    }
}

/// implement this trait to give the controller access to a platform bus
///
/// All methods take `&self`: a transport is shared by every thread using the
/// controller, serialization per display is done by the controller.
pub trait BusTransport {
    type Connection;

    /// capability metadata of a bus, `None` if the platform does not publish any
    fn bus_capabilities(&self, endpoint: &PhysicalEndpoint, bus: BusId) -> Option<BusCapabilities>;

    fn open(&self, endpoint: &PhysicalEndpoint, bus: BusId)
        -> Result<Self::Connection, TransportError>;

    /// run one complete exchange, enforcing `request.min_reply_delay` before the reply phase
    fn send(
        &self,
        connection: &mut Self::Connection,
        request: &TransactionRequest,
    ) -> Result<TransactionOutcome, TransportError>;

    fn close(&self, connection: Self::Connection) {
        drop(connection)
    }

    /// blocking delay, override in tests to observe timing without sleeping
    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}
