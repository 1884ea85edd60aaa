//! Reply framing negotiation
//!
//! Some framebuffer drivers advertise DDC/CI reply framing but hang when it is
//! actually requested, so the reply encoding is picked from the capability
//! metadata the bus publishes instead of being probed with live requests.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{
    resolver::{BusId, EndpointId, PhysicalEndpoint},
    transport::BusTransport,
};

/// Encoding used for the reply phase of a bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReplyFraming {
    /// send only, nothing is read back
    None,
    /// plain read of the requested number of bytes
    Simple,
    /// DDC/CI length prefixed reply
    DdcCi,
}

impl ReplyFraming {
    fn bit(&self) -> u32 {
        match self {
            ReplyFraming::None => BusCapabilities::NO_REPLY,
            ReplyFraming::Simple => BusCapabilities::SIMPLE_REPLY,
            ReplyFraming::DdcCi => BusCapabilities::DDC_CI_REPLY,
        }
    }

    /// pick the most capable framing present in a reply kind bitmask
    pub fn preferred(reply_kinds: u32) -> Option<Self> {
        [ReplyFraming::DdcCi, ReplyFraming::Simple, ReplyFraming::None]
            .into_iter()
            .find(|framing| reply_kinds & framing.bit() != 0)
    }
}

/// Capability metadata a platform publishes for one bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusCapabilities {
    /// bitmask of `NO_REPLY`, `SIMPLE_REPLY` and `DDC_CI_REPLY`
    pub reply_kinds: u32,
    /// the bus encodes the sub-address itself and needs an explicit reply delay
    pub sub_address: bool,
}

impl BusCapabilities {
    pub const NO_REPLY: u32 = 1 << 0;
    pub const SIMPLE_REPLY: u32 = 1 << 1;
    pub const DDC_CI_REPLY: u32 = 1 << 2;

    pub fn new(reply_kinds: u32, sub_address: bool) -> Self {
        Self {
            reply_kinds,
            sub_address,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFraming {
    pub reply: ReplyFraming,
    pub sub_address: bool,
}

/// Per bus cache of negotiated framings.
///
/// Only usable results are stored: a bus without metadata is asked again on
/// the next transaction, a bus with a result is never asked again.
#[derive(Debug, Default)]
pub struct FramingNegotiator {
    cache: RwLock<HashMap<(EndpointId, BusId), NegotiatedFraming>>,
}

impl FramingNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, endpoint: EndpointId, bus: BusId) -> Option<NegotiatedFraming> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(endpoint, bus))
            .copied()
    }

    pub fn negotiate<T: BusTransport>(
        &self,
        transport: &T,
        endpoint: &PhysicalEndpoint,
        bus: BusId,
    ) -> Option<NegotiatedFraming> {
        if let Some(negotiated) = self.cached(endpoint.id, bus) {
            return Some(negotiated);
        }

        let capabilities = transport.bus_capabilities(endpoint, bus)?;
        let reply = ReplyFraming::preferred(capabilities.reply_kinds)?;
        log::debug!(
            "bus {} of endpoint {:?} negotiated {:?} reply framing (kinds {:#x})",
            bus.0,
            endpoint.id,
            reply,
            capabilities.reply_kinds
        );

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // a racing thread may have published first, keep its value
        let negotiated = cache.entry((endpoint.id, bus)).or_insert(NegotiatedFraming {
            reply,
            sub_address: capabilities.sub_address,
        });
        Some(*negotiated)
    }
}
