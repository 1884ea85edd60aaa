//! Control displays using the DDC/CI protocol.
//!
//! [`DdcController`] is the entry point: it resolves a display handle to its
//! bus, serializes access per display, negotiates the reply framing of each
//! bus and retries VCP reads the way the VESA DDC/CI standard asks for.

/// DDC/CI command messages.
pub mod ci;

/// edid block reading and parsing
pub mod edid;

/// reply framing negotiation
pub mod framing;

#[cfg(all(target_os = "linux", feature = "linux"))]
pub mod linux;

pub mod lock;
pub mod resolver;
pub mod retry;
pub mod transport;

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::{
    ci::{DdcCiProtocolError, VcpReadCommand, VcpWriteCommand},
    edid::{EdidBlock, EdidParseError},
    framing::{BusCapabilities, FramingNegotiator, NegotiatedFraming, ReplyFraming},
    lock::{DisplayLockRegistry, DisplayToken},
    resolver::{
        BusId, DeriveEndpointResolver, DisplayHandle, DisplayIdentity, DisplayRegistry,
        EndpointId, EndpointResolver, PhysicalEndpoint,
    },
    retry::{LogObserver, RetryObserver, RetryPolicy},
    transport::{BusTransport, TransactionOutcome, TransactionRequest, TransportError},
};
use self::ci::ResultCode;

#[derive(Error, Debug)]
pub enum DdcError {
    #[error("display has no DDC/CI capable bus")]
    EndpointNotFound,
    #[error("no bus of the display supports a usable reply transaction type")]
    UnsupportedFraming,
    #[error("Communication Error: {0}")]
    Transport(#[from] TransportError),
    #[error("DDC/CI Protocol Error! {0}")]
    Protocol(#[from] DdcCiProtocolError),
    #[error("Error Parsing Edid Data {0}")]
    EdidParseError(#[from] EdidParseError),
    #[error("no valid reply after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: Box<DdcError> },
}

impl DdcError {
    /// failures caused by bus noise that a repeated request may not hit again
    pub fn is_transient(&self) -> bool {
        match self {
            DdcError::Transport(TransportError::UnsupportedFraming) => false,
            DdcError::Transport(_) | DdcError::Protocol(_) | DdcError::EdidParseError(_) => true,
            DdcError::EndpointNotFound
            | DdcError::UnsupportedFraming
            | DdcError::RetriesExhausted { .. } => false,
        }
    }

    /// the error that ended the last attempt
    pub fn root(&self) -> &DdcError {
        match self {
            DdcError::RetriesExhausted { last, .. } => last.root(),
            error => error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DdcConfig {
    /// retry policy for VCP reads
    pub retry: RetryPolicy,
    /// framing for buses that publish no capability metadata, `None` to refuse them
    pub fallback_framing: Option<ReplyFraming>,
    /// wait between request and reply on buses with sub-address encoding
    pub reply_delay: Duration,
    /// the display is held this long after a request without reply
    pub write_settle_delay: Duration,
    /// never talk to internal panels
    pub exclude_builtin: bool,
}

impl Default for DdcConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::VESA,
            fallback_framing: Some(ReplyFraming::DdcCi),
            reply_delay: Duration::from_millis(60),
            write_settle_delay: Duration::from_millis(60),
            exclude_builtin: true,
        }
    }
}

/// Current and maximum value of a VCP control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VcpReadResult {
    pub control_id: u8,
    pub success: bool,
    pub current_value: u16,
    pub max_value: u16,
}

impl VcpReadResult {
    /// result reported when a read gave up
    pub fn failed(control_id: u8) -> Self {
        Self {
            control_id,
            success: false,
            current_value: 0,
            max_value: 0,
        }
    }
}

/// DDC/CI protocol layer for a set of displays.
///
/// Calls block the calling thread. The controller can be shared between
/// threads, requests for one display are executed one at a time while
/// different displays proceed in parallel.
pub struct DdcController<R, T> {
    resolver: R,
    transport: T,
    locks: DisplayLockRegistry,
    negotiator: FramingNegotiator,
    config: DdcConfig,
    observer: Box<dyn RetryObserver>,
}

impl<R, T> DdcController<R, T>
where
    R: EndpointResolver,
    T: BusTransport,
{
    pub fn new(resolver: R, transport: T) -> Self {
        Self::with_config(resolver, transport, DdcConfig::default())
    }

    pub fn with_config(resolver: R, transport: T, config: DdcConfig) -> Self {
        Self {
            resolver,
            transport,
            locks: DisplayLockRegistry::new(),
            negotiator: FramingNegotiator::new(),
            config,
            observer: Box::new(LogObserver),
        }
    }

    /// replace the default [`LogObserver`]
    pub fn with_observer<O>(mut self, observer: O) -> Self
    where
        O: RetryObserver + 'static,
    {
        self.observer = Box::new(observer);
        self
    }

    pub fn config(&self) -> &DdcConfig {
        &self.config
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn resolve(&self, display: DisplayHandle) -> Result<PhysicalEndpoint, DdcError> {
        self.resolver
            .resolve(display, self.config.exclude_builtin)
            .ok_or(DdcError::EndpointNotFound)
    }

    /// fill in reply framing and delay from what the bus negotiated
    fn negotiated_request(
        &self,
        endpoint: &PhysicalEndpoint,
        bus: BusId,
        request: &TransactionRequest,
    ) -> Result<TransactionRequest, DdcError> {
        let (reply_framing, sub_address) =
            match self.negotiator.negotiate(&self.transport, endpoint, bus) {
                Some(negotiated) => (negotiated.reply, negotiated.sub_address),
                None => (
                    self.config
                        .fallback_framing
                        .ok_or(DdcError::UnsupportedFraming)?,
                    true,
                ),
            };
        if reply_framing == ReplyFraming::None {
            return Err(DdcError::UnsupportedFraming);
        }
        let mut request = request.clone();
        request.reply_framing = reply_framing;
        request.min_reply_delay = if sub_address {
            self.config.reply_delay
        } else {
            Duration::ZERO
        };
        Ok(request)
    }

    fn send_on_bus(
        &self,
        endpoint: &PhysicalEndpoint,
        bus: BusId,
        request: &TransactionRequest,
    ) -> Result<TransactionOutcome, TransportError> {
        let mut connection = self.transport.open(endpoint, bus)?;
        log::trace!(
            "bus {}: send {:02x?} to {:#04x}, {:?} reply of {} bytes",
            bus.0,
            request.send,
            request.send_address,
            request.reply_framing,
            request.reply_len
        );
        let outcome = self.transport.send(&mut connection, request);
        self.transport.close(connection);
        outcome
    }

    /// one exchange while holding the display, trying the endpoint's buses in order
    fn exchange(
        &self,
        display: DisplayHandle,
        endpoint: &PhysicalEndpoint,
        request: &TransactionRequest,
        negotiate: bool,
    ) -> Result<Vec<u8>, DdcError> {
        let token = self.locks.acquire(display);

        let mut result = Err(DdcError::EndpointNotFound);
        let mut settle = Duration::ZERO;
        for &bus in &endpoint.buses {
            let request = if negotiate {
                match self.negotiated_request(endpoint, bus, request) {
                    Ok(request) => request,
                    Err(error) => {
                        log::debug!("{display}: skipping bus {}: {error}", bus.0);
                        result = Err(error);
                        continue;
                    }
                }
            } else {
                request.clone()
            };
            if !request.expects_reply() {
                settle = self.config.write_settle_delay;
            }
            match self.send_on_bus(endpoint, bus, &request) {
                Ok(outcome) => {
                    log::debug!("{display}: transaction on bus {} succeeded", bus.0);
                    settle = settle.max(outcome.min_delay.unwrap_or_default());
                    result = Ok(outcome.reply);
                    break;
                }
                Err(error) => {
                    log::debug!("{display}: transaction on bus {} failed: {error}", bus.0);
                    result = Err(error.into());
                }
            }
        }

        if !settle.is_zero() {
            self.transport.delay(settle);
        }
        self.locks.release(token);
        result
    }

    /// Set a VCP control to `new_value`.
    pub fn try_write_control(
        &self,
        display: DisplayHandle,
        control_id: u8,
        new_value: u16,
    ) -> Result<(), DdcError> {
        let endpoint = self.resolve(display)?;
        let command = VcpWriteCommand::new(control_id, new_value);
        self.exchange(display, &endpoint, &command.request(), false)?;
        Ok(())
    }

    /// [`Self::try_write_control`] reduced to a success flag
    pub fn write_control(&self, display: DisplayHandle, control_id: u8, new_value: u16) -> bool {
        match self.try_write_control(display, control_id, new_value) {
            Ok(()) => true,
            Err(error) => {
                log::warn!("{display}: vcp {control_id:#04x} not written: {error}");
                false
            }
        }
    }

    /// Read the current and maximum value of a VCP control, retrying bus errors.
    pub fn try_read_control(
        &self,
        display: DisplayHandle,
        control_id: u8,
    ) -> Result<VcpReadResult, DdcError> {
        let endpoint = self.resolve(display)?;
        let command = VcpReadCommand::new(control_id);
        let request = command.request();

        let reply = self.config.retry.run(
            |pause| self.transport.delay(pause),
            |attempt, error| self.observer.attempt_failed(display, attempt, error),
            |_| {
                let raw = self.exchange(display, &endpoint, &request, true)?;
                Ok(command.parse_reply(&raw)?)
            },
        )?;
        // a well formed reply carries its values even when the display flags the code
        if reply.result_code() == ResultCode::UnsupportedCode {
            log::debug!(
                "{display}: vcp {control_id:#04x} (type {:#04x}) reported as unsupported",
                reply.type_code()
            );
        }

        Ok(VcpReadResult {
            control_id,
            success: true,
            current_value: reply.current_value().into(),
            max_value: reply.max_value().into(),
        })
    }

    /// [`Self::try_read_control`] that reports failures as a zero result
    pub fn read_control(&self, display: DisplayHandle, control_id: u8) -> VcpReadResult {
        self.try_read_control(display, control_id)
            .unwrap_or_else(|error| {
                self.observer.read_failed(display, control_id, &error);
                VcpReadResult::failed(control_id)
            })
    }

    /// Read and verify the 128 byte EDID base block. Not retried.
    pub fn try_read_edid(&self, display: DisplayHandle) -> Result<EdidBlock, DdcError> {
        let endpoint = self.resolve(display)?;
        let raw = self.exchange(display, &endpoint, &edid::edid_request(), false)?;
        Ok(EdidBlock::from_bytes(&raw)?)
    }

    pub fn read_edid(&self, display: DisplayHandle) -> Option<[u8; edid::EDID_BLOCK_LENGTH]> {
        match self.try_read_edid(display) {
            Ok(block) => Some(block.into_bytes()),
            Err(error) => {
                log::warn!("{display}: edid not read: {error}");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Mutex, PoisonError},
        time::Duration,
    };

    use super::{
        edid::test::sample_block, BusCapabilities, BusId, BusTransport, DdcConfig, DdcController,
        DdcError, DisplayHandle, EndpointId, EndpointResolver, PhysicalEndpoint, ReplyFraming,
        TransactionOutcome, TransactionRequest, TransportError,
    };

    struct OneDisplay {
        buses: Vec<BusId>,
    }

    impl EndpointResolver for OneDisplay {
        fn resolve(&self, display: DisplayHandle, _: bool) -> Option<PhysicalEndpoint> {
            (display == DisplayHandle(1)).then(|| PhysicalEndpoint {
                id: EndpointId(1),
                buses: self.buses.clone(),
                vendor_id: 0x10ac,
                product_id: 0xa0c4,
                serial_number: 0,
                builtin: false,
            })
        }
    }

    /// answers only on one bus, records every request and delay
    struct PickyBus {
        answering: BusId,
        capabilities: Option<BusCapabilities>,
        reply: Vec<u8>,
        sent: Mutex<Vec<(BusId, TransactionRequest)>>,
        delays: Mutex<Vec<Duration>>,
    }

    impl PickyBus {
        fn new(answering: u32, reply: Vec<u8>) -> Self {
            Self {
                answering: BusId(answering),
                capabilities: Some(BusCapabilities::new(
                    BusCapabilities::SIMPLE_REPLY | BusCapabilities::DDC_CI_REPLY,
                    false,
                )),
                reply,
                sent: Mutex::new(Vec::new()),
                delays: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<(BusId, TransactionRequest)> {
            self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        fn delays(&self) -> Vec<Duration> {
            self.delays.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    impl BusTransport for PickyBus {
        type Connection = BusId;

        fn bus_capabilities(&self, _: &PhysicalEndpoint, _: BusId) -> Option<BusCapabilities> {
            self.capabilities
        }

        fn open(&self, _: &PhysicalEndpoint, bus: BusId) -> Result<BusId, TransportError> {
            Ok(bus)
        }

        fn send(
            &self,
            bus: &mut BusId,
            request: &TransactionRequest,
        ) -> Result<TransactionOutcome, TransportError> {
            self.sent.lock().unwrap().push((*bus, request.clone()));
            if *bus == self.answering {
                Ok(TransactionOutcome::with_reply(
                    self.reply[..request.reply_len].to_vec(),
                ))
            } else {
                Err(TransportError::NoDevice)
            }
        }

        fn delay(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    #[test]
    fn falls_through_to_the_answering_bus() {
        let controller = DdcController::new(
            OneDisplay {
                buses: vec![BusId(3), BusId(4)],
            },
            PickyBus::new(4, sample_block().to_vec()),
        );
        let edid = controller.try_read_edid(DisplayHandle(1)).unwrap();
        assert_eq!(edid.as_bytes(), &sample_block());
        let buses: Vec<_> = controller.transport().sent().into_iter().map(|(b, _)| b).collect();
        assert_eq!(buses, vec![BusId(3), BusId(4)]);
    }

    #[test]
    fn edid_request_uses_simple_framing_at_a0() {
        let controller = DdcController::new(
            OneDisplay {
                buses: vec![BusId(0)],
            },
            PickyBus::new(0, sample_block().to_vec()),
        );
        assert!(controller.read_edid(DisplayHandle(1)).is_some());
        let (_, request) = controller.transport().sent().remove(0);
        assert_eq!(request.send_address, 0xa0);
        assert_eq!(request.send, vec![0x00]);
        assert_eq!(request.reply_address, 0xa1);
        assert_eq!(request.reply_len, 128);
        assert_eq!(request.reply_framing, ReplyFraming::Simple);
    }

    #[test]
    fn corrupt_edid_is_not_retried() {
        let mut block = sample_block();
        block[20] ^= 0x01;
        let controller = DdcController::new(
            OneDisplay {
                buses: vec![BusId(0)],
            },
            PickyBus::new(0, block.to_vec()),
        );
        assert!(matches!(
            controller.try_read_edid(DisplayHandle(1)),
            Err(DdcError::EdidParseError(_))
        ));
        assert_eq!(controller.read_edid(DisplayHandle(1)), None);
        assert_eq!(controller.transport().sent().len(), 2);
    }

    #[test]
    fn write_holds_display_for_settle_delay() {
        let controller = DdcController::new(
            OneDisplay {
                buses: vec![BusId(0)],
            },
            PickyBus::new(0, Vec::new()),
        );
        assert!(controller.write_control(DisplayHandle(1), 0x10, 50));
        assert_eq!(
            controller.transport().delays(),
            vec![DdcConfig::default().write_settle_delay]
        );
        let (_, request) = controller.transport().sent().remove(0);
        assert_eq!(request.reply_framing, ReplyFraming::None);
        assert!(!request.expects_reply());
    }

    #[test]
    fn sub_address_bus_gets_reply_delay() {
        let mut transport = PickyBus::new(0, vec![0; 11]);
        transport.capabilities = Some(BusCapabilities::new(BusCapabilities::SIMPLE_REPLY, true));
        let controller = DdcController::new(
            OneDisplay {
                buses: vec![BusId(0)],
            },
            transport,
        );
        // the zero reply is invalid, only the request shape matters here
        let _ = controller.read_control(DisplayHandle(1), 0x10);
        let (_, request) = controller.transport().sent().remove(0);
        assert_eq!(request.reply_framing, ReplyFraming::Simple);
        assert_eq!(request.min_reply_delay, DdcConfig::default().reply_delay);
    }

    #[test]
    fn missing_metadata_uses_fallback_or_fails() {
        let mut transport = PickyBus::new(0, vec![0; 11]);
        transport.capabilities = None;
        let config = DdcConfig {
            fallback_framing: None,
            ..DdcConfig::default()
        };
        let controller = DdcController::with_config(
            OneDisplay {
                buses: vec![BusId(0)],
            },
            transport,
            config,
        );
        assert!(matches!(
            controller.try_read_control(DisplayHandle(1), 0x10),
            Err(DdcError::UnsupportedFraming)
        ));
        assert!(controller.transport().sent().is_empty());
    }

    #[test]
    fn no_reply_only_bus_cannot_serve_reads() {
        let mut transport = PickyBus::new(0, vec![0; 11]);
        transport.capabilities = Some(BusCapabilities::new(BusCapabilities::NO_REPLY, false));
        let controller = DdcController::new(
            OneDisplay {
                buses: vec![BusId(0)],
            },
            transport,
        );
        let result = controller.read_control(DisplayHandle(1), 0x10);
        assert!(!result.success);
        assert!(controller.transport().sent().is_empty());
        // writes need no reply phase and still go through
        assert!(controller.write_control(DisplayHandle(1), 0x10, 1));
    }

    #[test]
    fn unknown_display_is_not_found() {
        let controller = DdcController::new(
            OneDisplay {
                buses: vec![BusId(0)],
            },
            PickyBus::new(0, Vec::new()),
        );
        assert!(matches!(
            controller.try_write_control(DisplayHandle(9), 0x10, 1),
            Err(DdcError::EndpointNotFound)
        ));
        assert!(!controller.read_control(DisplayHandle(9), 0x10).success);
        assert!(controller.transport().sent().is_empty());
    }
}
