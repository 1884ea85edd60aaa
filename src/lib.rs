//! DDC/CI transport layer
//!
//! Talk to VESA monitors over the I2C bus of their framebuffer: read and write
//! VCP controls and read the EDID base block. Platform specifics live behind
//! the [`EndpointResolver`] and [`BusTransport`] traits, a Linux backend is
//! available with the `linux` feature.
//!
//! ```rust
//! use std::time::Duration;
//! use libddc::{
//!     BusCapabilities, BusId, BusTransport, DdcController, DisplayHandle, EndpointId,
//!     EndpointResolver, PhysicalEndpoint, TransactionOutcome, TransactionRequest,
//!     TransportError,
//! };
//!
//! struct Panel;
//!
//! impl EndpointResolver for Panel {
//!     fn resolve(&self, _: DisplayHandle, _: bool) -> Option<PhysicalEndpoint> {
//!         Some(PhysicalEndpoint {
//!             id: EndpointId(0),
//!             buses: vec![BusId(0)],
//!             vendor_id: 0,
//!             product_id: 0,
//!             serial_number: 0,
//!             builtin: false,
//!         })
//!     }
//! }
//!
//! struct AcceptAll;
//!
//! impl BusTransport for AcceptAll {
//!     type Connection = ();
//!     fn bus_capabilities(&self, _: &PhysicalEndpoint, _: BusId) -> Option<BusCapabilities> {
//!         None
//!     }
//!     fn open(&self, _: &PhysicalEndpoint, _: BusId) -> Result<(), TransportError> {
//!         Ok(())
//!     }
//!     fn send(&self, _: &mut (), _: &TransactionRequest) -> Result<TransactionOutcome, TransportError> {
//!         Ok(TransactionOutcome::default())
//!     }
//!     fn delay(&self, _: Duration) {}
//! }
//!
//! let ddc = DdcController::new(Panel, AcceptAll);
//! assert!(ddc.write_control(DisplayHandle(1), 0x10, 50));
//! ```

pub mod ddc;

pub use ddc::{
    BusCapabilities, BusId, BusTransport, DdcConfig, DdcController, DdcError,
    DeriveEndpointResolver, DisplayHandle, DisplayIdentity, DisplayRegistry, EdidBlock,
    EndpointId, EndpointResolver, LogObserver, PhysicalEndpoint, ReplyFraming, RetryObserver,
    RetryPolicy, TransactionOutcome, TransactionRequest, TransportError, VcpReadResult,
};

#[cfg(all(target_os = "linux", feature = "linux"))]
use crate::ddc::linux::{LinuxDisplayRegistry, LinuxI2cTransport};

#[cfg(all(target_os = "linux", feature = "linux"))]
pub type LinuxDdc = DdcController<LinuxDisplayRegistry, LinuxI2cTransport>;

#[cfg(all(target_os = "linux", feature = "linux"))]
impl LinuxDdc {
    /// Controller for the displays attached to this machine
    ///
    /// ```rust,no_run
    /// use libddc::{DisplayHandle, LinuxDdc};
    ///
    /// let ddc = LinuxDdc::system();
    /// let brightness = ddc.read_control(DisplayHandle(77), 0x10);
    /// println!("{brightness:?}");
    /// ```
    pub fn system() -> Self {
        DdcController::new(LinuxDisplayRegistry, LinuxI2cTransport)
    }
}
