//! Display resolution
//!
//! Maps the caller's logical display handle to the framebuffer device and the
//! buses DDC/CI traffic for it has to go through.

use std::fmt::{self, Display, Formatter};

/// Opaque caller supplied identifier of a logical display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DisplayHandle(pub u32);

impl Display for DisplayHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "display {}", self.0)
    }
}

/// Platform registry id of a framebuffer device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointId(pub u64);

/// Platform index of a communication bus on a framebuffer device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusId(pub u32);

/// What the platform knows about the monitor behind a display handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayIdentity {
    pub vendor_id: u32,
    pub product_id: u32,
    pub serial_number: u32,
}

/// Resolved communication path to a display's controller.
///
/// Only valid for the request it was resolved for, the device registry may
/// change with every hot plug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalEndpoint {
    pub id: EndpointId,
    /// candidate buses in the order they should be tried
    pub buses: Vec<BusId>,
    pub vendor_id: u32,
    pub product_id: u32,
    pub serial_number: u32,
    /// internal panels enumerate a bus but never answer DDC/CI
    pub builtin: bool,
}

impl PhysicalEndpoint {
    pub fn identity(&self) -> DisplayIdentity {
        DisplayIdentity {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial_number: self.serial_number,
        }
    }
}

/// Resolve a display handle to the endpoint to talk to.
pub trait EndpointResolver {
    fn resolve(&self, display: DisplayHandle, exclude_builtin: bool) -> Option<PhysicalEndpoint>;
}

/// Platform device registry
///
/// implement this and [`DeriveEndpointResolver`] to get the registry walking
/// [`EndpointResolver`] for free.
pub trait DisplayRegistry {
    /// identity of the monitor currently shown on `display`
    fn display_identity(&self, display: DisplayHandle) -> Option<DisplayIdentity>;

    /// framebuffer services in registry enumeration order
    fn endpoints(&self) -> Vec<PhysicalEndpoint>;
}

pub trait DeriveEndpointResolver: DisplayRegistry {}

impl<X> EndpointResolver for X
where
    X: DeriveEndpointResolver,
{
    fn resolve(&self, display: DisplayHandle, exclude_builtin: bool) -> Option<PhysicalEndpoint> {
        let identity = self.display_identity(display)?;
        let endpoint = find_endpoint(self.endpoints(), &identity, exclude_builtin);
        if endpoint.is_none() {
            log::debug!("{display} ({identity:x?}) has no DDC capable endpoint");
        }
        endpoint
    }
}

/// First candidate that has a bus, is not an excluded internal panel and
/// carries the requested identity.
///
/// Identical monitors that both report serial number 0 can not be told apart,
/// either of them may be returned.
pub fn find_endpoint<I>(
    candidates: I,
    identity: &DisplayIdentity,
    exclude_builtin: bool,
) -> Option<PhysicalEndpoint>
where
    I: IntoIterator<Item = PhysicalEndpoint>,
{
    candidates.into_iter().find(|candidate| {
        !candidate.buses.is_empty()
            && !(exclude_builtin && candidate.builtin)
            && candidate.identity() == *identity
    })
}
