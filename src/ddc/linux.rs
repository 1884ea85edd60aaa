use i2cdev::{
    core::I2CTransfer,
    linux::{I2CMessage, LinuxI2CBus},
};
use std::{
    ffi::OsStr,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use super::{
    edid::{EdidBlock, EDID_BLOCK_LENGTH, EDID_WRITE_ADDR},
    framing::BusCapabilities,
    resolver::{
        BusId, DeriveEndpointResolver, DisplayHandle, DisplayIdentity, DisplayRegistry,
        EndpointId, PhysicalEndpoint,
    },
    transport::{BusTransport, TransactionOutcome, TransactionRequest, TransportError},
};

/// E-DDC segment pointer, reset before reading the base block
const EDDC_SEGMENT_POINTER_ADDR: u16 = 0x30;
/// quiet time the display needs after answering a read
const POST_READ_DELAY: Duration = Duration::from_millis(50);

/// connector types that are wired to an internal panel
const BUILTIN_CONNECTOR_PREFIX: [&str; 3] = ["eDP", "LVDS", "DSI"];

fn io_error(err: impl std::error::Error + Send + Sync + 'static) -> TransportError {
    TransportError::Io(anyhow::Error::new(err))
}

fn open_bus(bus: BusId) -> Result<LinuxI2CBus, TransportError> {
    LinuxI2CBus::new(format!("/dev/i2c-{}", bus.0)).map_err(io_error)
}

fn read_sysfs_edid(connector_path: &Path) -> Option<EdidBlock> {
    let mut data = [0u8; EDID_BLOCK_LENGTH];
    File::open(connector_path.join("edid"))
        .and_then(|mut f| f.read_exact(&mut data))
        .ok()?;
    EdidBlock::from_bytes(&data).ok()
}

fn read_sysfs_value(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|content| content.trim().to_string())
}

// filter phantom devices, devices connected via docking stations may appear as two seperate
// i2c devices with only one working (workaround copied from ddcutil)
fn is_phantom_ddc_device(id: usize) -> bool {
    let device_path = Path::new("/sys/bus/i2c/devices").join(format!("i2c-{id}"));
    if !device_path.exists() {
        // it can not be a valid device if it is not found in the system tree
        return true;
    }
    let device = device_path.join("device");
    read_sysfs_value(&device.join("enabled")).is_some_and(|enabled| enabled == "disabled")
        && read_sysfs_value(&device.join("status")).is_some_and(|status| status == "disconnected")
}

// ignore devices that are probably not related to a monitor
fn ignore_device_by_name(name: &OsStr) -> bool {
    // list stolen from ddcutil's ignorable_i2c_device_sysfs_name
    let skip_prefix = ["SMBus", "soc:i2cdsi", "smu", "mac-io", "u4"];

    name.to_str()
        .is_some_and(|name| skip_prefix.iter().any(|prefix| name.starts_with(prefix)))
}

fn is_drm(dev: &udev::Device) -> bool {
    dev.subsystem().is_some_and(|subsystem| subsystem == "drm")
}

/// bus number of an `i2c-N` adapter path, e.g. the target of a connector's `ddc` link
fn bus_from_adapter_path(path: &Path) -> Option<BusId> {
    path.file_name()?
        .to_str()?
        .strip_prefix("i2c-")?
        .parse()
        .ok()
        .map(BusId)
}

/// A drm connector with a monitor attached.
struct Connector {
    syspath: PathBuf,
    connector_id: Option<u32>,
    /// adapter the connector's `ddc` link points to
    ddc_bus: Option<BusId>,
    name: String,
    edid: Option<EdidBlock>,
}

impl Connector {
    fn from_device(dev: &udev::Device) -> Self {
        let name = dev
            .sysname()
            .to_str()
            .and_then(|sysname| sysname.split_once('-'))
            .map(|(_card, name)| name.to_string())
            .unwrap_or_default();
        Self {
            syspath: dev.syspath().to_path_buf(),
            connector_id: dev
                .attribute_value("connector_id")
                .and_then(|id| id.to_str())
                .and_then(|id| id.trim().parse().ok()),
            ddc_bus: fs::read_link(dev.syspath().join("ddc"))
                .ok()
                .and_then(|target| bus_from_adapter_path(&target)),
            name,
            edid: read_sysfs_edid(dev.syspath()),
        }
    }

    fn is_builtin(&self) -> bool {
        BUILTIN_CONNECTOR_PREFIX
            .iter()
            .any(|prefix| self.name.starts_with(prefix))
    }

    fn identity(&self) -> Option<DisplayIdentity> {
        self.edid
            .as_ref()
            .and_then(|edid| edid.header().ok())
            .map(|header| header.identity())
    }
}

fn drm_connectors() -> Vec<Connector> {
    let scan = udev::Enumerator::new().and_then(|mut drm_enum| {
        drm_enum.match_subsystem("drm")?;
        let connectors = drm_enum
            .scan_devices()?
            .filter(|dev| dev.syspath().join("edid").exists())
            .map(|dev| Connector::from_device(&dev))
            .collect::<Vec<_>>();
        Ok(connectors)
    });
    scan.unwrap_or_else(|err| {
        log::warn!("failed to enumerate drm connectors: {err}");
        Vec::new()
    })
}

/// drm connector a display i2c bus belongs to, decided from sysfs alone
///
/// Buses are never opened here: resolving runs outside the display lock and
/// must not put traffic on a bus another thread may be talking on.
fn find_parent_connector(i2c_dev: &udev::Device, connectors: &[Connector]) -> Option<usize> {
    let i2c_parent = i2c_dev.parent()?;
    if let Some(graphics_device) = i2c_parent.parent().filter(is_drm) {
        // display device with type drm are easy because it is already correctly mapped
        let syspath = graphics_device.syspath();
        if let Some(index) = connectors.iter().position(|c| c.syspath == syspath) {
            return Some(index);
        }
    }
    // bus registered on the graphics card itself, the connector links to it
    let bus = BusId(i2c_dev.sysnum()?.try_into().ok()?);
    connectors.iter().position(|c| c.ddc_bus == Some(bus))
}

/// Display registry backed by udev, DRM connectors and `i2c-dev` buses.
///
/// Display handles are DRM connector ids as reported in the connector's
/// sysfs `connector_id` attribute.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxDisplayRegistry;

impl DisplayRegistry for LinuxDisplayRegistry {
    fn display_identity(&self, display: DisplayHandle) -> Option<DisplayIdentity> {
        drm_connectors()
            .into_iter()
            .find(|connector| connector.connector_id == Some(display.0))
            .and_then(|connector| connector.identity())
    }

    fn endpoints(&self) -> Vec<PhysicalEndpoint> {
        let connectors = drm_connectors();
        let mut buses: Vec<Vec<BusId>> = vec![Vec::new(); connectors.len()];

        let i2c_devices = udev::Enumerator::new().and_then(|mut i2c_enum| {
            i2c_enum.match_subsystem("i2c-dev")?;
            let devices = i2c_enum.scan_devices()?.collect::<Vec<_>>();
            Ok(devices)
        });
        let i2c_devices = match i2c_devices {
            Ok(devices) => devices,
            Err(err) => {
                log::warn!("failed to enumerate i2c devices: {err}");
                return Vec::new();
            }
        };

        for i2c_device in i2c_devices.iter().filter(|dev| {
            dev.attribute_value("name")
                .is_some_and(|name| !ignore_device_by_name(name))
                && dev.sysnum().is_some_and(|id| !is_phantom_ddc_device(id))
        }) {
            let (Some(sysnum), Some(index)) = (
                i2c_device.sysnum(),
                find_parent_connector(i2c_device, &connectors),
            ) else {
                continue;
            };
            buses[index].push(BusId(sysnum as u32));
        }

        connectors
            .iter()
            .zip(buses)
            .filter_map(|(connector, buses)| {
                let identity = connector.identity()?;
                Some(PhysicalEndpoint {
                    id: EndpointId(connector.connector_id?.into()),
                    buses,
                    vendor_id: identity.vendor_id,
                    product_id: identity.product_id,
                    serial_number: identity.serial_number,
                    builtin: connector.is_builtin(),
                })
            })
            .collect()
    }
}

impl DeriveEndpointResolver for LinuxDisplayRegistry {}

/// Bus transport over `/dev/i2c-*` character devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxI2cTransport;

impl BusTransport for LinuxI2cTransport {
    type Connection = LinuxI2CBus;

    fn bus_capabilities(&self, _endpoint: &PhysicalEndpoint, _bus: BusId) -> Option<BusCapabilities> {
        // i2c-dev passes raw transfers through, reply framing is done in user space
        Some(BusCapabilities::new(
            BusCapabilities::NO_REPLY | BusCapabilities::SIMPLE_REPLY | BusCapabilities::DDC_CI_REPLY,
            true,
        ))
    }

    fn open(&self, _endpoint: &PhysicalEndpoint, bus: BusId) -> Result<LinuxI2CBus, TransportError> {
        open_bus(bus)
    }

    fn send(
        &self,
        i2c_bus: &mut LinuxI2CBus,
        request: &TransactionRequest,
    ) -> Result<TransactionOutcome, TransportError> {
        if request.send_address == EDID_WRITE_ADDR {
            // may fail if display does not implement eddc for the current input
            let _ = i2c_bus.transfer(&mut [i2cdev::linux::LinuxI2CMessage::write(&[0x0])
                .with_address(EDDC_SEGMENT_POINTER_ADDR)]);
        }

        let mut data = Vec::with_capacity(request.send.len() + 1);
        data.extend(request.send_sub_address);
        data.extend_from_slice(&request.send);
        i2c_bus
            .transfer(&mut [i2cdev::linux::LinuxI2CMessage::write(&data)
                .with_address((request.send_address >> 1).into())])
            .map_err(io_error)?;

        if !request.expects_reply() {
            return Ok(TransactionOutcome::default());
        }
        if !request.min_reply_delay.is_zero() {
            self.delay(request.min_reply_delay);
        }

        let mut reply = vec![0u8; request.reply_len];
        i2c_bus
            .transfer(&mut [i2cdev::linux::LinuxI2CMessage::read(&mut reply)
                .with_address((request.reply_address >> 1).into())])
            .map_err(io_error)?;
        Ok(TransactionOutcome {
            reply,
            min_delay: Some(POST_READ_DELAY),
        })
    }
}
