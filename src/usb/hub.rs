//! Usb device discovery for the android auto head unit.
//!
//! The hub scans the bus, hands back devices that are already in accessory
//! mode, and runs the query chain against android candidates so they
//! re-enumerate in accessory mode on a later scan. Hot-plug is covered by
//! rescanning on a short cadence.

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, UsbContext};

use super::aoap;
use super::transport::AoapDeviceHandle;
use crate::error::AutoError;
use crate::UsbIdentity;

/// How long to wait between opening attempts on a freshly enumerated device
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(300);
/// How often to attempt opening a freshly enumerated device
const OPEN_ATTEMPTS: u32 = 3;

/// What one pass over the device list found
enum Scan {
    /// A device already in accessory mode
    Aoap(Device<Context>),
    /// A device worth running the query chain against
    Candidate(Device<Context>),
    /// Nothing usable on the bus
    Nothing,
}

/// Discovers android auto capable devices on the usb bus
pub struct UsbHub {
    /// The usb library context, owned here for the life of the supervisor
    context: Context,
    /// The identity strings sent during the query chain
    identity: UsbIdentity,
}

impl UsbHub {
    /// Create a hub with its own usb context
    pub fn new(identity: UsbIdentity) -> Result<Self, AutoError> {
        let context = Context::new()?;
        Ok(Self { context, identity })
    }

    /// Scan the bus once. Returns an opened accessory mode device if one is
    /// present; otherwise runs the query chain against the best candidate
    /// and returns None so the caller rescans after re-enumeration.
    pub async fn scan_once(&self) -> Result<Option<AoapDeviceHandle>, AutoError> {
        let context = self.context.clone();
        let scan = tokio::task::spawn_blocking(move || classify(&context))
            .await
            .map_err(|_| AutoError::Cancelled)??;
        match scan {
            Scan::Aoap(device) => {
                let opened = tokio::task::spawn_blocking(move || open_aoap(&device))
                    .await
                    .map_err(|_| AutoError::Cancelled)??;
                Ok(Some(opened))
            }
            Scan::Candidate(device) => {
                let handle = tokio::task::spawn_blocking(move || device.open())
                    .await
                    .map_err(|_| AutoError::Cancelled)?;
                match handle {
                    Ok(handle) => {
                        if let Err(e) =
                            aoap::run_query_chain(handle, self.identity.clone()).await
                        {
                            log::warn!("Query chain did not complete: {}", e);
                        }
                    }
                    Err(e) => {
                        log::warn!("Could not open candidate device: {}", e);
                    }
                }
                Ok(None)
            }
            Scan::Nothing => Ok(None),
        }
    }
}

/// Walk the device list and pick what to do this scan
fn classify(context: &Context) -> Result<Scan, AutoError> {
    let mut candidate = None;
    for device in context.devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                log::debug!("Unreadable device descriptor: {}", e);
                continue;
            }
        };
        let vendor = desc.vendor_id();
        let product = desc.product_id();
        if vendor == super::LINUX_FOUNDATION_VID {
            continue;
        }
        if super::is_aoap(vendor, product) {
            log::info!(
                "Found accessory mode device {:04x}:{:04x}",
                vendor,
                product
            );
            return Ok(Scan::Aoap(device));
        }
        // prefer google devices, fall back to anything else on the bus
        if vendor == super::GOOGLE_VID {
            candidate = Some(device);
        } else if candidate.is_none() {
            candidate = Some(device);
        }
    }
    Ok(match candidate {
        Some(device) => {
            let desc = device.device_descriptor()?;
            log::info!(
                "Running accessory query chain against {:04x}:{:04x}",
                desc.vendor_id(),
                desc.product_id()
            );
            Scan::Candidate(device)
        }
        None => Scan::Nothing,
    })
}

/// Open an accessory mode device, claim its interface and locate the bulk
/// endpoints. Opening retries a few times because the device may still be
/// settling right after re-enumeration.
fn open_aoap(device: &Device<Context>) -> Result<AoapDeviceHandle, AutoError> {
    let mut handle = None;
    for attempt in 0..OPEN_ATTEMPTS {
        match device.open() {
            Ok(h) => {
                handle = Some(h);
                break;
            }
            Err(e) if attempt + 1 < OPEN_ATTEMPTS => {
                log::debug!("Open attempt {} failed: {}, retrying", attempt + 1, e);
                std::thread::sleep(OPEN_RETRY_DELAY);
            }
            Err(e) => return Err(e.into()),
        }
    }
    let handle = handle.ok_or(AutoError::Usb(rusb::Error::NoDevice))?;
    setup_interface(device, handle)
}

/// Detach any kernel driver, claim the accessory interface and find the
/// bulk in and out endpoints.
fn setup_interface(
    device: &Device<Context>,
    handle: DeviceHandle<Context>,
) -> Result<AoapDeviceHandle, AutoError> {
    let interface = 0u8;
    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            log::debug!("Detaching kernel driver from interface {}", interface);
            handle.detach_kernel_driver(interface)?;
        }
        Ok(false) => {}
        Err(e) => {
            // some platforms cannot answer this, claiming will tell us
            log::debug!("Could not query kernel driver state: {}", e);
        }
    }
    handle.claim_interface(interface)?;

    let config = device.active_config_descriptor()?;
    let mut ep_in = None;
    let mut ep_out = None;
    for iface in config.interfaces() {
        for desc in iface.descriptors() {
            if desc.interface_number() != interface {
                continue;
            }
            for ep in desc.endpoint_descriptors() {
                if ep.transfer_type() == rusb::TransferType::Bulk {
                    match ep.direction() {
                        rusb::Direction::In => ep_in = Some(ep.address()),
                        rusb::Direction::Out => ep_out = Some(ep.address()),
                    }
                }
            }
        }
    }
    let (ep_in, ep_out) = match (ep_in, ep_out) {
        (Some(i), Some(o)) => (i, o),
        _ => {
            log::error!("Accessory interface is missing bulk endpoints");
            let _ = handle.release_interface(interface);
            return Err(AutoError::Usb(rusb::Error::NotFound));
        }
    };
    log::debug!("Accessory endpoints in={:#04x} out={:#04x}", ep_in, ep_out);
    Ok(AoapDeviceHandle::new(handle, interface, ep_in, ep_out))
}
