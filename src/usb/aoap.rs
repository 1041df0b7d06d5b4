//! The accessory mode query chain.
//!
//! An android phone that is not yet in accessory mode is switched into it
//! with a fixed sequence of eight vendor control transfers: read the aoap
//! protocol version, send the six identity strings, then start. After the
//! start request the phone drops off the bus and re-enumerates under an
//! accessory product id; discovery picks it up again from there.

use std::time::Duration;

use rusb::{Context, DeviceHandle};

use crate::error::AutoError;
use crate::UsbIdentity;

/// Vendor request to read the aoap protocol version
const ACC_REQ_GET_PROTOCOL: u8 = 51;
/// Vendor request to send one identity string
const ACC_REQ_SEND_STRING: u8 = 52;
/// Vendor request to switch the device into accessory mode
const ACC_REQ_START: u8 = 53;
/// bmRequestType for vendor reads
const REQUEST_TYPE_IN: u8 = 0xC0;
/// bmRequestType for vendor writes
const REQUEST_TYPE_OUT: u8 = 0x40;
/// Per control transfer timeout
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(2);
/// Watchdog for the whole chain; the phone may sit on a user consent prompt
const CHAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The manufacturer string sent in the query chain
pub const ACCESSORY_MANUFACTURER: &str = "Android";
/// The model string sent in the query chain
pub const ACCESSORY_MODEL: &str = "Android Auto";
/// The description string sent in the query chain
pub const ACCESSORY_DESCRIPTION: &str = "Android Auto";
/// The version string sent in the query chain
pub const ACCESSORY_VERSION: &str = "2.0.1";

/// Run the eight step query chain against an opened device, switching it
/// into accessory mode. The handle is consumed; the device re-enumerates
/// after the final step and must be discovered again.
pub async fn run_query_chain(
    handle: DeviceHandle<Context>,
    identity: UsbIdentity,
) -> Result<(), AutoError> {
    let work = tokio::task::spawn_blocking(move || query_chain_blocking(&handle, &identity));
    match tokio::time::timeout(CHAIN_TIMEOUT, work).await {
        Ok(Ok(r)) => r,
        Ok(Err(join)) => {
            log::error!("Query chain task failed: {}", join);
            Err(AutoError::Cancelled)
        }
        Err(_) => {
            log::warn!("Query chain watchdog expired after {:?}", CHAIN_TIMEOUT);
            Err(AutoError::Timeout)
        }
    }
}

/// The blocking body of the query chain, one step after another
fn query_chain_blocking(
    handle: &DeviceHandle<Context>,
    identity: &UsbIdentity,
) -> Result<(), AutoError> {
    let mut version = [0u8; 2];
    handle
        .read_control(
            REQUEST_TYPE_IN,
            ACC_REQ_GET_PROTOCOL,
            0,
            0,
            &mut version,
            TRANSFER_TIMEOUT,
        )
        .map_err(|e| AutoError::AoapQuery { step: 1, source: e })?;
    let version = u16::from_le_bytes(version);
    if version < 1 {
        log::warn!("Device reports aoap protocol version {}", version);
        return Err(AutoError::AoapQuery {
            step: 1,
            source: rusb::Error::NotSupported,
        });
    }
    log::debug!("Device aoap protocol version {}", version);

    let strings: [&str; 6] = [
        ACCESSORY_MANUFACTURER,
        ACCESSORY_MODEL,
        ACCESSORY_DESCRIPTION,
        ACCESSORY_VERSION,
        &identity.uri,
        &identity.serial,
    ];
    for (index, s) in strings.iter().enumerate() {
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        handle
            .write_control(
                REQUEST_TYPE_OUT,
                ACC_REQ_SEND_STRING,
                0,
                index as u16,
                &data,
                TRANSFER_TIMEOUT,
            )
            .map_err(|e| AutoError::AoapQuery {
                step: (index + 2) as u8,
                source: e,
            })?;
    }

    handle
        .write_control(REQUEST_TYPE_OUT, ACC_REQ_START, 0, 0, &[], TRANSFER_TIMEOUT)
        .map_err(|e| AutoError::AoapQuery { step: 8, source: e })?;
    log::info!("Accessory mode start sent, waiting for re-enumeration");
    Ok(())
}
