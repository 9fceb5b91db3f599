//! Bulk-endpoint transport for ST-Link probes.
//!
//! Every exchange is a 16-byte command on the out endpoint, optionally
//! followed by a data-out phase, optionally followed by a data-in phase
//! read until the caller's buffer is full.

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::probe::ProbeError;

const CMD_LEN: usize = 16;

pub const USB_VID: u16 = 0x0483;

pub const TIMEOUT: Duration = Duration::from_millis(1000);

/// Known PIDs with their endpoint numbers (out, in).
const USB_PID_EP_MAP: &[(u16, &str, u8, u8)] = &[
    (0x3748, "V2", 0x02, 0x81),
    (0x374b, "V2-1", 0x01, 0x81),
    (0x374a, "V2-1", 0x01, 0x81),
    (0x3742, "V2-1", 0x01, 0x81),
    (0x3752, "V2-1", 0x01, 0x81),
    (0x374e, "V3", 0x01, 0x81),
    (0x374f, "V3", 0x01, 0x81),
    (0x3753, "V3", 0x01, 0x81),
];

fn endpoint_info(pid: u16) -> Option<(&'static str, u8, u8)> {
    USB_PID_EP_MAP
        .iter()
        .find(|(known, _, _, _)| *known == pid)
        .map(|(_, name, ep_out, ep_in)| (*name, *ep_out, *ep_in))
}

/// `STLINK_DEVICE=<bus>:<addr>` narrows device selection when several
/// probes are plugged in.
fn env_selector() -> Option<(u8, u8)> {
    let value = std::env::var("STLINK_DEVICE").ok()?;
    let (bus, addr) = value.split_once(':')?;
    Some((bus.trim().parse().ok()?, addr.trim().parse().ok()?))
}

pub(super) struct StLinkUsbDevice {
    handle: DeviceHandle<Context>,
    ep_out: u8,
    ep_in: u8,
}

fn read_serial<T: UsbContext>(device: &Device<T>) -> Option<String> {
    let descriptor = device.device_descriptor().ok()?;
    let handle = device.open().ok()?;
    handle.read_serial_number_string_ascii(&descriptor).ok()
}

impl StLinkUsbDevice {
    /// Finds and claims an ST-Link, honoring the serial filter and the
    /// `STLINK_DEVICE` environment variable.
    pub fn open(serial: Option<&str>) -> Result<Self, ProbeError> {
        let context = Context::new()?;
        let selector = env_selector();

        let device = context
            .devices()?
            .iter()
            .find(|device| {
                let Ok(descriptor) = device.device_descriptor() else {
                    return false;
                };
                if descriptor.vendor_id() != USB_VID
                    || endpoint_info(descriptor.product_id()).is_none()
                {
                    return false;
                }
                if let Some((bus, addr)) = selector {
                    if device.bus_number() != bus || device.address() != addr {
                        return false;
                    }
                }
                match serial {
                    Some(wanted) => read_serial(device).as_deref() == Some(wanted),
                    None => true,
                }
            })
            .ok_or(ProbeError::ProbeNotFound)?;

        let descriptor = device.device_descriptor()?;
        let (version, ep_out, ep_in) =
            endpoint_info(descriptor.product_id()).ok_or(ProbeError::ProbeNotFound)?;

        let mut handle = device.open()?;
        handle.claim_interface(0)?;

        tracing::debug!(
            "claimed ST-Link {} at bus {:03} addr {:03}",
            version,
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            handle,
            ep_out,
            ep_in,
        })
    }

    /// Sends a command, streams `write_data` out and fills `read_data` in.
    pub fn write(
        &mut self,
        cmd: &[u8],
        write_data: &[u8],
        read_data: &mut [u8],
    ) -> Result<(), ProbeError> {
        tracing::trace!("sending command {:x?} to ST-Link", cmd);

        debug_assert!(cmd.len() <= CMD_LEN);
        let mut padded = [0u8; CMD_LEN];
        padded[..cmd.len()].copy_from_slice(cmd);

        self.handle.write_bulk(self.ep_out, &padded, TIMEOUT)?;

        let mut index = 0;
        while index < write_data.len() {
            index += self
                .handle
                .write_bulk(self.ep_out, &write_data[index..], TIMEOUT)?;
        }

        let mut index = 0;
        while index < read_data.len() {
            index += self
                .handle
                .read_bulk(self.ep_in, &mut read_data[index..], TIMEOUT)?;
        }

        Ok(())
    }

    pub fn release(&mut self) {
        let _ = self.handle.release_interface(0);
    }
}

impl Drop for StLinkUsbDevice {
    fn drop(&mut self) {
        self.release();
    }
}
