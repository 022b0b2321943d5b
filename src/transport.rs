//! USB transport: wraps `rusb` with the two primitives the boot protocol
//! needs -- a size-prefix control transfer (`send_size`/`read`) and a
//! chunked, stall-tolerant bulk write (`write_payload`).

use crate::config::Config;
use crate::error::{ProtocolError, Result};
use log::{debug, trace, warn};
use rusb::{Device, DeviceHandle, Direction, Recipient, RequestType, TransferType, UsbContext};
use std::time::Duration;

const BULK_CHUNK_SIZE: usize = 1024 * 1024;

/// The re-used `GET_STATUS` request code the ROM expects for size-prefix
/// transfers, in both directions.
const SIZE_PREFIX_REQUEST: u8 = 0;

/// An open, interface-claimed handle to a single physical device, ready to
/// speak the size-prefix/bulk framing the boot ROM and stage-2 loader use.
pub struct UsbTransport<T: UsbContext> {
    device: Device<T>,
    handle: DeviceHandle<T>,
    interface: u8,
    out_endpoint: u8,
    control_timeout: Duration,
    bulk_timeout: Duration,
    stall_retries: u32,
}

impl<T: UsbContext> UsbTransport<T> {
    /// Opens `device`, selects the interface/endpoint pair per the device's
    /// interface count, and claims it. Timeouts and stall-retry count come
    /// from `config`.
    pub fn open(device: Device<T>, config: &Config) -> Result<Self> {
        let active_config = device.active_config_descriptor()?;
        let num_interfaces = active_config.interfaces().count();
        let (interface, endpoint_number) = if num_interfaces == 1 {
            (0u8, 1u8)
        } else {
            (1u8, 3u8)
        };

        let out_endpoint = find_bulk_out_endpoint(&active_config, interface, endpoint_number)
            .ok_or(ProtocolError::EndpointMismatch)?;

        let handle = device.open()?;

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(interface).unwrap_or(false) {
                let _ = handle.detach_kernel_driver(interface);
            }
        }

        handle.claim_interface(interface)?;

        debug!(
            "opened transport: interface={interface} out_endpoint=0x{out_endpoint:02x}"
        );

        Ok(Self {
            device,
            handle,
            interface,
            out_endpoint,
            control_timeout: config.control_timeout,
            bulk_timeout: config.bulk_timeout,
            stall_retries: config.stall_retries,
        })
    }

    /// The size-prefix control transfer that tells the ROM/loader how many
    /// bytes to expect next, or reports `0` to mean "file absent".
    pub fn send_size(&self, n: u32) -> Result<()> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle.write_control(
            request_type,
            SIZE_PREFIX_REQUEST,
            (n & 0xFFFF) as u16,
            (n >> 16) as u16,
            &[],
            self.control_timeout,
        )?;
        Ok(())
    }

    /// The size-prefix control read: an IN transfer of up to `len` bytes.
    /// Identical in shape to `send_size` -- the length is encoded into
    /// `wValue`/`wIndex` the same way, just with the direction bit flipped.
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut buf = vec![0u8; len];
        let received = self
            .handle
            .read_control(
                request_type,
                SIZE_PREFIX_REQUEST,
                (len & 0xFFFF) as u16,
                (len >> 16) as u16,
                &mut buf,
                self.control_timeout,
            )
            .map_err(classify_read_error)?;
        buf.truncate(received);
        Ok(buf)
    }

    /// Sends `bytes` as a size-prefixed bulk write: `send_size` followed by
    /// 1 MiB chunks, each retried up to 3 times total on a stall.
    pub fn write_payload(&self, bytes: &[u8]) -> Result<()> {
        self.send_size(bytes.len() as u32)?;
        if bytes.is_empty() {
            return Ok(());
        }
        for chunk in bytes.chunks(BULK_CHUNK_SIZE) {
            self.write_chunk_with_retry(chunk)?;
        }
        Ok(())
    }

    fn write_chunk_with_retry(&self, chunk: &[u8]) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            trace!(
                "bulk write attempt {attempt} of {}, {} bytes",
                self.stall_retries,
                chunk.len()
            );
            match self.handle.write_bulk(self.out_endpoint, chunk, self.bulk_timeout) {
                Ok(_) => return Ok(()),
                Err(rusb::Error::Pipe) if attempt < self.stall_retries => {
                    warn!("bulk write stalled, retrying (attempt {attempt})");
                    let _ = self.handle.clear_halt(self.out_endpoint);
                }
                Err(rusb::Error::Pipe) => return Err(ProtocolError::TransferStall),
                Err(rusb::Error::Timeout) => return Err(ProtocolError::TransferTimeout),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Best-effort nudge after the file-server loop exits: some hosts need
    /// an extra `open()` to release a stale handle before the device
    /// re-enumerates as mass storage. Any error is swallowed.
    pub fn reopen_nudge(&self) {
        let _ = self.device.open();
    }
}

impl<T: UsbContext> Drop for UsbTransport<T> {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface);
    }
}

fn find_bulk_out_endpoint(
    config: &rusb::ConfigDescriptor,
    interface: u8,
    endpoint_number: u8,
) -> Option<u8> {
    for iface in config.interfaces() {
        if iface.number() != interface {
            continue;
        }
        for descriptor in iface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.number() == endpoint_number
                    && endpoint.direction() == Direction::Out
                    && endpoint.transfer_type() == TransferType::Bulk
                {
                    return Some(endpoint.address());
                }
            }
        }
    }
    None
}

fn classify_read_error(e: rusb::Error) -> ProtocolError {
    match e {
        rusb::Error::NoDevice | rusb::Error::Io => ProtocolError::DeviceGone,
        rusb::Error::Timeout => ProtocolError::TransferTimeout,
        other => ProtocolError::TransientReadError(other.to_string()),
    }
}
