//! The boot protocol itself: stage-1 bootcode upload, and the stage-2
//! file-server loop.

use crate::blob::{BlobLookup, BlobProvider};
use crate::error::{ProtocolError, Result};
use crate::identity::Family;
use crate::proto::framing::{self, Command, FILE_MESSAGE_LEN, RETURN_CODE_LEN};
use crate::transport::UsbTransport;
use log::{debug, info, warn};
use rusb::UsbContext;
use std::time::Duration;

/// Uploads `bootcode.bin` to a device whose ROM is in the stage-1 state.
/// Fatal if the blob is absent -- there is nothing useful to upload.
pub fn second_stage_boot<T: UsbContext>(
    transport: &UsbTransport<T>,
    family: Family,
    blobs: &dyn BlobProvider,
) -> Result<()> {
    let bootcode = match blobs.read_blob(family, "bootcode.bin") {
        BlobLookup::Found(bytes) => bytes,
        BlobLookup::Absent => {
            return Err(ProtocolError::BlobMissing("bootcode.bin".into()));
        }
    };

    info!("uploading bootcode.bin ({} bytes)", bootcode.len());

    let header = framing::encode_boot_header_default(bootcode.len() as u32);
    transport.write_payload(&header)?;
    transport.write_payload(&bootcode)?;

    // Unlike the file-server loop, there is no "device gone" carve-out here:
    // the return code is mandatory, so a device that vanishes mid-read is a
    // fatal upload failure rather than an expected reboot.
    let mut return_buf = [0u8; RETURN_CODE_LEN];
    let received = transport.read(RETURN_CODE_LEN)?;
    let n = received.len().min(RETURN_CODE_LEN);
    return_buf[..n].copy_from_slice(&received[..n]);
    let code = framing::decode_return_code(&return_buf);
    if code != 0 {
        return Err(ProtocolError::BootcodeRejected(code));
    }

    info!("bootcode accepted, device will reset and re-enumerate");
    Ok(())
}

/// Serves `GetFileSize`/`ReadFile`/`Done` requests from the stage-2 loader
/// until it sends `Done` or the device disappears (the expected end of the
/// loop, as the device reboots into mass-storage mode).
///
/// `on_step` is called once per request handled, with the new step value
/// (the caller starts this loop at step 2, per the protocol design).
///
/// `backoff` is the read-retry delay on a transient error; `post_settle` is
/// how long to wait before the post-loop `device.open()` nudge.
pub fn file_server<T: UsbContext>(
    transport: &UsbTransport<T>,
    family: Family,
    blobs: &dyn BlobProvider,
    mut step: u32,
    backoff: Duration,
    post_settle: Duration,
    mut on_step: impl FnMut(u32),
) -> Result<()> {
    loop {
        let bytes = match transport.read(FILE_MESSAGE_LEN) {
            Ok(bytes) => bytes,
            Err(e) if e.is_device_gone() => {
                debug!("device gone while waiting for file request, ending loop");
                return Ok(());
            }
            Err(e) => {
                warn!("transient read error in file server: {e}, retrying in {backoff:?}");
                std::thread::sleep(backoff);
                continue;
            }
        };

        // A malformed message is a protocol violation, not a transport
        // hiccup -- it must not be swallowed by the retry loop above.
        let message = parse_file_message_buf(&bytes)?;

        step += 1;
        on_step(step);

        match message.command {
            Command::GetFileSize => {
                let size = match blobs.read_blob(family, &message.filename) {
                    BlobLookup::Found(bytes) => bytes.len() as u32,
                    BlobLookup::Absent => 0,
                };
                transport.send_size(size)?;
            }
            Command::ReadFile => match blobs.read_blob(family, &message.filename) {
                BlobLookup::Found(bytes) => transport.write_payload(&bytes)?,
                BlobLookup::Absent => transport.send_size(0)?,
            },
            Command::Done => break,
        }
    }

    std::thread::sleep(post_settle);
    transport.reopen_nudge();

    Ok(())
}

fn parse_file_message_buf(bytes: &[u8]) -> Result<framing::FileMessage> {
    let mut buf = [0u8; FILE_MESSAGE_LEN];
    let take = bytes.len().min(FILE_MESSAGE_LEN);
    buf[..take].copy_from_slice(&bytes[..take]);
    framing::parse_file_message(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobLookup;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapBlobProvider(HashMap<&'static str, Vec<u8>>);

    impl BlobProvider for MapBlobProvider {
        fn read_blob(&self, _family: Family, filename: &str) -> BlobLookup {
            match self.0.get(filename) {
                Some(bytes) => BlobLookup::Found(bytes.clone()),
                None => BlobLookup::Absent,
            }
        }
    }

    #[test]
    fn missing_bootcode_is_fatal() {
        // second_stage_boot needs a real transport to exercise past the
        // blob lookup; the blob-missing short-circuit is verified directly
        // against the provider here.
        let blobs = MapBlobProvider(HashMap::new());
        match blobs.read_blob(Family::Cm3Like, "bootcode.bin") {
            BlobLookup::Absent => {}
            BlobLookup::Found(_) => panic!("expected absent"),
        }
    }

    #[test]
    fn malformed_message_is_fatal_not_transient() {
        let mut buf = [0u8; FILE_MESSAGE_LEN];
        buf[0..4].copy_from_slice(&7u32.to_le_bytes());
        buf[4] = b'x'; // non-empty filename so it isn't reclassified as Done
        let err = parse_file_message_buf(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(7)));
    }

    #[test]
    fn step_counter_advances_once_per_request() {
        let steps = Mutex::new(Vec::new());
        let mut step = 2u32;
        let mut record = |s: u32| steps.lock().unwrap().push(s);
        for _ in 0..3 {
            step += 1;
            record(step);
        }
        assert_eq!(*steps.lock().unwrap(), vec![3, 4, 5]);
    }
}
