//! Binary framing for the usbboot wire protocol.
//!
//! Pure functions only: no I/O, no allocation beyond the returned buffers.
//! All multi-byte integers are little-endian.

use crate::error::{ProtocolError, Result};

pub const BOOT_HEADER_LEN: usize = 24;
pub const SIGNATURE_LEN: usize = 20;
pub const FILE_MESSAGE_LEN: usize = 260;
pub const FILENAME_FIELD_LEN: usize = 256;
pub const RETURN_CODE_LEN: usize = 4;

/// Command codes the device embeds in a file-request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetFileSize,
    ReadFile,
    Done,
}

impl Command {
    fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Command::GetFileSize),
            1 => Ok(Command::ReadFile),
            2 => Ok(Command::Done),
            other => Err(ProtocolError::InvalidCommand(other)),
        }
    }
}

/// A parsed file-request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMessage {
    pub command: Command,
    pub filename: String,
}

fn encode_u32_le(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

fn decode_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Encodes the 24-byte boot header: a 4-byte little-endian payload length
/// followed by a 20-byte signature field.
pub fn encode_boot_header(payload_len: u32, signature: &[u8; SIGNATURE_LEN]) -> [u8; BOOT_HEADER_LEN] {
    let mut header = [0u8; BOOT_HEADER_LEN];
    header[0..4].copy_from_slice(&encode_u32_le(payload_len));
    header[4..BOOT_HEADER_LEN].copy_from_slice(signature);
    header
}

/// Convenience wrapper of [`encode_boot_header`] using the all-zero
/// signature real ROMs currently expect.
pub fn encode_boot_header_default(payload_len: u32) -> [u8; BOOT_HEADER_LEN] {
    encode_boot_header(payload_len, &[0u8; SIGNATURE_LEN])
}

/// Parses a 260-byte file-request message received from the device.
///
/// Rejects unknown command codes with [`ProtocolError::InvalidCommand`].
/// An empty filename is re-classified as `Done` regardless of the command
/// code that accompanied it.
pub fn parse_file_message(buf: &[u8; FILE_MESSAGE_LEN]) -> Result<FileMessage> {
    let code = decode_u32_le(&buf[0..4]);
    let command = Command::from_code(code)?;

    let name_field = &buf[4..4 + FILENAME_FIELD_LEN];
    let nul_at = name_field.iter().position(|&b| b == 0);
    let name_bytes = match nul_at {
        Some(idx) => &name_field[..idx],
        None => name_field,
    };
    let filename = String::from_utf8_lossy(name_bytes).into_owned();

    let command = if filename.is_empty() {
        Command::Done
    } else {
        command
    };

    Ok(FileMessage { command, filename })
}

/// Decodes the 4-byte little-endian return code the device sends after a
/// stage-1 bootcode upload.
pub fn decode_return_code(buf: &[u8; RETURN_CODE_LEN]) -> u32 {
    decode_u32_le(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_message_buf(code: u32, name: &str) -> [u8; FILE_MESSAGE_LEN] {
        let mut buf = [0u8; FILE_MESSAGE_LEN];
        buf[0..4].copy_from_slice(&encode_u32_le(code));
        let name_bytes = name.as_bytes();
        buf[4..4 + name_bytes.len()].copy_from_slice(name_bytes);
        // byte right after the name is already zero (NUL terminator)
        buf
    }

    #[test]
    fn boot_header_roundtrip() {
        let sig = [0u8; SIGNATURE_LEN];
        let header = encode_boot_header(12345, &sig);
        assert_eq!(header.len(), BOOT_HEADER_LEN);
        assert_eq!(decode_u32_le(&header[0..4]), 12345);
        assert_eq!(&header[4..], &sig);
    }

    #[test]
    fn boot_header_default_is_zero_signature() {
        let header = encode_boot_header_default(0);
        assert_eq!(&header[4..], &[0u8; SIGNATURE_LEN]);
    }

    #[test]
    fn parse_get_file_size() {
        let buf = file_message_buf(0, "bootcode.bin");
        let msg = parse_file_message(&buf).unwrap();
        assert_eq!(msg.command, Command::GetFileSize);
        assert_eq!(msg.filename, "bootcode.bin");
    }

    #[test]
    fn parse_read_file() {
        let buf = file_message_buf(1, "start4.elf");
        let msg = parse_file_message(&buf).unwrap();
        assert_eq!(msg.command, Command::ReadFile);
        assert_eq!(msg.filename, "start4.elf");
    }

    #[test]
    fn parse_done() {
        let buf = file_message_buf(2, "");
        let msg = parse_file_message(&buf).unwrap();
        assert_eq!(msg.command, Command::Done);
        assert_eq!(msg.filename, "");
    }

    #[test]
    fn empty_filename_is_done_regardless_of_command() {
        let buf = file_message_buf(1, "");
        let msg = parse_file_message(&buf).unwrap();
        assert_eq!(msg.command, Command::Done);
    }

    #[test]
    fn unknown_command_code_is_rejected() {
        let buf = file_message_buf(7, "whatever");
        let err = parse_file_message(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand(7)));
    }

    #[test]
    fn filename_exactly_256_bytes_no_nul() {
        let mut buf = [0u8; FILE_MESSAGE_LEN];
        buf[0..4].copy_from_slice(&encode_u32_le(0));
        let name: Vec<u8> = (0..FILENAME_FIELD_LEN).map(|_| b'a').collect();
        buf[4..4 + FILENAME_FIELD_LEN].copy_from_slice(&name);
        let msg = parse_file_message(&buf).unwrap();
        assert_eq!(msg.filename.len(), FILENAME_FIELD_LEN);
    }

    #[test]
    fn return_code_roundtrip() {
        let buf = encode_u32_le(0xdeadbeefu32 & 0xFFFF_FFFF);
        assert_eq!(decode_return_code(&buf), 0xdeadbeef);
        let ok_buf = encode_u32_le(0);
        assert_eq!(decode_return_code(&ok_buf), 0);
    }
}
