//! Pure encode/decode logic for the P938x protocol.
//!
//! Everything here is stateless: status-word decoding for the IRQ path,
//! SYS_MODE interpretation, and firmware packet construction for the OTP
//! upload. Keeping these free of bus access makes the bit-exact parts
//! directly unit-testable.

use bytes::{BufMut, BytesMut};

use crate::regs::{sys_mode, STATUS_BITS};

/// Power-transfer profile negotiated with the transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Not negotiated (chip off, tx mode, or mid-handshake).
    #[default]
    Unknown,
    /// Baseline Power Profile, 5 W class.
    Bpp,
    /// Extended Power Profile.
    Epp,
}

impl Mode {
    /// Derive the profile from a SYS_MODE byte.
    ///
    /// Only meaningful while the WPC protocol is active; otherwise the
    /// extended bit is stale and the profile is `Unknown`.
    pub fn from_sys_mode(mode: u8) -> Self {
        if mode & sys_mode::WPCMODE == 0 {
            Mode::Unknown
        } else if mode & sys_mode::EXTENDED != 0 {
            Mode::Epp
        } else {
            Mode::Bpp
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Unknown => write!(f, "unknown"),
            Mode::Bpp => write!(f, "bpp"),
            Mode::Epp => write!(f, "epp"),
        }
    }
}

/// Names of the bits set in a DEV_STATUS / IRQ_STATUS word, for logging.
pub fn decode_status(word: u16) -> Vec<&'static str> {
    STATUS_BITS
        .iter()
        .filter(|(mask, _)| word & mask != 0)
        .map(|&(_, name)| name)
        .collect()
}

/// Maximum payload bytes per firmware packet.
pub const PACKET_DATA_LEN: usize = 128;
/// Packet header: 2 reserved bytes, start address, code length, checksum,
/// each 16-bit little-endian.
pub const PACKET_HEADER_LEN: usize = 8;

/// Round up to the next multiple of 16, the boot ROM's alignment unit.
pub fn align16(val: usize) -> usize {
    (val + 15) / 16 * 16
}

/// One staged chunk of a firmware image, ready for the SRAM window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePacket {
    /// OTP start address this chunk programs.
    pub start_addr: u16,
    /// Payload padded to a 16-byte boundary.
    pub payload: Vec<u8>,
    /// Padded payload length as carried in the header.
    pub code_len: u16,
    /// Additive checksum over start address, code length, and every
    /// padded payload byte, mod 65536.
    pub checksum: u16,
}

impl FirmwarePacket {
    /// Build the packet for the chunk of `image` starting at `offset`.
    ///
    /// Takes up to [`PACKET_DATA_LEN`] bytes, zero-pads them to a 16-byte
    /// boundary, and computes the checksum over the padded payload. The
    /// chunk's OTP start address is its offset within the image.
    pub fn build(image: &[u8], offset: usize) -> Self {
        debug_assert!(offset < image.len());
        let raw_len = (image.len() - offset).min(PACKET_DATA_LEN);
        let code_len = align16(raw_len) as u16;

        let mut payload = image[offset..offset + raw_len].to_vec();
        payload.resize(code_len as usize, 0);

        let start_addr = offset as u16;
        let mut checksum = start_addr.wrapping_add(code_len);
        for b in &payload {
            checksum = checksum.wrapping_add(*b as u16);
        }

        Self { start_addr, payload, code_len, checksum }
    }

    /// Total on-wire length, header included, 16-byte aligned.
    pub fn wire_len(&self) -> usize {
        align16(self.code_len as usize + PACKET_HEADER_LEN)
    }

    /// Serialize for the SRAM staging window.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u16(0); // reserved; low byte doubles as the handshake status
        buf.put_u16_le(self.start_addr);
        buf.put_u16_le(self.code_len);
        buf.put_u16_le(self.checksum);
        buf.put_slice(&self.payload);
        buf.resize(self.wire_len(), 0);
        buf
    }

    /// Parse a staged packet back out of its wire form.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PACKET_HEADER_LEN {
            return None;
        }
        let start_addr = u16::from_le_bytes([buf[2], buf[3]]);
        let code_len = u16::from_le_bytes([buf[4], buf[5]]);
        let checksum = u16::from_le_bytes([buf[6], buf[7]]);
        let end = PACKET_HEADER_LEN + code_len as usize;
        if code_len % 16 != 0 || buf.len() < end {
            return None;
        }
        Some(Self {
            start_addr,
            payload: buf[PACKET_HEADER_LEN..end].to_vec(),
            code_len,
            checksum,
        })
    }
}
