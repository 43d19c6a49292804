//! Firmware upload protocol.
//!
//! The P938x's permanent firmware lives in one-time-programmable memory
//! that only the chip's boot ROM can write. Programming is a three-stage
//! handshake:
//!
//! 1. **Bootstrap**: halt the M0 into its boot ROM, copy a small
//!    downloader image into SRAM, and reset the chip so the downloader
//!    runs in place of the ROM's normal reply path.
//! 2. **Transfer**: stage the image through the SRAM window in 128-byte
//!    packets (see [`FirmwarePacket`]), each validated by the downloader
//!    against its additive checksum before being committed to OTP. The
//!    handshake status byte is polled on a bounded schedule; anything but
//!    "ok" aborts the whole upload.
//! 3. **Finalize**: clear the downloader flag and reset again so the
//!    newly programmed OTP code runs.
//!
//! Power sequencing (boost on/off) and the single-flight guard are the
//! controller's job; this module only speaks the bus protocol.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, trace};

use crate::codec::{FirmwarePacket, PACKET_DATA_LEN};
use crate::error::{ProtocolError, Result};
use crate::port::{RegisterPort, RegisterPortExt};
use crate::regs::mtp;

/// Delay between boot ROM commands during bootstrap.
const BOOT_CMD_DELAY: Duration = Duration::from_millis(10);
/// Chip reset settle time.
const RESET_DELAY: Duration = Duration::from_millis(100);
/// Handshake status poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Poll attempts per packet before declaring the downloader wedged.
const POLL_ATTEMPTS: u32 = 30;

/// Downloader image the boot ROM executes from SRAM. Thumb machine code,
/// taken verbatim from the vendor's programming reference.
const DOWNLOADER: [u8; 364] = [
    0x00, 0x04, 0x00, 0x20, 0xE7, 0x00, 0x00, 0x00,
    0x41, 0x00, 0x00, 0x00, 0x41, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x41, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x41, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xFE, 0xE7, 0x00, 0x00, 0xF0, 0xB5, 0x42, 0x49,
    0x00, 0x20, 0x0A, 0x88, 0x05, 0x46, 0x93, 0x06,
    0x00, 0xD5, 0x04, 0x20, 0xD2, 0x06, 0x07, 0xD5,
    0x8A, 0x78, 0x0B, 0x79, 0x1A, 0x43, 0x92, 0x07,
    0x02, 0xD1, 0x20, 0x22, 0x10, 0x43, 0x01, 0x25,
    0x3A, 0x4B, 0x5A, 0x22, 0x1A, 0x74, 0x39, 0x4A,
    0x20, 0x3A, 0x10, 0x72, 0x02, 0x20, 0x40, 0x1C,
    0x20, 0x28, 0xFC, 0xD3, 0xFF, 0x20, 0x36, 0x4B,
    0x01, 0x30, 0x98, 0x81, 0x48, 0x88, 0xDC, 0x13,
    0x04, 0x19, 0x00, 0x2D, 0x09, 0xD0, 0x00, 0x20,
    0x03, 0xE0, 0x45, 0x18, 0xAD, 0x68, 0x25, 0x50,
    0x00, 0x1D, 0x8D, 0x88, 0x85, 0x42, 0xF8, 0xD8,
    0x08, 0xE0, 0x00, 0x20, 0x03, 0xE0, 0x45, 0x18,
    0x2D, 0x7A, 0x25, 0x54, 0x40, 0x1C, 0x8D, 0x88,
    0x85, 0x42, 0xF8, 0xD8, 0x00, 0x20, 0x10, 0x72,
    0x28, 0x48, 0x98, 0x81, 0x02, 0x20, 0x00, 0x23,
    0x1A, 0x46, 0x0B, 0xE0, 0x57, 0x18, 0x3E, 0x7A,
    0xA5, 0x5C, 0xAE, 0x42, 0x05, 0xD0, 0x3D, 0x72,
    0x00, 0x2B, 0x00, 0xD1, 0x4A, 0x80, 0x04, 0x20,
    0x5B, 0x1C, 0x52, 0x1C, 0x8D, 0x88, 0x95, 0x42,
    0xF0, 0xD8, 0x8B, 0x80, 0xF0, 0xBD, 0x1F, 0x49,
    0x1D, 0x48, 0x08, 0x60, 0x1A, 0x48, 0x08, 0x25,
    0x40, 0x38, 0x85, 0x83, 0x5A, 0x21, 0x01, 0x70,
    0x01, 0x21, 0x01, 0x71, 0x05, 0x21, 0x01, 0x72,
    0x19, 0x49, 0x81, 0x81, 0x12, 0x4F, 0x00, 0x20,
    0x38, 0x80, 0xFF, 0x20, 0x40, 0x1E, 0xFD, 0xD1,
    0x02, 0x26, 0x38, 0x78, 0x3C, 0x46, 0xC0, 0x07,
    0xFB, 0xD0, 0x60, 0x88, 0xA2, 0x88, 0x10, 0x18,
    0x81, 0xB2, 0x00, 0x20, 0x04, 0xE0, 0x03, 0x19,
    0x1B, 0x7A, 0x59, 0x18, 0x89, 0xB2, 0x40, 0x1C,
    0x82, 0x42, 0xF8, 0xD8, 0xE0, 0x88, 0x88, 0x42,
    0x01, 0xD0, 0x3D, 0x80, 0xE9, 0xE7, 0x00, 0x2A,
    0x03, 0xD0, 0xFF, 0xF7, 0x7F, 0xFF, 0x20, 0x80,
    0xE3, 0xE7, 0x3E, 0x80, 0xE1, 0xE7, 0x00, 0x00,
    0x00, 0x04, 0x00, 0x20, 0x40, 0x5C, 0x00, 0x40,
    0x40, 0x30, 0x00, 0x40, 0xFF, 0x01, 0x00, 0x00,
    0xFF, 0x0F, 0x00, 0x00, 0x80, 0xE1, 0x00, 0xE0,
    0x04, 0x0E, 0x00, 0x00,
];

/// Program `image` into OTP. The chip must already be powered (boost on)
/// and settled. Fatal to the upload only; the caller owns recovery.
pub async fn run_upload<P: RegisterPort>(port: &mut P, image: &[u8]) -> Result<()> {
    debug!("loading OTP downloader");
    bootstrap(port).await?;

    debug!(len = image.len(), "starting OTP transfer");
    let mut offset = 0;
    while offset < image.len() {
        write_packet(port, image, offset).await?;
        offset += PACKET_DATA_LEN;
    }

    finalize(port).await
}

/// Full chip reset. The reset drops the register interface out from under
/// the bus transaction, so a missing ack is expected and ignored.
pub async fn reset_chip<P: RegisterPort>(port: &mut P) {
    let _ = port.write(mtp::RESET, mtp::RESET_CHIP).await;
    sleep(RESET_DELAY).await;
}

/// Stage the downloader into SRAM and hand the M0 over to it.
async fn bootstrap<P: RegisterPort>(port: &mut P) -> Result<()> {
    port.write(mtp::KEY, mtp::KEY_UNLOCK).await?;
    sleep(BOOT_CMD_DELAY).await;

    port.write(mtp::RESET, mtp::RESET_HALT_M0).await?;
    sleep(BOOT_CMD_DELAY).await;

    // The boot ROM accepts SRAM writes only one byte per transaction.
    for (i, b) in DOWNLOADER.iter().enumerate() {
        port.write(mtp::DOWNLOADER_BASE + i as u16, *b).await?;
    }

    port.write(mtp::STAGING_BASE, mtp::STATUS_RESET).await?;
    port.write(mtp::JUMP, mtp::JUMP_SRAM).await?;

    reset_chip(port).await;
    Ok(())
}

/// Stage one packet and wait for the downloader to commit it.
async fn write_packet<P: RegisterPort>(port: &mut P, image: &[u8], offset: usize) -> Result<()> {
    let packet = FirmwarePacket::build(image, offset);
    let wire = packet.encode();
    trace!(
        addr = packet.start_addr,
        code_len = packet.code_len,
        wire_len = wire.len(),
        checksum = format_args!("0x{:04x}", packet.checksum),
        "staging OTP packet"
    );

    port.write_buffer(mtp::STAGING_BASE, &wire).await?;

    // Flip the status byte to "validated"; the downloader takes over from
    // here and reports back through the same byte.
    port.write(mtp::STAGING_BASE, mtp::STATUS_VALIDATED).await?;

    let addr = packet.start_addr;
    for _ in 0..=POLL_ATTEMPTS {
        sleep(POLL_INTERVAL).await;
        let status = port.read_u8(mtp::STAGING_BASE).await?;
        match status {
            mtp::STATUS_VALIDATED => continue, // still busy
            mtp::STATUS_OK => return Ok(()),
            mtp::STATUS_PROGRAM_ERROR => {
                return Err(ProtocolError::ProgramError { addr }.into());
            }
            mtp::STATUS_BAD_CHECKSUM => {
                return Err(ProtocolError::ChecksumMismatch { addr }.into());
            }
            mtp::STATUS_ILLEGAL_CLEAR => {
                return Err(ProtocolError::IllegalBitClear { addr }.into());
            }
            status => {
                return Err(ProtocolError::UnexpectedStatus { addr, status }.into());
            }
        }
    }

    Err(ProtocolError::PollTimeout { addr }.into())
}

/// Clear the downloader flag and reset so the new OTP code runs.
async fn finalize<P: RegisterPort>(port: &mut P) -> Result<()> {
    port.write(mtp::KEY, mtp::KEY_UNLOCK).await?;
    port.write(mtp::JUMP, mtp::JUMP_CLEAR).await?;
    reset_chip(port).await;
    debug!("OTP transfer complete");
    Ok(())
}
