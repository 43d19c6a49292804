//! Register bus abstraction.
//!
//! The P938x sits on an addressable byte-oriented bus (I2C with 16-bit
//! register addresses in hardware). The controller only needs three
//! primitives; everything typed is built on top of them here.
//!
//! A read failure is a signal, not merely an error: the chip powers its
//! register interface from the coupled field, so the consuming state
//! machine treats any read failure on the status/telemetry path as a
//! removal event.

use async_trait::async_trait;

use crate::error::Result;

/// Byte-oriented access to the chip's 16-bit register space.
#[async_trait]
pub trait RegisterPort: Send {
    /// Read `buf.len()` bytes starting at `addr`.
    async fn read(&mut self, addr: u16, buf: &mut [u8]) -> Result<()>;

    /// Write a single register byte.
    async fn write(&mut self, addr: u16, val: u8) -> Result<()>;

    /// Write a run of bytes starting at `addr`.
    ///
    /// The default issues one register write per byte, which is what the
    /// boot ROM's SRAM window requires; transports with a working bulk
    /// write may override for the normal register range.
    async fn write_buffer(&mut self, addr: u16, buf: &[u8]) -> Result<()> {
        for (i, b) in buf.iter().enumerate() {
            self.write(addr + i as u16, *b).await?;
        }
        Ok(())
    }
}

/// Typed helpers over any [`RegisterPort`].
#[async_trait]
pub trait RegisterPortExt: RegisterPort {
    async fn read_u8(&mut self, addr: u16) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf).await?;
        Ok(buf[0])
    }

    async fn read_u16(&mut self, addr: u16) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf).await?;
        Ok(u16::from_le_bytes(buf))
    }

    async fn write_u16(&mut self, addr: u16, val: u16) -> Result<()> {
        self.write_buffer(addr, &val.to_le_bytes()).await
    }
}

impl<P: RegisterPort + ?Sized> RegisterPortExt for P {}
