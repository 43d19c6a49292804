//! Telemetry read-back.
//!
//! Raw sampling of the chip's measurement registers. Scheduling and the
//! attached/output-on gating live in the controller loop; this module only
//! knows how to pull one sample off the bus.

use std::time::Duration;

use crate::error::Result;
use crate::port::{RegisterPort, RegisterPortExt};
use crate::regs::reg;

/// Interval between samples while the output stage is up.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Retry delay when the output stage is not energized yet; the measurement
/// registers are meaningless until it is.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// One read-back of the receiver's electrical state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Rectifier voltage, mV.
    pub vrect_mv: u16,
    /// LDO output voltage, mV.
    pub vout_mv: u16,
    /// Programmed output setpoint, mV.
    pub vout_set_mv: u16,
    /// Output current, mA.
    pub iout_ma: u16,
    /// Programmed current limit, mA.
    pub iout_limit_ma: u16,
}

/// Read a full sample. Any bus failure propagates; the caller treats it
/// as a removal.
pub async fn sample<P: RegisterPort>(port: &mut P) -> Result<Sample> {
    Ok(Sample {
        vrect_mv: port.read_u16(reg::VRECT_READ).await?,
        vout_mv: port.read_u16(reg::VOUT_READ).await?,
        vout_set_mv: read_vout_set_mv(port).await?,
        iout_ma: port.read_u16(reg::IOUT_READ).await?,
        iout_limit_ma: read_iout_limit_ma(port).await?,
    })
}

/// Voltage setpoint read-back; the register holds units of 100 mV.
pub async fn read_vout_set_mv<P: RegisterPort>(port: &mut P) -> Result<u16> {
    Ok(port.read_u8(reg::VOUT_SET).await? as u16 * 100)
}

/// Current limit read-back.
///
/// The chip decodes only the low nibble: `(val & 0xf) * 100 + 100` mA.
/// This is NOT the inverse of the write encoding `(ma - 100) / 100` for
/// limits above 1600 mA; the asymmetry matches the hardware's documented
/// behavior and is deliberately preserved.
pub async fn read_iout_limit_ma<P: RegisterPort>(port: &mut P) -> Result<u16> {
    Ok((port.read_u8(reg::ILIMIT_SET).await? as u16 & 0xf) * 100 + 100)
}
