//! Power-supply boundary.
//!
//! The controller sits between two power paths: the wireless receiver it
//! manages and a wired (USB) input owned by the platform's charging
//! subsystem. [`SupplyHub`] is the controller's view of that subsystem;
//! [`Property`] is the property surface the controller answers on behalf
//! of the wireless supply.

use async_trait::async_trait;

use crate::error::Result;

/// Properties of the wireless supply, readable (and partly writable)
/// through the controller handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// A transmitter is coupled (rectifier on).
    Present,
    /// The output stage (LDO) is energized.
    Online,
    /// Output current, uA.
    CurrentNow,
    /// Current limit, uA. Writable: stores an override and pushes it.
    CurrentMax,
    /// Output voltage, uV.
    VoltageNow,
    /// Voltage setpoint, uV. Writable: stores an override and pushes it.
    VoltageMax,
    /// Writable: toggles the LDO.
    ChargingEnabled,
}

/// The platform charging subsystem, as seen from the controller.
#[async_trait]
pub trait SupplyHub: Send {
    /// Whether a wired power source is currently present.
    async fn usb_present(&mut self) -> Result<bool>;

    /// Suspend or resume the DC input path so the system does not see a
    /// charger attached while we transmit power.
    async fn set_dc_suspend(&mut self, en: bool) -> Result<()>;

    /// Force the DC enable pin override on or off.
    async fn set_dc_pin_override(&mut self, en: bool) -> Result<()>;

    /// Notify consumers (the battery charger) that wireless supply
    /// properties changed.
    fn wireless_changed(&mut self);
}
