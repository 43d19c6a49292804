//! The controller task and its state machine.
//!
//! One task owns the register port, the platform pins, and all device
//! state, so every bus transaction is serialized by construction. Stimuli
//! arrive as [`Event`] messages through a cloneable [`Handle`]: interrupt
//! edges from the platform's IRQ thread, detach detection, and consumer
//! requests. The telemetry poller runs off a deadline inside the same
//! loop rather than a separate timer task, and a firmware upload simply
//! occupies the loop until it finishes, which is what makes it mutually
//! exclusive with everything else.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{decode_status, Mode};
use crate::error::{Error, Result, StateError};
use crate::firmware;
use crate::hw::{OutputPin, PinState, WakeSource};
use crate::port::{RegisterPort, RegisterPortExt};
use crate::regs::{cmd, limits, reg, status, sys_mode, MAX_CHIP_ID, MIN_CHIP_ID};
use crate::supply::{Property, SupplyHub};
use crate::telemetry;

const EVENT_QUEUE_DEPTH: usize = 16;

/// Settle time after powering the chip from the boost supply.
const BOOT_SETTLE: Duration = Duration::from_millis(100);

/// Outcome of the most recent firmware upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareStatus {
    /// No upload attempted since the controller started.
    #[default]
    None,
    /// An upload is in flight; a second request is rejected and status
    /// interrupts are ignored until it completes.
    Pending,
    Success,
    Failed,
}

/// Everything the controller knows about the chip, updated only from the
/// event loop.
#[derive(Debug, Default)]
pub struct DeviceState {
    boost_enabled: bool,
    tx_attached: bool,
    tx_mode_enabled: bool,
    usb_present: bool,
    usb_keep_on: bool,
    keep_awake: bool,
    /// Last observed DEV_STATUS word; zeroed on removal.
    status: u16,
    /// Last observed IRQ_STATUS word; zeroed on removal.
    irq_status: u16,
    mode: Mode,
    /// Consumer override for the voltage setpoint, reapplied on every
    /// mode detection in place of the profile default.
    vout_limit_mv: Option<u16>,
    /// Consumer override for the current limit.
    iout_limit_ma: Option<u16>,
    firmware: FirmwareStatus,
}

impl DeviceState {
    /// The register interface responds: either boost back-powers the chip
    /// or a coupled field does.
    fn chip_on(&self) -> bool {
        self.boost_enabled || self.tx_attached
    }

    /// Coupled to a transmitter with the rectifier up.
    fn tx_connected(&self) -> bool {
        self.chip_on() && self.status & status::VRECT_ON != 0
    }

    /// The LDO output stage is energized.
    fn output_on(&self) -> bool {
        self.chip_on() && self.status & status::VOUT_ON != 0
    }
}

/// Stimuli for the controller loop.
#[derive(Debug)]
pub enum Event {
    /// The status interrupt line fired.
    StatusIrq,
    /// The attach-detect line changed level.
    DetectEdge { present: bool },
    /// Something changed on the wired-charger side.
    SupplyChanged,
    SetTxMode {
        enable: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetUsbKeepOn(bool),
    GetProperty {
        prop: Property,
        reply: oneshot::Sender<Result<i64>>,
    },
    SetProperty {
        prop: Property,
        value: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    ProgramFirmware {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    FirmwareStatus {
        reply: oneshot::Sender<FirmwareStatus>,
    },
    ChipId {
        reply: oneshot::Sender<Result<u16>>,
    },
    FirmwareVersion {
        reply: oneshot::Sender<Result<u32>>,
    },
}

/// Cloneable client side of the controller's event channel.
#[derive(Debug, Clone)]
pub struct Handle {
    tx: mpsc::Sender<Event>,
}

impl Handle {
    async fn send(&self, event: Event) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::Closed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Event,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Report a status interrupt edge. Called from the platform's IRQ
    /// dispatch; the actual register work happens on the controller task.
    pub async fn status_irq(&self) -> Result<()> {
        self.send(Event::StatusIrq).await
    }

    /// Report an attach-detect line change.
    pub async fn detect_edge(&self, present: bool) -> Result<()> {
        self.send(Event::DetectEdge { present }).await
    }

    /// Report that wired-charger state may have changed.
    pub async fn supply_changed(&self) -> Result<()> {
        self.send(Event::SupplyChanged).await
    }

    /// Enter or leave transmit mode.
    pub async fn set_tx_mode(&self, enable: bool) -> Result<()> {
        self.request(|reply| Event::SetTxMode { enable, reply }).await?
    }

    /// Hold the receiver enabled even while wired power is present.
    pub async fn set_usb_keep_on(&self, keep: bool) -> Result<()> {
        self.send(Event::SetUsbKeepOn(keep)).await
    }

    pub async fn get_property(&self, prop: Property) -> Result<i64> {
        self.request(|reply| Event::GetProperty { prop, reply }).await?
    }

    pub async fn set_property(&self, prop: Property, value: i64) -> Result<()> {
        self.request(|reply| Event::SetProperty { prop, value, reply })
            .await?
    }

    /// Program a firmware image into OTP. Resolves when the upload
    /// finishes; the controller handles nothing else in the meantime.
    pub async fn program_firmware(&self, image: Vec<u8>) -> Result<()> {
        self.request(|reply| Event::ProgramFirmware { image, reply })
            .await?
    }

    pub async fn firmware_status(&self) -> Result<FirmwareStatus> {
        self.request(|reply| Event::FirmwareStatus { reply }).await
    }

    /// Read the chip identity register, boosting briefly if the chip is
    /// unpowered.
    pub async fn chip_id(&self) -> Result<u16> {
        self.request(|reply| Event::ChipId { reply }).await?
    }

    /// Read the OTP firmware version as `major << 16 | minor`.
    pub async fn firmware_version(&self) -> Result<u32> {
        self.request(|reply| Event::FirmwareVersion { reply }).await?
    }
}

/// Assembles a [`Controller`] from its platform wiring.
pub struct Builder<P> {
    port: Option<P>,
    enable_pin: Option<Box<dyn OutputPin>>,
    boost_pin: Option<Box<dyn OutputPin>>,
    wake: Option<Box<dyn WakeSource>>,
    supply: Option<Box<dyn SupplyHub>>,
}

impl<P> Default for Builder<P> {
    fn default() -> Self {
        Self {
            port: None,
            enable_pin: None,
            boost_pin: None,
            wake: None,
            supply: None,
        }
    }
}

impl<P: RegisterPort> Builder<P> {
    pub fn port(mut self, port: P) -> Self {
        self.port = Some(port);
        self
    }

    /// The receiver enable line. Active low: driving it high disables the
    /// receiver path.
    pub fn enable_pin(mut self, pin: Box<dyn OutputPin>) -> Self {
        self.enable_pin = Some(pin);
        self
    }

    /// The boost supply line that back-powers the chip so its register
    /// interface works without a coupled field.
    pub fn boost_pin(mut self, pin: Box<dyn OutputPin>) -> Self {
        self.boost_pin = Some(pin);
        self
    }

    pub fn wake(mut self, wake: Box<dyn WakeSource>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn supply(mut self, supply: Box<dyn SupplyHub>) -> Self {
        self.supply = Some(supply);
        self
    }

    pub fn build(self) -> Result<(Controller<P>, Handle)> {
        fn missing(what: &str) -> Error {
            Error::Config(format!("{what} not wired"))
        }

        let port = self.port.ok_or_else(|| missing("register port"))?;
        let enable_pin = self.enable_pin.ok_or_else(|| missing("enable pin"))?;
        let boost_pin = self.boost_pin.ok_or_else(|| missing("boost pin"))?;
        let wake = self.wake.ok_or_else(|| missing("wake source"))?;
        let supply = self.supply.ok_or_else(|| missing("supply hub"))?;

        let (tx, events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let controller = Controller {
            port,
            state: DeviceState::default(),
            enable_pin,
            boost_pin,
            wake,
            supply,
            events,
            telemetry_at: None,
        };
        Ok((controller, Handle { tx }))
    }
}

/// The controller task. Owns the bus and all device state; drive it with
/// [`Controller::run`] and talk to it through the [`Handle`].
pub struct Controller<P: RegisterPort> {
    port: P,
    state: DeviceState,
    enable_pin: Box<dyn OutputPin>,
    boost_pin: Box<dyn OutputPin>,
    wake: Box<dyn WakeSource>,
    supply: Box<dyn SupplyHub>,
    events: mpsc::Receiver<Event>,
    /// Next telemetry deadline; `None` while no transmitter is attached.
    telemetry_at: Option<Instant>,
}

impl<P: RegisterPort> Controller<P> {
    pub fn builder() -> Builder<P> {
        Builder::default()
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        // A transmitter may already be coupled from before we started;
        // reset the chip so its attach interrupts fire again.
        firmware::reset_chip(&mut self.port).await;
        info!("controller running");

        loop {
            let deadline = self.telemetry_at.unwrap_or_else(Instant::now);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = sleep_until(deadline), if self.telemetry_at.is_some() => {
                    self.telemetry_at = None;
                    self.telemetry_poll().await;
                }
            }
        }
        info!("controller stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::StatusIrq => self.handle_status_irq().await,
            Event::DetectEdge { present } => {
                if present {
                    debug!("attach detect asserted");
                    self.set_awake(true);
                } else {
                    debug!("attach detect deasserted");
                    self.handle_removal().await;
                }
            }
            Event::SupplyChanged => {
                self.update_supplies_status().await;
                self.schedule_telemetry(Duration::ZERO);
            }
            Event::SetTxMode { enable, reply } => {
                let _ = reply.send(self.set_tx_mode(enable).await);
            }
            Event::SetUsbKeepOn(keep) => self.set_usb_keep_on(keep).await,
            Event::GetProperty { prop, reply } => {
                let _ = reply.send(self.get_property(prop).await);
            }
            Event::SetProperty { prop, value, reply } => {
                let _ = reply.send(self.set_property(prop, value).await);
            }
            Event::ProgramFirmware { image, reply } => {
                let _ = reply.send(self.program_firmware(&image).await);
            }
            Event::FirmwareStatus { reply } => {
                let _ = reply.send(self.state.firmware);
            }
            Event::ChipId { reply } => {
                let _ = reply.send(self.chip_id().await);
            }
            Event::FirmwareVersion { reply } => {
                let _ = reply.send(self.firmware_version().await);
            }
        }
    }

    /// Service one status interrupt: read both words, act on the bits
    /// that are set in both, then ack what was observed.
    async fn handle_status_irq(&mut self) {
        if self.state.firmware == FirmwareStatus::Pending {
            debug!("ignoring status irq during OTP programming");
            return;
        }

        let enabled = match self.port.read_u16(reg::IRQ_ENABLE).await {
            Ok(v) => v,
            Err(e) => {
                debug!(%e, "status read failed, treating as removal");
                self.handle_removal().await;
                return;
            }
        };

        // DEV_STATUS and IRQ_STATUS are adjacent; one transaction gets a
        // coherent pair.
        let mut raw = [0u8; 4];
        if let Err(e) = self.port.read(reg::DEV_STATUS, &mut raw).await {
            debug!(%e, "status read failed, treating as removal");
            self.handle_removal().await;
            return;
        }
        let stat = u16::from_le_bytes([raw[0], raw[1]]);
        let irq = u16::from_le_bytes([raw[2], raw[3]]);
        self.state.status = stat;
        self.state.irq_status = irq;
        debug!(
            enabled = format_args!("0x{enabled:04x}"),
            status = ?decode_status(stat),
            irq = ?decode_status(irq),
            "status irq"
        );

        // A bit is actionable only when the level and the latched edge
        // agree; either alone is stale.
        let actionable = stat & irq;

        if actionable & status::TX_CONFLICT != 0 && self.state.tx_mode_enabled {
            warn!("transmitter conflict, leaving tx mode");
            if let Err(e) = self.set_tx_mode(false).await {
                warn!(%e, "tx mode disable failed");
            }
        }

        if actionable & status::VOUT_ON != 0 {
            info!("output stage is on");
            if let Err(e) = self.check_system_mode().await {
                warn!(%e, "system mode check failed");
            }
            self.schedule_telemetry(Duration::ZERO);
            self.supply.wireless_changed();
        }

        if actionable & status::VRECT_ON != 0 {
            // Wired power may have come or gone while the chip was dark.
            self.update_supplies_status().await;
            if self.state.tx_mode_enabled {
                info!("coupled to a pad while in tx mode, leaving tx mode");
                if let Err(e) = self.set_tx_mode(false).await {
                    warn!(%e, "tx mode disable failed");
                }
            }
            self.set_awake(true);
            self.state.tx_attached = true;
            self.schedule_telemetry(telemetry::SETTLE_DELAY);
            info!("transmitter attached");
        }

        self.clear_irq(self.state.irq_status).await;
    }

    async fn clear_irq(&mut self, mask: u16) {
        trace!(mask = format_args!("0x{mask:04x}"), "clearing irq");
        if let Err(e) = self.port.write_u16(reg::IRQ_CLEAR, mask).await {
            warn!(%e, "irq clear write failed");
            return;
        }
        if let Err(e) = self.port.write(reg::SYS_CMD, cmd::RX_CLR_IRQ).await {
            warn!(%e, "irq clear command failed");
        }
    }

    /// Tear down the attached state. Safe to call on a false alarm: if a
    /// transmitter is still coupled the chip reset makes its attach
    /// interrupts fire again, and a repeat call is a no-op.
    async fn handle_removal(&mut self) {
        if !self.state.tx_attached {
            return;
        }
        self.state.tx_attached = false;
        self.state.status = 0;
        self.state.irq_status = 0;
        self.telemetry_at = None;
        self.supply.wireless_changed();
        if !self.state.boost_enabled {
            self.set_awake(false);
            firmware::reset_chip(&mut self.port).await;
        }
        info!("transmitter removed");
    }

    /// Reconcile the receiver enable line with the wired-charger state.
    /// Wired power normally wins and the receiver is disabled, unless tx
    /// mode or the keep-on override needs it up.
    async fn update_supplies_status(&mut self) {
        let present = match self.supply.usb_present().await {
            Ok(p) => p,
            Err(e) => {
                warn!(%e, "usb presence query failed");
                return;
            }
        };
        if present == self.state.usb_present {
            return;
        }
        self.state.usb_present = present;
        if present {
            if self.state.tx_mode_enabled {
                debug!("usb attached, tx mode holds the receiver enabled");
            } else if self.state.usb_keep_on {
                debug!("usb attached, keep-on holds the receiver enabled");
            } else if let Err(e) = self.enable_pin.set(PinState::High).await {
                warn!(%e, "enable pin");
            } else {
                debug!("usb attached, receiver disabled");
            }
        } else if let Err(e) = self.enable_pin.set(PinState::Low).await {
            warn!(%e, "enable pin");
        } else {
            debug!("usb detached, receiver enabled");
        }
    }

    async fn set_usb_keep_on(&mut self, keep: bool) {
        self.state.usb_keep_on = keep;
        if self.state.usb_present {
            let level = if keep { PinState::Low } else { PinState::High };
            if let Err(e) = self.enable_pin.set(level).await {
                warn!(%e, "enable pin");
            }
        }
    }

    /// Enter or leave transmit mode, where the receiver coil energizes to
    /// charge another device.
    async fn set_tx_mode(&mut self, enable: bool) -> Result<()> {
        if enable {
            if self.state.tx_attached {
                return Err(StateError::TransmitterAttached.into());
            }
            if self.state.tx_mode_enabled {
                debug!("tx mode already enabled");
                return Ok(());
            }
            if self.state.usb_present {
                debug!("re-enabling the receiver for tx mode");
                self.enable_pin.set(PinState::Low).await?;
            }
            // The wired input must not see a charger while we transmit.
            if let Err(e) = self.supply.set_dc_suspend(true).await {
                warn!(%e, "dc suspend");
            }
            if let Err(e) = self.supply.set_dc_pin_override(true).await {
                warn!(%e, "dc pin override");
            }

            let powered_here = !self.state.chip_on();
            if powered_here {
                self.set_boost(true).await?;
                sleep(BOOT_SETTLE).await;
            }

            match self.port.write(reg::SYS_MODE, sys_mode::TXMODE).await {
                Ok(()) => {
                    self.state.tx_mode_enabled = true;
                    info!("tx mode enabled");
                    Ok(())
                }
                Err(e) => {
                    error!(%e, "tx mode entry failed, rolling back");
                    if powered_here {
                        let _ = self.set_boost(false).await;
                    }
                    let _ = self.supply.set_dc_pin_override(false).await;
                    let _ = self.supply.set_dc_suspend(false).await;
                    Err(e)
                }
            }
        } else {
            if !self.state.tx_mode_enabled {
                debug!("tx mode already disabled");
                return Ok(());
            }
            let mode = match self.port.read_u8(reg::SYS_MODE).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(%e, "sys mode read failed, assuming zero");
                    0
                }
            };
            if let Err(e) = self.port.write(reg::SYS_MODE, mode & !sys_mode::TXMODE).await {
                warn!(%e, "tx mode bit clear failed");
            }
            if let Err(e) = self.set_boost(false).await {
                warn!(%e, "boost off");
            }
            let _ = self.supply.set_dc_pin_override(false).await;
            let _ = self.supply.set_dc_suspend(false).await;
            self.state.tx_mode_enabled = false;
            info!("tx mode disabled");
            if self.state.usb_present && !self.state.usb_keep_on {
                self.enable_pin.set(PinState::High).await?;
            }
            Ok(())
        }
    }

    async fn set_boost(&mut self, on: bool) -> Result<()> {
        let level = if on { PinState::High } else { PinState::Low };
        self.boost_pin.set(level).await?;
        self.state.boost_enabled = on;
        if on {
            self.set_awake(true);
        } else if !self.state.chip_on() {
            self.set_awake(false);
        }
        Ok(())
    }

    fn set_awake(&mut self, awake: bool) {
        if awake && !self.state.keep_awake {
            self.wake.stay_awake();
            self.state.keep_awake = true;
        } else if !awake && self.state.keep_awake {
            self.wake.relax();
            self.state.keep_awake = false;
        }
    }

    /// Read SYS_MODE and, once a power profile is negotiated, push that
    /// profile's output limits (or the consumer's overrides).
    async fn check_system_mode(&mut self) -> Result<()> {
        let raw = self.port.read_u8(reg::SYS_MODE).await?;
        debug!(sys_mode = format_args!("0x{raw:02x}"));
        if raw & sys_mode::RAMCODE != 0 {
            debug!("executing from ram code");
        }
        if raw & sys_mode::TXMODE != 0 {
            debug!("tx mode bit set");
        }

        let mode = Mode::from_sys_mode(raw);
        if mode == Mode::Unknown {
            return Ok(());
        }
        self.state.mode = mode;
        info!(%mode, "power profile negotiated");

        let (vout_mv, iout_ma) = match mode {
            Mode::Epp => (limits::EPP_MAX_VOUT_MV, limits::EPP_MAX_IOUT_MA),
            _ => (limits::BPP_MAX_VOUT_MV, limits::BPP_MAX_IOUT_MA),
        };
        let vout_mv = self.state.vout_limit_mv.unwrap_or(vout_mv);
        let iout_ma = self.state.iout_limit_ma.unwrap_or(iout_ma);
        self.set_vout_mv(vout_mv).await?;
        self.set_iout_ma(iout_ma).await?;
        Ok(())
    }

    /// Program the output voltage setpoint, saturating at the hardware
    /// bounds.
    async fn set_vout_mv(&mut self, mv: u16) -> Result<()> {
        if !self.state.chip_on() {
            return Err(StateError::ChipOff.into());
        }
        let mv = mv.clamp(limits::MIN_VOUT_SET_MV, limits::MAX_VOUT_SET_MV);
        self.port.write(reg::VOUT_SET, (mv / 100) as u8).await?;
        debug!(mv, "vout setpoint");
        Ok(())
    }

    /// Program the output current limit, saturating at the hardware
    /// bounds.
    async fn set_iout_ma(&mut self, ma: u16) -> Result<()> {
        if !self.state.chip_on() {
            return Err(StateError::ChipOff.into());
        }
        let ma = ma.clamp(limits::MIN_IOUT_SET_MA, limits::MAX_IOUT_SET_MA);
        self.port.write(reg::ILIMIT_SET, ((ma - 100) / 100) as u8).await?;
        debug!(ma, "iout limit");
        Ok(())
    }

    async fn telemetry_poll(&mut self) {
        if !self.state.tx_connected() {
            return;
        }
        if !self.state.output_on() {
            debug!("output stage not up yet, rescheduling");
            self.schedule_telemetry(telemetry::SETTLE_DELAY);
            return;
        }
        match telemetry::sample(&mut self.port).await {
            Ok(s) => {
                info!(
                    mode = %self.state.mode,
                    vrect_mv = s.vrect_mv,
                    vout_mv = s.vout_mv,
                    vout_set_mv = s.vout_set_mv,
                    iout_ma = s.iout_ma,
                    iout_limit_ma = s.iout_limit_ma,
                    "telemetry"
                );
                self.schedule_telemetry(telemetry::POLL_INTERVAL);
            }
            Err(e) => {
                warn!(%e, "telemetry read failed, treating as removal");
                self.handle_removal().await;
            }
        }
    }

    fn schedule_telemetry(&mut self, after: Duration) {
        self.telemetry_at = Some(Instant::now() + after);
    }

    async fn get_property(&mut self, prop: Property) -> Result<i64> {
        let value = match prop {
            Property::Present => self.state.tx_connected() as i64,
            Property::Online | Property::ChargingEnabled => self.state.output_on() as i64,
            Property::CurrentNow => self.rx_iout_ma().await? as i64 * 1000,
            Property::CurrentMax => self.rx_iout_limit_ma().await? as i64 * 1000,
            Property::VoltageNow => self.rx_vout_mv().await? as i64 * 1000,
            Property::VoltageMax => self.rx_vout_set_mv().await? as i64 * 1000,
        };
        Ok(value)
    }

    async fn set_property(&mut self, prop: Property, value: i64) -> Result<()> {
        match prop {
            Property::VoltageMax => {
                let mv = clamp_to_u16(value / 1000)
                    .clamp(limits::MIN_VOUT_SET_MV, limits::MAX_VOUT_SET_MV);
                self.state.vout_limit_mv = Some(mv);
                if self.state.chip_on() {
                    self.set_vout_mv(mv).await?;
                }
                self.supply.wireless_changed();
                Ok(())
            }
            Property::CurrentMax => {
                let ma = clamp_to_u16(value / 1000)
                    .clamp(limits::MIN_IOUT_SET_MA, limits::MAX_IOUT_SET_MA);
                self.state.iout_limit_ma = Some(ma);
                if self.state.chip_on() {
                    self.set_iout_ma(ma).await?;
                }
                self.supply.wireless_changed();
                Ok(())
            }
            Property::ChargingEnabled => self.enable_charging(value != 0).await,
            _ => Err(StateError::ReadOnlyProperty.into()),
        }
    }

    /// Toggle the LDO output stage on or off.
    async fn enable_charging(&mut self, on: bool) -> Result<()> {
        if !self.state.tx_connected() {
            return Err(StateError::NotCoupled.into());
        }
        if self.state.output_on() == on {
            return Ok(());
        }
        self.port.write(reg::SYS_CMD, cmd::RX_TOGGLE_LDO).await?;
        info!(on, "toggled LDO");
        Ok(())
    }

    async fn rx_vout_mv(&mut self) -> Result<u16> {
        if !self.state.tx_connected() {
            return Ok(0);
        }
        self.port.read_u16(reg::VOUT_READ).await
    }

    async fn rx_iout_ma(&mut self) -> Result<u16> {
        if !self.state.tx_connected() {
            return Ok(0);
        }
        self.port.read_u16(reg::IOUT_READ).await
    }

    async fn rx_vout_set_mv(&mut self) -> Result<u16> {
        if !self.state.chip_on() {
            return Ok(0);
        }
        telemetry::read_vout_set_mv(&mut self.port).await
    }

    async fn rx_iout_limit_ma(&mut self) -> Result<u16> {
        if !self.state.chip_on() {
            return Ok(0);
        }
        telemetry::read_iout_limit_ma(&mut self.port).await
    }

    /// Upload a firmware image to OTP. Single flight: a second request
    /// while one is pending is rejected without side effects.
    async fn program_firmware(&mut self, image: &[u8]) -> Result<()> {
        if image.is_empty() {
            return Err(Error::Config("empty firmware image".into()));
        }
        if self.state.firmware == FirmwareStatus::Pending {
            return Err(StateError::UploadPending.into());
        }
        self.state.firmware = FirmwareStatus::Pending;
        info!(len = image.len(), "programming OTP firmware");

        let result = self.run_programming(image).await;
        let _ = self.set_boost(false).await;
        match &result {
            Ok(()) => {
                self.state.firmware = FirmwareStatus::Success;
                info!("OTP programming complete");
            }
            Err(e) => {
                self.state.firmware = FirmwareStatus::Failed;
                error!(%e, "OTP programming failed");
            }
        }
        result
    }

    async fn run_programming(&mut self, image: &[u8]) -> Result<()> {
        // Back-power the chip so the bus works without a coupled field.
        self.set_boost(true).await?;
        sleep(BOOT_SETTLE).await;

        let id = self.port.read_u16(reg::CHIP_ID).await?;
        if !(MIN_CHIP_ID..=MAX_CHIP_ID).contains(&id) {
            return Err(Error::Config(format!("unexpected chip id 0x{id:04x}")));
        }
        firmware::run_upload(&mut self.port, image).await
    }

    async fn chip_id(&mut self) -> Result<u16> {
        let powered_here = !self.state.chip_on();
        if powered_here {
            self.set_boost(true).await?;
            sleep(BOOT_SETTLE).await;
        }
        let result = self.port.read_u16(reg::CHIP_ID).await;
        if powered_here {
            let _ = self.set_boost(false).await;
        }
        result
    }

    async fn firmware_version(&mut self) -> Result<u32> {
        let powered_here = !self.state.chip_on();
        if powered_here {
            self.set_boost(true).await?;
            sleep(BOOT_SETTLE).await;
        }
        let result = self.read_firmware_version().await;
        if powered_here {
            let _ = self.set_boost(false).await;
        }
        result
    }

    async fn read_firmware_version(&mut self) -> Result<u32> {
        let major = self.port.read_u16(reg::MTP_FW_MAJ_VER).await?;
        let minor = self.port.read_u16(reg::MTP_FW_MIN_VER).await?;
        Ok((major as u32) << 16 | minor as u32)
    }
}

fn clamp_to_u16(value: i64) -> u16 {
    value.clamp(0, i64::from(u16::MAX)) as u16
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::port::mock::MockPort;
    use crate::regs::mtp;

    #[derive(Clone, Default)]
    struct PinLog(Arc<Mutex<Vec<PinState>>>);

    impl PinLog {
        fn states(&self) -> Vec<PinState> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutputPin for PinLog {
        async fn set(&mut self, state: PinState) -> Result<()> {
            self.0.lock().unwrap().push(state);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct WakeLog {
        stays: Arc<AtomicUsize>,
        relaxes: Arc<AtomicUsize>,
    }

    impl WakeSource for WakeLog {
        fn stay_awake(&mut self) {
            self.stays.fetch_add(1, Ordering::SeqCst);
        }

        fn relax(&mut self) {
            self.relaxes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct FakeSupply {
        usb: Arc<AtomicBool>,
        dc_suspended: Arc<AtomicBool>,
        dc_overridden: Arc<AtomicBool>,
        notifies: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SupplyHub for FakeSupply {
        async fn usb_present(&mut self) -> Result<bool> {
            Ok(self.usb.load(Ordering::SeqCst))
        }

        async fn set_dc_suspend(&mut self, en: bool) -> Result<()> {
            self.dc_suspended.store(en, Ordering::SeqCst);
            Ok(())
        }

        async fn set_dc_pin_override(&mut self, en: bool) -> Result<()> {
            self.dc_overridden.store(en, Ordering::SeqCst);
            Ok(())
        }

        fn wireless_changed(&mut self) {
            self.notifies.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Hw {
        enable: PinLog,
        boost: PinLog,
        wake: WakeLog,
        supply: FakeSupply,
    }

    fn controller(port: MockPort) -> (Controller<MockPort>, Handle, Hw) {
        let hw = Hw {
            enable: PinLog::default(),
            boost: PinLog::default(),
            wake: WakeLog::default(),
            supply: FakeSupply::default(),
        };
        let (c, h) = Controller::builder()
            .port(port)
            .enable_pin(Box::new(hw.enable.clone()))
            .boost_pin(Box::new(hw.boost.clone()))
            .wake(Box::new(hw.wake.clone()))
            .supply(Box::new(hw.supply.clone()))
            .build()
            .unwrap();
        (c, h, hw)
    }

    #[tokio::test(start_paused = true)]
    async fn builder_requires_all_wiring() {
        let err = match Controller::<MockPort>::builder().build() {
            Ok(_) => panic!("builder accepted missing wiring"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn tx_mode_enable_rejected_while_attached() {
        let (mut c, _h, hw) = controller(MockPort::new());
        c.state.tx_attached = true;

        let err = c.set_tx_mode(true).await.unwrap_err();
        assert!(matches!(err, Error::State(StateError::TransmitterAttached)));
        assert!(!c.state.tx_mode_enabled);
        assert!(c.port.writes.is_empty());
        assert!(hw.boost.states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tx_mode_round_trip() {
        let (mut c, _h, hw) = controller(MockPort::new());

        c.set_tx_mode(true).await.unwrap();
        assert!(c.state.tx_mode_enabled);
        assert_eq!(hw.boost.states(), vec![PinState::High]);
        assert!(hw.supply.dc_suspended.load(Ordering::SeqCst));
        assert!(hw.supply.dc_overridden.load(Ordering::SeqCst));
        assert_eq!(c.port.writes, vec![(reg::SYS_MODE, sys_mode::TXMODE)]);

        c.set_tx_mode(false).await.unwrap();
        assert!(!c.state.tx_mode_enabled);
        assert_eq!(hw.boost.states(), vec![PinState::High, PinState::Low]);
        assert!(!hw.supply.dc_suspended.load(Ordering::SeqCst));
        assert!(!hw.supply.dc_overridden.load(Ordering::SeqCst));
        // The mode register is read back and only the tx bit cleared.
        assert_eq!(*c.port.writes.last().unwrap(), (reg::SYS_MODE, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn tx_mode_enable_failure_rolls_back() {
        let mut port = MockPort::new();
        port.fail_writes = true;
        let (mut c, _h, hw) = controller(port);

        let err = c.set_tx_mode(true).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!c.state.tx_mode_enabled);
        assert_eq!(hw.boost.states(), vec![PinState::High, PinState::Low]);
        assert!(!hw.supply.dc_suspended.load(Ordering::SeqCst));
        assert!(!hw.supply.dc_overridden.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn setpoints_saturate_at_bounds() {
        let (mut c, _h, _hw) = controller(MockPort::new());
        c.state.boost_enabled = true;

        c.set_vout_mv(4_000).await.unwrap();
        c.set_vout_mv(20_000).await.unwrap();
        c.set_iout_ma(200).await.unwrap();
        c.set_iout_ma(9_000).await.unwrap();

        assert_eq!(
            c.port.writes,
            vec![
                (reg::VOUT_SET, 50),
                (reg::VOUT_SET, 120),
                (reg::ILIMIT_SET, 4),
                (reg::ILIMIT_SET, 29),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn setpoints_need_a_powered_chip() {
        let (mut c, _h, _hw) = controller(MockPort::new());

        let err = c.set_vout_mv(9_000).await.unwrap_err();
        assert!(matches!(err, Error::State(StateError::ChipOff)));
        assert!(c.port.writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn attach_sets_state_and_schedules_telemetry() {
        let mut port = MockPort::new();
        port.set_u16(reg::DEV_STATUS, status::VRECT_ON);
        port.set_u16(reg::IRQ_STATUS, status::VRECT_ON);
        let (mut c, _h, hw) = controller(port);

        let before = Instant::now();
        c.handle_status_irq().await;

        assert!(c.state.tx_attached);
        assert!(c.state.tx_connected());
        assert_eq!(hw.wake.stays.load(Ordering::SeqCst), 1);
        assert_eq!(c.telemetry_at.unwrap() - before, telemetry::SETTLE_DELAY);

        // The observed irq word is acked and the clear command issued.
        assert_eq!(
            c.port.writes,
            vec![
                (reg::IRQ_CLEAR, 0x40),
                (reg::IRQ_CLEAR + 1, 0x00),
                (reg::SYS_CMD, cmd::RX_CLR_IRQ),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn status_level_without_irq_edge_is_inert() {
        let mut port = MockPort::new();
        port.set_u16(reg::DEV_STATUS, status::VRECT_ON | status::VOUT_ON);
        // IRQ_STATUS stays zero: levels without latched edges.
        let (mut c, _h, hw) = controller(port);

        c.handle_status_irq().await;

        assert!(!c.state.tx_attached);
        assert!(c.telemetry_at.is_none());
        assert_eq!(hw.wake.stays.load(Ordering::SeqCst), 0);
        assert_eq!(hw.supply.notifies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn output_on_applies_profile_defaults() {
        let mut port = MockPort::new();
        port.set_u16(reg::DEV_STATUS, status::VOUT_ON);
        port.set_u16(reg::IRQ_STATUS, status::VOUT_ON);
        port.mem
            .insert(reg::SYS_MODE, sys_mode::WPCMODE | sys_mode::EXTENDED);
        let (mut c, _h, hw) = controller(port);
        c.state.tx_attached = true;

        let before = Instant::now();
        c.handle_status_irq().await;

        assert_eq!(c.state.mode, Mode::Epp);
        assert!(c.port.writes.contains(&(reg::VOUT_SET, 120))); // 12 V
        assert!(c.port.writes.contains(&(reg::ILIMIT_SET, 15))); // 1.6 A
        assert_eq!(c.telemetry_at.unwrap(), before);
        assert!(hw.supply.notifies.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_limit_overrides_profile_default() {
        let mut port = MockPort::new();
        port.set_u16(reg::DEV_STATUS, status::VOUT_ON);
        port.set_u16(reg::IRQ_STATUS, status::VOUT_ON);
        port.mem
            .insert(reg::SYS_MODE, sys_mode::WPCMODE | sys_mode::EXTENDED);
        let (mut c, _h, _hw) = controller(port);
        c.state.tx_attached = true;

        c.set_property(Property::CurrentMax, 800_000).await.unwrap();
        c.handle_status_irq().await;

        assert!(c.port.writes.contains(&(reg::ILIMIT_SET, 7)));
        assert!(!c.port.writes.contains(&(reg::ILIMIT_SET, 15)));
    }

    #[tokio::test(start_paused = true)]
    async fn removal_is_idempotent() {
        let (mut c, _h, hw) = controller(MockPort::new());
        c.state.tx_attached = true;
        c.set_awake(true);
        c.telemetry_at = Some(Instant::now());

        c.handle_removal().await;
        c.handle_removal().await;

        assert!(!c.state.tx_attached);
        assert_eq!(c.state.status, 0);
        assert!(c.telemetry_at.is_none());
        assert_eq!(hw.wake.relaxes.load(Ordering::SeqCst), 1);
        assert_eq!(hw.supply.notifies.load(Ordering::SeqCst), 1);
        // One chip reset, not two.
        let resets = c
            .port
            .writes
            .iter()
            .filter(|w| **w == (mtp::RESET, mtp::RESET_CHIP))
            .count();
        assert_eq!(resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_read_failure_detaches() {
        let (mut c, _h, _hw) = controller(MockPort::new());
        c.state.tx_attached = true;
        c.port.fail_reads = true;

        c.handle_status_irq().await;
        assert!(!c.state.tx_attached);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_waits_for_the_output_stage() {
        let (mut c, _h, _hw) = controller(MockPort::new());
        c.state.tx_attached = true;
        c.state.status = status::VRECT_ON;

        let before = Instant::now();
        c.telemetry_poll().await;
        assert_eq!(c.telemetry_at.unwrap() - before, telemetry::SETTLE_DELAY);

        c.state.status |= status::VOUT_ON;
        c.telemetry_at = None;
        c.telemetry_poll().await;
        assert_eq!(c.telemetry_at.unwrap() - before, telemetry::POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_read_failure_detaches() {
        let (mut c, _h, _hw) = controller(MockPort::new());
        c.state.tx_attached = true;
        c.state.status = status::VRECT_ON | status::VOUT_ON;
        c.port.fail_reads = true;

        c.telemetry_poll().await;
        assert!(!c.state.tx_attached);
        assert!(c.telemetry_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn status_irqs_are_ignored_while_programming() {
        let (mut c, _h, _hw) = controller(MockPort::new());
        c.state.tx_attached = true;
        c.state.firmware = FirmwareStatus::Pending;
        c.port.fail_reads = true;

        c.handle_status_irq().await;

        // Untouched: not even a bus transaction, so no spurious detach.
        assert!(c.state.tx_attached);
        assert!(c.port.writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_upload_is_single_flight() {
        let (mut c, _h, hw) = controller(MockPort::new());
        c.state.firmware = FirmwareStatus::Pending;

        let err = c.program_firmware(&[0u8; 16]).await.unwrap_err();
        assert!(matches!(err, Error::State(StateError::UploadPending)));
        assert_eq!(c.state.firmware, FirmwareStatus::Pending);
        assert!(hw.boost.states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_programming_sequences_boost() {
        let mut port = MockPort::new();
        port.set_u16(reg::CHIP_ID, 0x9382);
        port.read_scripts
            .insert(mtp::STAGING_BASE, vec![mtp::STATUS_OK]);
        let (mut c, _h, hw) = controller(port);

        c.program_firmware(&[0xa5u8; 32]).await.unwrap();

        assert_eq!(c.state.firmware, FirmwareStatus::Success);
        assert_eq!(hw.boost.states(), vec![PinState::High, PinState::Low]);
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_programming_checks_chip_id() {
        let mut port = MockPort::new();
        port.set_u16(reg::CHIP_ID, 0x1234);
        let (mut c, _h, hw) = controller(port);

        let err = c.program_firmware(&[0u8; 16]).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(c.state.firmware, FirmwareStatus::Failed);
        assert_eq!(hw.boost.states(), vec![PinState::High, PinState::Low]);
        // Nothing was staged.
        assert!(c.port.writes_at(mtp::DOWNLOADER_BASE).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn usb_presence_gates_the_receiver() {
        let (mut c, _h, hw) = controller(MockPort::new());

        hw.supply.usb.store(true, Ordering::SeqCst);
        c.update_supplies_status().await;
        assert!(c.state.usb_present);
        assert_eq!(hw.enable.states(), vec![PinState::High]);

        hw.supply.usb.store(false, Ordering::SeqCst);
        c.update_supplies_status().await;
        assert!(!c.state.usb_present);
        assert_eq!(hw.enable.states(), vec![PinState::High, PinState::Low]);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_on_overrides_usb_gating() {
        let (mut c, _h, hw) = controller(MockPort::new());
        c.state.usb_present = true;

        c.set_usb_keep_on(true).await;
        assert_eq!(hw.enable.states(), vec![PinState::Low]);

        c.set_usb_keep_on(false).await;
        assert_eq!(hw.enable.states(), vec![PinState::Low, PinState::High]);
    }

    #[tokio::test(start_paused = true)]
    async fn properties_read_zero_when_not_coupled() {
        let (mut c, _h, _hw) = controller(MockPort::new());

        assert_eq!(c.get_property(Property::Present).await.unwrap(), 0);
        assert_eq!(c.get_property(Property::Online).await.unwrap(), 0);
        assert_eq!(c.get_property(Property::VoltageNow).await.unwrap(), 0);
        assert_eq!(c.get_property(Property::CurrentNow).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn properties_report_microvolt_units() {
        let mut port = MockPort::new();
        port.set_u16(reg::VOUT_READ, 11_950);
        port.set_u16(reg::IOUT_READ, 740);
        let (mut c, _h, _hw) = controller(port);
        c.state.tx_attached = true;
        c.state.status = status::VRECT_ON | status::VOUT_ON;

        assert_eq!(c.get_property(Property::Present).await.unwrap(), 1);
        assert_eq!(c.get_property(Property::Online).await.unwrap(), 1);
        assert_eq!(
            c.get_property(Property::VoltageNow).await.unwrap(),
            11_950_000
        );
        assert_eq!(c.get_property(Property::CurrentNow).await.unwrap(), 740_000);
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_properties_reject_writes() {
        let (mut c, _h, _hw) = controller(MockPort::new());

        let err = c.set_property(Property::Present, 1).await.unwrap_err();
        assert!(matches!(err, Error::State(StateError::ReadOnlyProperty)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_serves_the_handle() {
        let mut port = MockPort::new();
        port.set_u16(reg::DEV_STATUS, status::VRECT_ON);
        port.set_u16(reg::IRQ_STATUS, status::VRECT_ON);
        let (c, h, _hw) = controller(port);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(c.run(shutdown.clone()));

        assert_eq!(h.firmware_status().await.unwrap(), FirmwareStatus::None);
        assert_eq!(h.get_property(Property::Present).await.unwrap(), 0);

        h.status_irq().await.unwrap();
        assert_eq!(h.get_property(Property::Present).await.unwrap(), 1);

        shutdown.cancel();
        task.await.unwrap();
        assert!(matches!(h.firmware_status().await, Err(Error::Closed)));
    }
}
