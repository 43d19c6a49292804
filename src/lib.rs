//! Controller for the IDT P938x inductive wireless power receiver.
//!
//! The P938x couples to a Qi transmitter pad, rectifies the induced AC, and
//! feeds a battery charger through an LDO output stage. This crate implements
//! the control logic on top of an abstract register bus: the status/IRQ state
//! machine, transmit-mode management, periodic telemetry, and the chunked,
//! checksummed protocol for programming firmware into the chip's OTP memory
//! through its SRAM staging buffer.
//!
//! The platform supplies the physical pieces as trait objects: a
//! [`port::RegisterPort`] for the bus, [`hw::OutputPin`]s for the enable and
//! boost lines, a [`hw::WakeSource`], and a [`supply::SupplyHub`] for the
//! wired-charger side. The [`controller::Controller`] task owns all of them
//! and serializes every register transaction; stimuli (IRQ edges, detach
//! detection, user requests) arrive as [`controller::Event`] messages through
//! a [`controller::Handle`].

pub mod codec;
pub mod controller;
pub mod error;
pub mod firmware;
pub mod hw;
pub mod port;
pub mod regs;
pub mod supply;
pub mod telemetry;

pub use controller::{Controller, FirmwareStatus, Handle};
pub use error::{Error, Result};
pub use supply::Property;
