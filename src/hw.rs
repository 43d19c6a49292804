//! Platform hardware boundary traits.
//!
//! The controller never touches GPIO or power-management primitives
//! directly; the platform hands it implementations of these traits at
//! construction time.

use async_trait::async_trait;

use crate::error::Result;

/// Logic level of a GPIO line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    Low,
    High,
}

/// An output line the controller drives.
///
/// Used for the receiver enable line (active low: `High` disables the
/// receiver) and the boost line (active high: `High` back-powers the chip
/// so its register interface works without a coupled field).
#[async_trait]
pub trait OutputPin: Send {
    async fn set(&mut self, state: PinState) -> Result<()>;
}

/// System wake-lock handle.
///
/// Held while a transmitter is coupled or boost is on so the host does not
/// suspend mid-charge. Both calls must be idempotent.
pub trait WakeSource: Send {
    fn stay_awake(&mut self);
    fn relax(&mut self);
}
