//! Microphone contract.
//!
//! A capture device is exclusively owned by one live session. `acquire` grabs
//! the hardware (or its stand-in) and is the only step allowed to fail with
//! `DeviceUnavailable`; `start` begins delivering fixed-size blocks to an
//! `OutboundStreamer` from the device's own callback context; `release` stops
//! delivery and frees the device. `release` must be safe to call repeatedly.

use crate::audio::outbound::OutboundStreamer;
use crate::error::LiveError;

pub trait CaptureDevice: Send {
    /// Short name for logs, e.g. `wav:input.wav` or `cpal:default`.
    fn name(&self) -> String;

    /// Take ownership of the microphone.
    fn acquire(&mut self) -> Result<(), LiveError>;

    /// Begin delivering capture blocks to `streamer`.
    ///
    /// Blocks are delivered in capture order from the device's callback
    /// context, which must never block on the network.
    fn start(&mut self, streamer: OutboundStreamer) -> Result<(), LiveError>;

    /// Stop delivery and free the device. Idempotent.
    fn release(&mut self);

    fn is_acquired(&self) -> bool;
}
