//! btleplug platform for gattlink
//!
//! Implements the `GattPlatform` and `GattLink` capabilities of
//! `gattlink-core` on top of btleplug. btleplug exposes async request /
//! response calls, so every start call spawns the matching btleplug future
//! and reports its outcome through the link's callback sink.
//!
//! btleplug writes the client characteristic configuration descriptor
//! itself when subscribing, so subscriptions should be set up in
//! `NotificationSetupMode::Compat`. MTU and connection priority requests are
//! not exposed by btleplug and are refused.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

mod attributes;
pub mod error;
mod link;
pub mod platform;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use error::{BtleError, Result};
pub use link::BtleLink;
pub use platform::{BtlePlatform, ScannedPeripheral};
