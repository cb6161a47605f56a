//! Signalling relay settings.

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Settings of the signalling relay usage.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SmartDefault,
)]
#[serde(default)]
pub struct Signalling {
    /// Whether system commands addressed to a channel without an open data
    /// channel are sent through the signalling relay instead of being
    /// dropped.
    ///
    /// Defaults to `true`.
    #[default(true)]
    pub send_system_commands_via_relay: bool,
}
