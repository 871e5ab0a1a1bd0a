//! hci.board: A physical board attached to the CI host.

use serde::{Deserialize, Serialize};

/// Static descriptor for one board under test. Immutable after registry load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    /// Check-run name this board reports under (e.g. `itsybitsy-m4`).
    pub target: String,
    pub display_name: String,
    /// Serial device the board is attached on.
    pub device: String,
    /// Shell command that flashes the test firmware.
    pub flash_command: String,
    /// Shell command that captures the firmware's test output.
    pub test_command: String,
}
