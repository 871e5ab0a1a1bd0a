//! Board registry: maps check-run target names to board descriptors.

use std::collections::HashMap;
use std::path::Path;

use crate::models::board::Board;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown board target: {0}")]
    NotFound(String),
    #[error("duplicate board target: {0}")]
    Duplicate(String),
    #[error("reading board file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing board file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read-only lookup table of boards, keyed by target.
#[derive(Debug, Clone, Default)]
pub struct BoardRegistry {
    boards: HashMap<String, Board>,
}

impl BoardRegistry {
    pub fn new(boards: Vec<Board>) -> Result<Self, RegistryError> {
        let mut map = HashMap::with_capacity(boards.len());
        for board in boards {
            if map.contains_key(&board.target) {
                return Err(RegistryError::Duplicate(board.target));
            }
            map.insert(board.target.clone(), board);
        }
        Ok(Self { boards: map })
    }

    /// Load a JSON array of boards.
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: display.clone(),
            source,
        })?;
        let boards: Vec<Board> = serde_json::from_str(&raw).map_err(|source| {
            RegistryError::Parse {
                path: display,
                source,
            }
        })?;
        Self::new(boards)
    }

    /// The boards wired to the reference TinyHCI rig.
    pub fn builtin() -> Self {
        let boards = [
            ("itsybitsy-m4", "Adafruit ItsyBitsy M4", "/dev/ttyACM0"),
            ("arduino-nano33", "Arduino Nano33 IoT", "/dev/ttyACM1"),
        ]
        .into_iter()
        .map(|(target, display_name, device)| Board {
            target: target.to_string(),
            display_name: display_name.to_string(),
            device: device.to_string(),
            flash_command: format!("make flash-{target}"),
            test_command: format!("make test-{target}"),
        })
        .map(|b| (b.target.clone(), b))
        .collect();

        Self { boards }
    }

    pub fn resolve(&self, target: &str) -> Result<&Board, RegistryError> {
        self.boards
            .get(target)
            .ok_or_else(|| RegistryError::NotFound(target.to_string()))
    }

    pub fn contains(&self, target: &str) -> bool {
        self.boards.contains_key(target)
    }

    /// All targets, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.boards.keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }
}
