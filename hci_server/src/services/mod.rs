//! TinyHCI services: build coordination and the collaborators it drives.

pub mod artifact_service;
pub mod board_driver;
pub mod board_registry;
pub mod build_index;
pub mod coordinator;
pub mod github_auth;
pub mod github_service;

#[cfg(test)]
pub mod fakes;

/// Result of one external step (toolchain install, flash, or test).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub success: bool,
    pub output: String,
}

impl StepOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Keep the last `max` bytes of `text`, marking the cut.
pub fn truncate_output(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...truncated...\n{}", &text[start..])
}
