use serde::{Deserialize, Serialize};

/// Per-session fog configuration, shared with every peer through sync messages.
///
/// Only `enabled` and `global_reveal` change what players see; the rest is
/// passed through to renderers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FogSettings {
    pub enabled: bool,
    /// GM "show everything" toggle.
    pub global_reveal: bool,
    pub opacity: f32,
    pub explored_opacity: f32,
    pub blur: f32,
}

impl Default for FogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            global_reveal: false,
            opacity: 1.0,
            explored_opacity: 0.5,
            blur: 0.0,
        }
    }
}

impl FogSettings {
    /// Whether renderers should draw the grid at all.
    pub fn masks_map(&self) -> bool {
        self.enabled && !self.global_reveal
    }
}
