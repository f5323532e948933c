//! Active slot states

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of the single model slot
///
/// ```text
/// empty -> loading -> ready -> generating -> ready -> unloading -> empty
///             \          \          \                      /
///              +----------+----------+------> error <-----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Empty,
    Loading,
    Ready,
    Generating,
    Unloading,
    Error,
}

impl SlotState {
    /// Another operation owns the slot
    pub fn is_busy(self) -> bool {
        matches!(self, SlotState::Loading | SlotState::Generating | SlotState::Unloading)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Empty => "empty",
            SlotState::Loading => "loading",
            SlotState::Ready => "ready",
            SlotState::Generating => "generating",
            SlotState::Unloading => "unloading",
            SlotState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Published on every slot transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub state: SlotState,
    /// Model resident in the engine, if any
    pub model_id: Option<String>,
    /// Context length the resident model was loaded with
    pub context_length: Option<u32>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SlotStatus {
    pub fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            model_id: None,
            context_length: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}
