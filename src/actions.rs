use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TraceError;

/// The interactions the prediction model learns to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotAction {
    ClickAtBbox,
    KeyboardInput,
    ScrollDown,
    ScrollUp,
    ScrollDownAtBbox,
    ScrollUpAtBbox,
}

impl RobotAction {
    pub const ALL: [RobotAction; 6] = [
        RobotAction::ClickAtBbox,
        RobotAction::KeyboardInput,
        RobotAction::ScrollDown,
        RobotAction::ScrollUp,
        RobotAction::ScrollDownAtBbox,
        RobotAction::ScrollUpAtBbox,
    ];

    /// Keyword name recorded in traces.
    pub fn name(&self) -> &'static str {
        match self {
            RobotAction::ClickAtBbox => "Click At BBox",
            RobotAction::KeyboardInput => "Keyboard Input",
            RobotAction::ScrollDown => "Scroll Down",
            RobotAction::ScrollUp => "Scroll Up",
            RobotAction::ScrollDownAtBbox => "Scroll Down At BBox",
            RobotAction::ScrollUpAtBbox => "Scroll Up At BBox",
        }
    }

    pub fn identifier(&self) -> &'static str {
        match self {
            RobotAction::ClickAtBbox => "click_at_bbox",
            RobotAction::KeyboardInput => "keyboard_input",
            RobotAction::ScrollDown => "scroll_down",
            RobotAction::ScrollUp => "scroll_up",
            RobotAction::ScrollDownAtBbox => "scroll_down_at_bbox",
            RobotAction::ScrollUpAtBbox => "scroll_up_at_bbox",
        }
    }
}

impl fmt::Display for RobotAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RobotAction {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RobotAction::ALL
            .into_iter()
            .find(|action| action.identifier() == s)
            .ok_or_else(|| TraceError::Classification(format!("unknown action: {s}")))
    }
}
