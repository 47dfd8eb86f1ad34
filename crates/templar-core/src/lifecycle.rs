use crate::CoreError;
use serde::Serialize;
use std::fmt;

/// Per-template pipeline state. `Converted`, `Skipped` and `Failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateState {
    Selected,
    Allocating,
    Acquiring,
    Customizing,
    Importing,
    Configuring,
    Converted,
    Skipped,
    Failed,
}

impl TemplateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Converted | Self::Skipped | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Selected => "selected",
            Self::Allocating => "allocating",
            Self::Acquiring => "acquiring",
            Self::Customizing => "customizing",
            Self::Importing => "importing",
            Self::Configuring => "configuring",
            Self::Converted => "converted",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TemplateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn validate_transition(from: TemplateState, to: TemplateState) -> Result<(), CoreError> {
    use TemplateState::{
        Acquiring, Allocating, Configuring, Converted, Customizing, Failed, Importing, Selected,
        Skipped,
    };

    let valid = matches!(
        (from, to),
        (Selected, Allocating | Skipped)
            | (Allocating, Acquiring)
            | (Acquiring, Customizing | Importing)
            | (Customizing, Importing)
            | (Importing, Configuring)
            | (Configuring, Converted)
    ) || (!from.is_terminal() && to == Failed);

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
