//! Task/Action classification of framework keyword events.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::config::{RecorderConfig, is_control_flow};
use crate::error::{Result, TraceError};
use crate::step::{STATUS_NOT_SET, SaveStatus};

pub const TASK_TAG: &str = "task";
pub const ACTION_TAG: &str = "action";
pub const ONLY_SUBSTEPS_TAG: &str = "only_substeps";

/// One keyword start or end notification from the automation framework.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordEvent {
    /// Fully qualified name, e.g. `Browser.Click`. Empty for some
    /// control-flow markers.
    pub name: String,
    /// Display name without the library prefix.
    pub kwname: String,
    pub libname: Option<String>,
    /// Framework keyword type: `KEYWORD`, `SETUP`, `FOR`, `IF`, ...
    #[serde(rename = "type")]
    pub keyword_type: String,
    pub tags: Vec<String>,
    pub args: Vec<String>,
    /// Outcome, only meaningful on end events.
    pub status: String,
}

impl KeywordEvent {
    pub fn keyword(libname: Option<&str>, kwname: &str) -> Self {
        let name = match libname {
            Some(lib) => format!("{lib}.{kwname}"),
            None => kwname.to_string(),
        };
        Self {
            name,
            kwname: kwname.to_string(),
            libname: libname.map(str::to_string),
            keyword_type: "KEYWORD".to_string(),
            tags: Vec::new(),
            args: Vec::new(),
            status: STATUS_NOT_SET.to_string(),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_type(mut self, keyword_type: &str) -> Self {
        self.keyword_type = keyword_type.to_string();
        self
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    fn library(&self) -> Option<&str> {
        self.libname.as_deref().filter(|lib| !lib.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepClass {
    Task,
    Action,
}

/// Outcome of classifying one start event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub class: StepClass,
    pub status: SaveStatus,
    /// Event tags plus any tag the configuration forced on.
    pub tags: BTreeSet<String>,
}

/// Decide Task vs Action and the save status of a starting keyword.
///
/// A keyword tagged both `task` and `action` is an authoring error and is
/// rejected before anything is built.
pub fn classify(event: &KeywordEvent, config: &RecorderConfig) -> Result<Classification> {
    if event.has_tag(TASK_TAG) && event.has_tag(ACTION_TAG) {
        return Err(TraceError::Classification(format!(
            "keyword '{}' cannot be a task and an action at the same time",
            event.kwname
        )));
    }

    let mut tags: BTreeSet<String> = event.tags.iter().cloned().collect();
    if config.should_force_record(&event.kwname) {
        if let Some(first) = config.action_tags.first() {
            tags.insert(first.clone());
        }
    }
    let has_tag = |tag: &str| tags.iter().any(|t| t.eq_ignore_ascii_case(tag));

    let mut status = SaveStatus::ToRecord;
    if event.name.is_empty() || is_control_flow(&event.keyword_type) {
        status = SaveStatus::OnlySubsteps;
    }

    let class = match event.library() {
        _ if has_tag(ACTION_TAG) => StepClass::Action,
        None => StepClass::Task,
        Some(lib) if config.is_task_library(lib) => StepClass::Task,
        Some(_) if has_tag(TASK_TAG) => StepClass::Task,
        Some(_) => StepClass::Action,
    };

    if class == StepClass::Action && event.library() != Some(config.observed_library.as_str()) {
        debug!(keyword = %event.kwname, library = ?event.libname, "action from another library, not recording");
        status = SaveStatus::NoRecord;
    }

    if tags.iter().any(|t| config.is_excluded_tag(t)) {
        debug!(keyword = %event.kwname, "keyword has an exclude tag, not recording");
        status = SaveStatus::NoRecord;
    }

    if has_tag(ONLY_SUBSTEPS_TAG) {
        debug!(keyword = %event.kwname, "only substeps will be recorded");
        status = SaveStatus::OnlySubsteps;
    }

    if class == StepClass::Action
        && config.only_actions
        && !tags.iter().any(|t| config.is_action_tag(t))
    {
        debug!(keyword = %event.kwname, "not registered as an action, not recording");
        status = SaveStatus::NoRecord;
    }

    Ok(Classification { class, status, tags })
}
