//! Recorder configuration and the per-surface presets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TraceError};

/// Where the literal payload of a typing keyword sits in its argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgPosition {
    /// A single argument.
    Index(usize),
    /// Every argument from this index on, joined with spaces.
    Rest(usize),
}

impl ArgPosition {
    pub fn extract(&self, args: &[String]) -> String {
        match *self {
            ArgPosition::Index(i) => args.get(i).cloned().unwrap_or_default(),
            ArgPosition::Rest(i) => args.get(i..).map(|rest| rest.join(" ")).unwrap_or_default(),
        }
    }
}

/// Keyword types the framework emits for control-flow constructs.
pub const CONTROL_FLOW_TYPES: [&str; 10] = [
    "FOR", "ITERATION", "IF", "ELSE IF", "ELSE", "END", "WHILE", "TRY", "EXCEPT", "FINALLY",
];

/// Lowercase the name and drop spaces and underscores, so `Type Text`,
/// `type_text` and `TypeText` compare equal.
pub fn normalize_keyword(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Browser,
    Selenium,
    Desktop,
}

impl FromStr for Preset {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "browser" => Ok(Preset::Browser),
            "selenium" => Ok(Preset::Selenium),
            "desktop" => Ok(Preset::Desktop),
            other => Err(TraceError::Parse(format!("unknown recorder preset: {other}"))),
        }
    }
}

/// Everything the recorder needs to classify keywords and persist traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Library whose keywords are recorded as actions.
    pub observed_library: String,
    pub output_dir: PathBuf,
    /// Libraries whose keywords are recorded as Tasks.
    pub task_libraries: Vec<String>,
    /// Tags marking a keyword as a recognized action.
    pub action_tags: Vec<String>,
    /// Tags that drop a keyword from the trace.
    pub exclude_tags: Vec<String>,
    /// Tags that drop a whole Task when it ends.
    pub exclude_task_tags: Vec<String>,
    /// Normalized typing keyword name to payload position.
    pub typing_positions: BTreeMap<String, ArgPosition>,
    /// Normalized name fragments that mark a keyword as an action even when
    /// its library does not tag it.
    pub keywords_to_record: Vec<String>,
    pub only_actions: bool,
    /// Write a JSON mirror for every scenario, not only those tagged `json`.
    pub all_json: bool,
    /// When false nothing is persisted at the end of a scenario.
    pub record: bool,
    pub wait_after_action_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self::browser()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn positions(items: &[(&str, ArgPosition)]) -> BTreeMap<String, ArgPosition> {
    items.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

pub fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("rpa-trace"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl RecorderConfig {
    fn base(observed_library: &str) -> Self {
        Self {
            observed_library: observed_library.to_string(),
            output_dir: default_output_dir(),
            task_libraries: Vec::new(),
            action_tags: Vec::new(),
            exclude_tags: Vec::new(),
            exclude_task_tags: strings(&["no_record"]),
            typing_positions: positions(&[("observation", ArgPosition::Index(0))]),
            keywords_to_record: Vec::new(),
            only_actions: true,
            all_json: false,
            record: true,
            wait_after_action_ms: 0,
        }
    }

    pub fn browser() -> Self {
        let mut config = Self::base("Browser");
        config.action_tags = strings(&["PageContent", "ActionWrapper"]);
        config.exclude_tags = strings(&["Wait"]);
        config.typing_positions.extend(positions(&[
            ("keyboardinput", ArgPosition::Index(1)),
            ("keyboardkey", ArgPosition::Rest(1)),
            ("typetext", ArgPosition::Index(1)),
            ("typesecret", ArgPosition::Index(1)),
            ("presskeys", ArgPosition::Rest(1)),
        ]));
        config
    }

    pub fn selenium() -> Self {
        let mut config = Self::base("SeleniumLibrary");
        config.action_tags = strings(&["PageContent", "ActionWrapper"]);
        config.exclude_tags = strings(&["Wait"]);
        config.typing_positions.extend(positions(&[
            ("keyboardinput", ArgPosition::Index(0)),
            ("inputtext", ArgPosition::Index(1)),
            ("inputpassword", ArgPosition::Index(1)),
            ("inputsecret", ArgPosition::Index(1)),
            ("inputfile", ArgPosition::Index(1)),
            ("inputfilewithcontent", ArgPosition::Index(1)),
            ("inputfilewithcontentandencoding", ArgPosition::Index(1)),
        ]));
        config.keywords_to_record = strings(&[
            "scrollelementintoview",
            "clickelementatcoordinates",
            "doubleclickelement",
            "mousedown",
            "mouseout",
            "mouseover",
            "mouseup",
            "opencontextmenu",
            "presskey",
            "presskeys",
            "submitform",
            "unselectcheckbox",
            "selectcheckbox",
            "selectradiobutton",
            "choosefile",
        ]);
        config
    }

    pub fn desktop() -> Self {
        let mut config = Self::base("Desktop");
        config.action_tags = strings(&["PageContent"]);
        config.typing_positions.extend(positions(&[
            ("keyboardinput", ArgPosition::Index(0)),
            ("typetext", ArgPosition::Index(0)),
            ("typetextinto", ArgPosition::Index(1)),
            ("presskeys", ArgPosition::Index(0)),
        ]));
        config.keywords_to_record = strings(&[
            "click",
            "clickwithoffset",
            "movemouse",
            "presskeys",
            "pressmousebutton",
            "releasemousebutton",
            "scrolldown",
            "keyboardinput",
            "typetext",
            "typetextinto",
        ]);
        config
    }

    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Browser => Self::browser(),
            Preset::Selenium => Self::selenium(),
            Preset::Desktop => Self::desktop(),
        }
    }

    /// Load a JSON config file. Missing fields fall back to the browser preset.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Payload position of a typing keyword. When several typing keys are
    /// contained in the name the longest one wins, so `Type Text Into`
    /// resolves to `typetextinto` rather than `typetext`.
    pub fn typing_position(&self, keyword: &str) -> Option<ArgPosition> {
        let normalized = normalize_keyword(keyword);
        self.typing_positions
            .iter()
            .filter(|(key, _)| normalized.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, position)| *position)
    }

    pub fn is_action_tag(&self, tag: &str) -> bool {
        self.action_tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn is_excluded_tag(&self, tag: &str) -> bool {
        self.exclude_tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn is_excluded_task_tag(&self, tag: &str) -> bool {
        self.exclude_task_tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn is_task_library(&self, library: &str) -> bool {
        self.task_libraries.iter().any(|l| l == library)
    }

    /// True when the keyword should be tagged with the first action tag.
    pub fn should_force_record(&self, keyword: &str) -> bool {
        let normalized = normalize_keyword(keyword);
        self.keywords_to_record
            .iter()
            .any(|fragment| normalized.contains(fragment.as_str()))
    }
}

pub fn is_control_flow(keyword_type: &str) -> bool {
    CONTROL_FLOW_TYPES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(keyword_type.trim()))
}
