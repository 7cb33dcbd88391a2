//! The recorded step tree.
//!
//! A [`Step`] is either an [`StepKind::Action`] leaf (one atomic interaction
//! with its resolved target) or a [`StepKind::Task`] grouping child steps
//! under a name. The root of every persisted trace is a Task.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::bbox::BBox;
use crate::error::{Result, TraceError};
use crate::observation::Observation;

/// Persistence policy of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SaveStatus {
    #[default]
    ToRecord,
    /// Recorded and explicitly confirmed by the operator.
    ConfirmRecord,
    /// Transparent container: children are kept, the step itself is not.
    OnlySubsteps,
    NoRecord,
}

impl SaveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveStatus::ToRecord => "TO_RECORD",
            SaveStatus::ConfirmRecord => "CONFIRM_RECORD",
            SaveStatus::OnlySubsteps => "ONLY_SUBSTEPS",
            SaveStatus::NoRecord => "NO_RECORD",
        }
    }
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaveStatus {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TO_RECORD" => Ok(SaveStatus::ToRecord),
            "CONFIRM_RECORD" => Ok(SaveStatus::ConfirmRecord),
            "ONLY_SUBSTEPS" => Ok(SaveStatus::OnlySubsteps),
            "NO_RECORD" => Ok(SaveStatus::NoRecord),
            other => Err(TraceError::Parse(format!("unknown save status: {other}"))),
        }
    }
}

/// Outcome reported by the automation framework before a step finishes.
pub const STATUS_NOT_SET: &str = "NOT SET";
pub const STATUS_PASS: &str = "PASS";

/// Before/after state of a step and its reported outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub start_observation: Observation,
    pub end_observation: Option<Observation>,
    pub status: String,
}

impl Context {
    pub fn new(start_observation: Observation) -> Self {
        Self {
            start_observation,
            end_observation: None,
            status: STATUS_NOT_SET.to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.start_observation.is_complete()
            && self
                .end_observation
                .as_ref()
                .is_some_and(Observation::is_complete)
    }
}

/// Resolved arguments of an Action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionArgs {
    /// Locator the action was performed on.
    pub selector: String,
    /// Literal payload, e.g. the typed text.
    pub input_string: String,
    pub bbox: Option<BBox>,
}

impl ActionArgs {
    pub fn new(selector: impl Into<String>, input_string: impl Into<String>, bbox: Option<BBox>) -> Self {
        Self {
            selector: selector.into(),
            input_string: input_string.into(),
            bbox,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepKind {
    Action { args: ActionArgs },
    Task { children: Vec<Step> },
}

/// One node of the recorded tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: u64,
    pub name: String,
    pub status: SaveStatus,
    pub tags: BTreeSet<String>,
    pub context: Option<Context>,
    pub kind: StepKind,
}

impl Step {
    pub fn action(id: u64, name: impl Into<String>, args: ActionArgs) -> Self {
        Self {
            id,
            name: name.into(),
            status: SaveStatus::default(),
            tags: BTreeSet::new(),
            context: None,
            kind: StepKind::Action { args },
        }
    }

    pub fn task(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: SaveStatus::default(),
            tags: BTreeSet::new(),
            context: None,
            kind: StepKind::Task {
                children: Vec::new(),
            },
        }
    }

    pub fn with_status(mut self, status: SaveStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_children(mut self, steps: Vec<Step>) -> Self {
        if let StepKind::Task { children } = &mut self.kind {
            *children = steps;
        }
        self
    }

    pub fn is_task(&self) -> bool {
        matches!(self.kind, StepKind::Task { .. })
    }

    pub fn is_action(&self) -> bool {
        matches!(self.kind, StepKind::Action { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Action { .. } => "action",
            StepKind::Task { .. } => "task",
        }
    }

    /// Children of a Task; an Action has none.
    pub fn children(&self) -> &[Step] {
        match &self.kind {
            StepKind::Task { children } => children,
            StepKind::Action { .. } => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Step>> {
        match &mut self.kind {
            StepKind::Task { children } => Some(children),
            StepKind::Action { .. } => None,
        }
    }

    pub fn args(&self) -> Option<&ActionArgs> {
        match &self.kind {
            StepKind::Action { args } => Some(args),
            StepKind::Task { .. } => None,
        }
    }

    pub fn args_mut(&mut self) -> Option<&mut ActionArgs> {
        match &mut self.kind {
            StepKind::Action { args } => Some(args),
            StepKind::Task { .. } => None,
        }
    }

    /// Case-insensitive tag lookup.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn start_observation(&self) -> Option<&Observation> {
        self.context.as_ref().map(|c| &c.start_observation)
    }

    pub fn end_observation(&self) -> Option<&Observation> {
        self.context.as_ref().and_then(|c| c.end_observation.as_ref())
    }

    pub fn is_complete(&self) -> bool {
        self.context.as_ref().is_some_and(Context::is_complete)
    }

    pub fn add_step(&mut self, step: Step) -> Result<()> {
        let name = self.name.clone();
        self.children_mut()
            .ok_or_else(|| TraceError::protocol(format!("cannot add a child to action '{name}'")))?
            .push(step);
        Ok(())
    }

    pub fn child(&self, id: u64) -> Option<&Step> {
        self.children().iter().find(|s| s.id == id)
    }

    pub fn find_step(&self, id: u64) -> Result<&Step> {
        self.search(id).ok_or(TraceError::StepNotFound(id))
    }

    fn search(&self, id: u64) -> Option<&Step> {
        if self.id == id {
            return Some(self);
        }
        self.children().iter().find_map(|child| child.search(id))
    }

    pub fn find_step_mut(&mut self, id: u64) -> Result<&mut Step> {
        self.search_mut(id).ok_or(TraceError::StepNotFound(id))
    }

    fn search_mut(&mut self, id: u64) -> Option<&mut Step> {
        if self.id == id {
            return Some(self);
        }
        match &mut self.kind {
            StepKind::Task { children } => children.iter_mut().find_map(|c| c.search_mut(id)),
            StepKind::Action { .. } => None,
        }
    }

    /// Ids of the Tasks enclosing `id`: root first, immediate parent last.
    /// Empty when `id` is this step itself.
    pub fn parent_ids(&self, id: u64) -> Result<Vec<u64>> {
        if self.id == id {
            return Ok(Vec::new());
        }
        let mut chain = Vec::new();
        if self.collect_parents(id, &mut chain) {
            Ok(chain)
        } else {
            Err(TraceError::StepNotFound(id))
        }
    }

    fn collect_parents(&self, id: u64, chain: &mut Vec<u64>) -> bool {
        chain.push(self.id);
        if self.children().iter().any(|c| c.id == id) {
            return true;
        }
        for child in self.children().iter().filter(|c| c.is_task()) {
            if child.collect_parents(id, chain) {
                return true;
            }
        }
        chain.pop();
        false
    }

    pub fn parent_of(&self, id: u64) -> Result<&Step> {
        let ids = self.parent_ids(id)?;
        let parent_id = ids
            .last()
            .copied()
            .ok_or_else(|| TraceError::protocol(format!("step {id} is the root and has no parent")))?;
        self.find_step(parent_id)
    }

    /// Pre-order walk, this step included.
    pub fn all_steps(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        self.walk(&mut out);
        out
    }

    fn walk<'a>(&'a self, out: &mut Vec<&'a Step>) {
        out.push(self);
        for child in self.children() {
            child.walk(out);
        }
    }

    pub fn all_tasks(&self) -> Vec<&Step> {
        self.all_steps().into_iter().filter(|s| s.is_task()).collect()
    }

    /// Remove a direct child.
    pub fn remove_step_by_id(&mut self, id: u64) -> Result<Step> {
        let children = self.children_mut().ok_or(TraceError::StepNotFound(id))?;
        let position = children
            .iter()
            .position(|s| s.id == id)
            .ok_or(TraceError::StepNotFound(id))?;
        Ok(children.remove(position))
    }

    /// Replace a descendant in place, keeping its position among its siblings.
    pub fn replace_step_by_id(&mut self, id: u64, new_step: Step) -> Result<bool> {
        let parent_id = self
            .parent_ids(id)?
            .last()
            .copied()
            .ok_or_else(|| TraceError::protocol("cannot replace the root step"))?;
        let parent = self.find_step_mut(parent_id)?;
        let Some(children) = parent.children_mut() else {
            return Ok(false);
        };
        match children.iter_mut().find(|s| s.id == id) {
            Some(slot) => {
                *slot = new_step;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Set the status of every descendant, not of this step.
    pub fn set_status_recursive(&mut self, status: SaveStatus) {
        if let Some(children) = self.children_mut() {
            for child in children {
                child.status = status;
                child.set_status_recursive(status);
            }
        }
    }

    pub fn has_confirmed_tasks_inside(&self) -> bool {
        self.all_tasks()
            .iter()
            .any(|t| t.status == SaveStatus::ConfirmRecord)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)?;
        if let Some(context) = &self.context {
            write!(f, ": {}", context.start_observation.timestamp)?;
            if let Some(end) = &context.end_observation {
                write!(f, " - {}", end.timestamp)?;
            }
        }
        Ok(())
    }
}
