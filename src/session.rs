//! Recording driven by explicit calls instead of framework events.
//!
//! A browser extension reports page actions one by one and names the task
//! they accomplished afterwards, so actions are buffered until
//! [`SessionRecorder::store_task`] groups them. There is no nesting below
//! the root.

use chrono::{DateTime, Local, TimeDelta, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::actions::RobotAction;
use crate::error::{Result, TraceError};
use crate::observation::Observation;
use crate::persist::{save_trace, trace_file_stem};
use crate::step::{ActionArgs, Context, STATUS_PASS, Step};

/// Pointer position recorded when the client does not report one.
const UNKNOWN_POINTER: (i32, i32) = (-1, -1);

#[derive(Debug)]
pub struct SessionRecorder {
    root: Step,
    pending: Vec<Step>,
    next_id: u64,
    started_at: DateTime<Utc>,
    output_dir: PathBuf,
    with_json: bool,
}

impl SessionRecorder {
    /// Open a session whose root Task is `name`.
    pub fn start_root_task(name: &str, output_dir: impl Into<PathBuf>) -> Self {
        info!(task = name, "starting root task");
        Self {
            root: Step::task(0, name),
            pending: Vec::new(),
            next_id: 1,
            started_at: Utc::now(),
            output_dir: output_dir.into(),
            with_json: false,
        }
    }

    pub fn with_json(mut self, with_json: bool) -> Self {
        self.with_json = with_json;
        self
    }

    pub fn root(&self) -> &Step {
        &self.root
    }

    pub fn pending(&self) -> &[Step] {
        &self.pending
    }

    /// Observation timestamps are synthetic: session start plus one second
    /// per allocated id, so they stay ordered whatever the client clock does.
    fn observation(&self, screenshot: &str) -> Observation {
        let at = self.started_at + TimeDelta::seconds(self.next_id as i64);
        Observation::new(at, screenshot, "", UNKNOWN_POINTER)
    }

    /// The step whose end is still open: the last buffered action, or the
    /// last grouped task.
    fn last_step_mut(&mut self) -> Option<&mut Step> {
        match self.pending.last_mut() {
            Some(action) => Some(action),
            None => self.root.children_mut().and_then(|c| c.last_mut()),
        }
    }

    /// Close the previous step with `observation`. A Task's last child is
    /// closed along with it.
    fn close_last_step(&mut self, observation: &Observation) {
        let Some(last) = self.last_step_mut() else {
            return;
        };
        if let Some(child) = last.children_mut().and_then(|c| c.last_mut()) {
            if let Some(context) = child.context.as_mut() {
                context.end_observation = Some(observation.clone());
            }
        }
        if let Some(context) = last.context.as_mut() {
            context.end_observation = Some(observation.clone());
        }
    }

    /// Buffer one action. Its screenshot also closes the previous step.
    pub fn store_page_action(&mut self, action: RobotAction, args: ActionArgs, screenshot: &str) -> u64 {
        let observation = self.observation(screenshot);
        self.close_last_step(&observation);

        let id = self.next_id;
        self.next_id += 1;
        let mut context = Context::new(observation);
        context.status = STATUS_PASS.to_string();
        self.pending
            .push(Step::action(id, action.name(), args).with_context(context));
        info!(action = %action, id, "stored page action");
        id
    }

    /// Group the buffered actions under a Task named `name`.
    pub fn store_task(&mut self, name: &str) -> Result<u64> {
        let first = self
            .pending
            .first()
            .and_then(|a| a.context.as_ref())
            .ok_or_else(|| TraceError::protocol(format!("task '{name}' has no actions to group")))?;
        let mut context = Context::new(first.start_observation.clone());
        context.status = STATUS_PASS.to_string();

        let id = self.next_id;
        self.next_id += 1;
        let actions = std::mem::take(&mut self.pending);
        let task = Step::task(id, name)
            .with_context(context)
            .with_children(actions);
        self.root.add_step(task)?;
        info!(task = name, id, "stored task");
        Ok(id)
    }

    /// Close the last step with the final screenshot and persist the root.
    /// Returns the root task name.
    pub fn save_task(&mut self, screenshot: &str) -> Result<String> {
        if screenshot.is_empty() {
            return Err(TraceError::protocol("saving a task requires a final screenshot"));
        }
        if !self.pending.is_empty() {
            warn!(count = self.pending.len(), "dropping actions never grouped into a task");
            self.pending.clear();
        }
        let first_context = self
            .root
            .children()
            .first()
            .and_then(|s| s.context.clone())
            .ok_or_else(|| TraceError::protocol(format!("root task '{}' has no steps", self.root.name)))?;

        let end = self.observation(screenshot);
        self.close_last_step(&end);

        let mut context = first_context;
        context.end_observation = Some(end);
        self.root.context = Some(context);

        self.persist()?;
        info!(task = %self.root.name, "saved task");
        Ok(self.root.name.clone())
    }

    fn persist(&self) -> Result<PathBuf> {
        let stem = trace_file_stem(&self.root.name, Local::now());
        save_trace(&self.root, &self.output_dir, &stem, self.with_json)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// Live sessions by id. Created on start, removed on save.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, SessionRecorder>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, name: &str, output_dir: impl Into<PathBuf>, with_json: bool) -> Uuid {
        let id = Uuid::new_v4();
        let recorder = SessionRecorder::start_root_task(name, output_dir).with_json(with_json);
        self.sessions.insert(id, recorder);
        id
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut SessionRecorder> {
        self.sessions.get_mut(id)
    }

    /// Detach a session, e.g. to persist it without holding the registry.
    pub fn take(&mut self, id: &Uuid) -> Option<SessionRecorder> {
        self.sessions.remove(id)
    }

    /// Put back a session whose save failed so the client can retry.
    pub fn restore(&mut self, id: Uuid, recorder: SessionRecorder) {
        self.sessions.insert(id, recorder);
    }

    /// Save and forget a session. `None` when the id is unknown.
    pub fn save(&mut self, id: &Uuid, screenshot: &str) -> Option<Result<String>> {
        let mut recorder = self.take(id)?;
        let saved = recorder.save_task(screenshot);
        if saved.is_err() {
            self.restore(*id, recorder);
        }
        Some(saved)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
