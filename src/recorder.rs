//! Listener adapter: turns keyword start/end notifications into a step tree.
//!
//! The recorder owns the [`ExecutionStack`] and the driven [`Surface`]. Each
//! start event is classified, given the last known observation and pushed;
//! each end event pops the step, closes its context and attaches it to the
//! nearest recording Task. When a scenario ends the root Task is persisted.

use chrono::{Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::actions::RobotAction;
use crate::bbox::BBox;
use crate::classify::{KeywordEvent, StepClass, TASK_TAG, classify};
use crate::config::{ArgPosition, RecorderConfig, normalize_keyword};
use crate::error::{Result, TraceError};
use crate::history::{PromptStep, build_history};
use crate::observation::{DomSet, Observation};
use crate::persist::{save_trace, suite_dir, trace_file_stem};
use crate::stack::ExecutionStack;
use crate::step::{ActionArgs, Context, STATUS_PASS, SaveStatus, Step};
use crate::surface::Surface;

/// One listener notification, as stored in a recorded event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ListenerEvent {
    StartSuite {
        name: String,
    },
    StartTest {
        name: String,
    },
    EndTest {
        name: String,
        status: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    StartKeyword(KeywordEvent),
    EndKeyword(KeywordEvent),
}

/// Tag carried by Tasks opened with [`TraceRecorder::start_task`].
pub const MANUAL_TASK_TAG: &str = "manual_task";

/// Outcomes that make a finished action worthless as training data.
const FAILED_STATUSES: [&str; 3] = ["FAIL", "NOT SET", "NOT RUN"];

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

pub struct TraceRecorder<S: Surface> {
    config: RecorderConfig,
    surface: S,
    stack: ExecutionStack,
    next_id: u64,
    last_observation: Observation,
    last_pointer: (i32, i32),
    dom_set: DomSet,
    variables: HashMap<String, String>,
    suite_dir: Option<PathBuf>,
}

impl<S: Surface> TraceRecorder<S> {
    pub fn new(config: RecorderConfig, surface: S) -> Self {
        Self {
            config,
            surface,
            stack: ExecutionStack::new(),
            next_id: 0,
            last_observation: Observation::placeholder(),
            last_pointer: (0, 0),
            dom_set: DomSet::new(),
            variables: HashMap::new(),
            suite_dir: None,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn stack(&self) -> &ExecutionStack {
        &self.stack
    }

    pub fn last_observation(&self) -> &Observation {
        &self.last_observation
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn observe(&mut self) -> Result<Observation> {
        let screenshot = self.surface.capture_screenshot(None)?;
        let dom = self.surface.dom_snapshot()?;
        let dom = self.dom_set.add_dom(&dom);
        Ok(Observation::new(Utc::now(), screenshot, dom, self.last_pointer))
    }

    /// Hand the last observation to the stacked Tasks that have not recorded
    /// anything yet, so they start from the real state instead of a stale
    /// one. An Action on top of the stack is skipped.
    fn propagate_observation(&mut self) {
        let observation = self.last_observation.clone();
        let steps = self.stack.steps_mut();
        let skip_top = steps.last().is_some_and(Step::is_action);
        let stacked = steps.iter_mut().rev().skip(usize::from(skip_top));
        for step in stacked {
            if !step.is_task() || !step.children().is_empty() {
                break;
            }
            if let Some(context) = step.context.as_mut() {
                context.start_observation = observation.clone();
            }
        }
    }

    fn refresh_and_propagate(&mut self) -> Result<()> {
        self.last_observation = self.observe()?;
        self.propagate_observation();
        Ok(())
    }

    /// Replace `${name}` placeholders with the values set through
    /// [`set_variable`](Self::set_variable). Unknown names are left as-is.
    pub fn substitute_variables(&self, name: &str) -> String {
        VARIABLE
            .replace_all(name, |caps: &regex::Captures<'_>| match self.variables.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<String>) {
        let name = name.trim_start_matches("${").trim_end_matches('}');
        self.variables.insert(name.to_string(), value.into());
    }

    pub fn add_task_library<I, L>(&mut self, libraries: I)
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.config
            .task_libraries
            .extend(libraries.into_iter().map(Into::into));
    }

    // ========================= listener callbacks =========================

    /// Dispatch one notification. Returns the trace path when a scenario was
    /// persisted.
    pub fn handle(&mut self, event: &ListenerEvent) -> Result<Option<PathBuf>> {
        match event {
            ListenerEvent::StartSuite { name } => self.start_suite(name),
            ListenerEvent::StartTest { name } => {
                self.start_test(name);
            }
            ListenerEvent::EndTest { name, status, tags } => return self.end_test(name, status, tags),
            ListenerEvent::StartKeyword(keyword) => self.start_keyword(keyword)?,
            ListenerEvent::EndKeyword(keyword) => {
                self.after_keyword_run()?;
                self.end_keyword(keyword)?;
            }
        }
        Ok(None)
    }

    pub fn start_suite(&mut self, name: &str) {
        let dir = suite_dir(&self.config.output_dir, name, Local::now());
        info!(suite = name, dir = %dir.display(), "starting suite");
        self.suite_dir = Some(dir);
    }

    /// Open a scenario: a fresh stack whose root Task is `name`. A keyword
    /// already in progress (a scenario started from inside a keyword) is
    /// carried over on top of the new root.
    pub fn start_test(&mut self, name: &str) -> u64 {
        info!(test = name, "starting test");
        let id = self.allocate_id();
        let root = Step::task(id, name).with_context(Context::new(self.last_observation.clone()));

        let carried = self.stack.pop().ok();
        let dropped = self.stack.take();
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "discarding unfinished steps from the previous scenario");
        }
        self.stack.push(root);
        if let Some(step) = carried {
            self.stack.push(step);
        }
        id
    }

    /// Close the scenario and persist its root Task. Returns the binary trace
    /// path, or `None` when recording is disabled.
    pub fn end_test(&mut self, name: &str, status: &str, tags: &[String]) -> Result<Option<PathBuf>> {
        info!(test = name, status, "ending test");
        if !self.config.record {
            self.stack.take();
            return Ok(None);
        }

        let mut root = self.stack.pop()?;
        if !root.is_task() {
            return Err(TraceError::protocol(format!(
                "ending test '{name}': '{}' at the bottom of the stack is not a task",
                root.name
            )));
        }
        if root.children().is_empty() {
            warn!(test = name, "test with no steps");
        }
        let end = self.last_observation.clone();
        let context = root
            .context
            .get_or_insert_with(|| Context::new(end.clone()));
        context.end_observation = Some(end);
        context.status = status.to_string();

        let dir = self
            .suite_dir
            .clone()
            .unwrap_or_else(|| self.config.output_dir.clone());
        let with_json = self.config.all_json || tags.iter().any(|t| t.eq_ignore_ascii_case("json"));
        let stem = trace_file_stem(&root.name, Local::now());
        save_trace(&root, &dir, &stem, with_json).map(Some)
    }

    pub fn start_keyword(&mut self, event: &KeywordEvent) -> Result<()> {
        debug!(keyword = %event.kwname, "start keyword");
        let classification = classify(event, &self.config)?;

        let id = self.allocate_id();
        let mut step = match classification.class {
            StepClass::Task => Step::task(id, &event.kwname),
            StepClass::Action => Step::action(id, &event.kwname, ActionArgs::default()),
        };
        step.status = classification.status;
        step.tags = classification.tags;
        step.context = Some(Context::new(self.last_observation.clone()));

        if step.status == SaveStatus::NoRecord {
            self.stack.push(step);
            return Ok(());
        }

        if self.surface.is_open() {
            let first = self.last_observation.is_placeholder();
            self.last_observation = self.observe()?;
            if first {
                self.propagate_observation();
            }
        }
        if let Some(context) = step.context.as_mut() {
            context.start_observation = self.last_observation.clone();
        }
        step.name = self.substitute_variables(&step.name);

        if self.stack.is_empty() {
            info!(keyword = %step.name, "keyword outside a scenario, it will not be recorded");
        }
        let is_action = step.is_action();
        self.stack.push(step);

        if is_action {
            self.complete_arguments(&event.args)?;
        }
        Ok(())
    }

    pub fn end_keyword(&mut self, event: &KeywordEvent) -> Result<()> {
        debug!(keyword = %event.kwname, status = %event.status, "end keyword");
        if self.stack.is_empty() {
            warn!(keyword = %event.kwname, "execution stack is empty, skipping keyword");
            return Ok(());
        }
        let step = self.stack.pop()?;
        self.finish_step(step, &event.status)
    }

    fn finish_step(&mut self, mut step: Step, status: &str) -> Result<()> {
        if step.status == SaveStatus::NoRecord {
            if step.name.eq_ignore_ascii_case("sleep") && self.surface.is_open() {
                self.last_observation = self.observe()?;
            }
            debug!(step = %step.name, "not recording");
            return Ok(());
        }
        if step.is_action() && FAILED_STATUSES.contains(&status) {
            debug!(step = %step.name, status, "action did not pass, not recording");
            return Ok(());
        }
        if step.is_task() && step.tags.iter().any(|t| self.config.is_excluded_task_tag(t)) {
            debug!(step = %step.name, "task with exclude tag, not recording");
            return Ok(());
        }
        if self.stack.is_empty() {
            warn!(step = %step.name, "no scenario on the stack, not recording");
            return Ok(());
        }
        if step.is_task() && step.children().is_empty() {
            warn!(step = %step.name, "task without steps, not recording");
            return Ok(());
        }
        if step.status == SaveStatus::OnlySubsteps {
            debug!(step = %step.name, "only substeps are recorded");
            return Ok(());
        }
        if self.stack.peek_last()?.is_action() {
            debug!(step = %step.name, "nested inside another action, not recording");
            return Ok(());
        }

        if self.surface.is_open() {
            self.last_observation = self.observe()?;
        }
        let end = self.last_observation.clone();
        let context = step
            .context
            .get_or_insert_with(|| Context::new(end.clone()));
        context.end_observation = Some(end);
        context.status = status.to_string();

        info!(step = %step.name, id = step.id, "step recorded");
        self.stack.attach_to_parent(step)
    }

    /// Wait for the surface after a recorded action ran.
    pub fn after_keyword_run(&mut self) -> Result<()> {
        if !self.surface.is_open() {
            return Ok(());
        }
        let recorded_action = self
            .stack
            .peek_last()
            .is_ok_and(|s| s.is_action() && s.status != SaveStatus::NoRecord);
        if recorded_action {
            if self.config.wait_after_action_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.config.wait_after_action_ms));
            }
            self.surface.settle()?;
        }
        Ok(())
    }

    // ========================= argument completion =========================

    fn resolve(&mut self, locator: &str) -> Result<Option<(BBox, (i32, i32))>> {
        if locator.trim_start().starts_with("BBox") {
            let bbox = BBox::from_rf_string(locator)?;
            return Ok(Some((bbox, bbox.center())));
        }
        let resolved = self.surface.resolve_locator(locator)?;
        if resolved.is_none() {
            warn!(locator, "could not resolve locator");
        }
        Ok(resolved)
    }

    /// Fill the action on top of the stack with its locator, box and typed
    /// payload, inserting a scroll step when the target is out of view.
    pub fn complete_arguments(&mut self, args: &[String]) -> Result<()> {
        let name = self.stack.peek_last()?.name.clone();
        let normalized = normalize_keyword(&name);
        let typing = self.config.typing_position(&name);

        let payload_first = matches!(typing, Some(ArgPosition::Index(0) | ArgPosition::Rest(0)));
        // `Keyboard Input` and `Keyboard Key` act on the focused element
        let keyboard_only = typing.is_some() && normalized.starts_with("keyboard");
        let locator_first = normalized.contains("bbox")
            || (!normalized.contains("scroll") && !payload_first && !keyboard_only);

        let mut resolved = None;
        let mut selector = String::new();
        if locator_first {
            if let Some(locator) = args.first() {
                resolved = self.resolve(locator)?;
                if resolved.is_some() {
                    selector = locator.clone();
                }
            }
        }
        if let Some((_, pointer)) = resolved {
            self.last_pointer = pointer;
        }

        let top = self.stack.peek_last_mut()?;
        let action_args = top
            .args_mut()
            .ok_or_else(|| TraceError::protocol(format!("'{name}' on top of the stack is not an action")))?;
        if let Some((bbox, _)) = resolved {
            action_args.bbox = Some(bbox);
            action_args.selector = selector.clone();
        }
        if let Some(position) = typing {
            action_args.input_string = position.extract(args);
        }

        if let Some((bbox, _)) = resolved {
            if !normalized.contains("scroll") && self.surface.is_open() {
                match self.auto_scroll(&selector, bbox) {
                    Err(TraceError::Surface(e)) => warn!(step = %name, error = %e, "auto-scroll failed"),
                    other => other?,
                }
            }
        }
        Ok(())
    }

    /// Record the scrolling a human would have done before acting on an
    /// element outside the viewport.
    fn auto_scroll(&mut self, selector: &str, mut bbox: BBox) -> Result<()> {
        let viewport = self.surface.viewport()?;
        let mut scrolled = false;

        if bbox.y < 0 {
            self.surface.scroll_to_top()?;
            self.refresh_and_propagate()?;
            match self.resolve(selector)? {
                Some((fresh, _)) => bbox = fresh,
                None => return Ok(()),
            }
            scrolled = true;
        }

        if bbox.bottom() > viewport.height {
            let before = self.last_observation.clone();
            self.surface.scroll_into_view(selector)?;
            self.last_observation = self.observe()?;
            self.insert_scroll_step(selector, bbox, before)?;
            scrolled = true;
        }

        if scrolled {
            if let Some((fresh, pointer)) = self.resolve(selector)? {
                self.last_pointer = pointer;
                if let Some(args) = self.stack.peek_last_mut()?.args_mut() {
                    args.bbox = Some(fresh);
                }
            }
            let start = self.last_observation.clone();
            if let Some(context) = self.stack.peek_last_mut()?.context.as_mut() {
                context.start_observation = start;
            }
        }
        Ok(())
    }

    fn insert_scroll_step(&mut self, selector: &str, bbox: BBox, before: Observation) -> Result<()> {
        let parent_is_task = self
            .stack
            .steps()
            .iter()
            .rev()
            .nth(1)
            .is_some_and(Step::is_task);
        if !parent_is_task {
            debug!(selector, "action is nested, scroll step not recorded");
            return Ok(());
        }

        let mut context = Context::new(before);
        context.end_observation = Some(self.last_observation.clone());
        context.status = STATUS_PASS.to_string();
        let id = self.allocate_id();
        let scroll = Step::action(
            id,
            RobotAction::ScrollDown.name(),
            ActionArgs::new(selector, "", Some(bbox)),
        )
        .with_tags(self.config.action_tags.first().cloned())
        .with_context(context);

        self.stack
            .remove_last_action_for_replacement()?
            .substitute(&mut self.stack, vec![scroll])?
            .reattach(&mut self.stack, None);
        debug!(selector, "scroll step recorded before action");
        Ok(())
    }

    // ========================= recorder keywords =========================

    /// Open a Task by hand, outside the framework's own keyword structure.
    pub fn start_task(&mut self, name: &str) -> Result<u64> {
        if self.surface.is_open() {
            self.last_observation = self.observe()?;
        }
        let id = self.allocate_id();
        let task = Step::task(id, self.substitute_variables(name))
            .with_tags([TASK_TAG, MANUAL_TASK_TAG])
            .with_context(Context::new(self.last_observation.clone()));
        info!(task = name, id, "manual task started");
        self.stack.push(task);
        Ok(id)
    }

    /// Close the Task opened by [`start_task`](Self::start_task).
    pub fn end_task(&mut self, status: &str) -> Result<()> {
        let top = self.stack.peek_last()?;
        if !top.is_task() || !top.has_tag(MANUAL_TASK_TAG) {
            return Err(TraceError::protocol(format!(
                "end task called while '{}' is on top of the stack; start a task first",
                top.name
            )));
        }
        let task = self.stack.pop()?;
        info!(task = %task.name, "manual task ended");
        self.finish_step(task, status)
    }

    /// Forget the last step recorded in the innermost open Task.
    pub fn remove_last_task(&mut self) -> bool {
        let (removed, message) = self.stack.remove_last_step_from_nearest_task();
        if removed {
            info!("{message}");
        } else {
            warn!("{message}");
        }
        removed
    }

    /// Record lower-level actions in place of the semantic action on top of
    /// the stack, e.g. `Type Text` as a click followed by keyboard input. The
    /// original stays on the stack as `NoRecord` so its end event is ignored.
    /// Call it after the substitute interactions ran.
    pub fn substitute_current_action(&mut self, substitutes: Vec<(RobotAction, ActionArgs)>) -> Result<()> {
        let pending = self.stack.remove_last_action_for_replacement()?;
        let start = pending
            .action()
            .start_observation()
            .cloned()
            .unwrap_or_else(|| self.last_observation.clone());
        if self.surface.is_open() {
            self.last_observation = self.observe()?;
        }

        let end = self.last_observation.clone();
        let tag = self.config.action_tags.first().cloned();
        let steps = substitutes
            .into_iter()
            .map(|(action, args)| {
                let mut context = Context::new(start.clone());
                context.end_observation = Some(end.clone());
                context.status = STATUS_PASS.to_string();
                Step::action(self.allocate_id(), action.name(), args)
                    .with_tags(tag.clone())
                    .with_context(context)
            })
            .collect();

        pending
            .substitute(&mut self.stack, steps)?
            .reattach(&mut self.stack, Some(SaveStatus::NoRecord));
        Ok(())
    }

    /// History for the step about to be taken: the root plus every open Task
    /// on the stack, targeting the last step recorded in the innermost one
    /// (or that Task itself when it is still empty).
    pub fn current_history(&self, include_task_names: bool, ignore_scroll_entries: bool) -> Result<Vec<PromptStep>> {
        let mut open: Vec<Step> = self
            .stack
            .steps()
            .iter()
            .filter(|s| s.is_task() && matches!(s.status, SaveStatus::ToRecord | SaveStatus::ConfirmRecord))
            .cloned()
            .collect();
        let mut snapshot = open
            .pop()
            .ok_or_else(|| TraceError::protocol("no open task to build a history for"))?;
        let target = snapshot.children().last().map_or(snapshot.id, |s| s.id);
        while let Some(mut parent) = open.pop() {
            parent.add_step(snapshot)?;
            snapshot = parent;
        }
        build_history(&snapshot, target, include_task_names, ignore_scroll_entries)
    }
}
