//! Call-depth stack mirroring the framework's nested keyword invocations.

use crate::error::{Result, TraceError};
use crate::step::{SaveStatus, Step};

/// Steps currently executing, bottom (root Task) first.
#[derive(Debug, Default, Clone)]
pub struct ExecutionStack {
    steps: Vec<Step>,
}

impl ExecutionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn pop(&mut self) -> Result<Step> {
        self.steps
            .pop()
            .ok_or_else(|| TraceError::protocol("pop on an empty execution stack"))
    }

    pub fn peek_last(&self) -> Result<&Step> {
        self.steps
            .last()
            .ok_or_else(|| TraceError::protocol("peek on an empty execution stack"))
    }

    pub fn peek_last_mut(&mut self) -> Result<&mut Step> {
        self.steps
            .last_mut()
            .ok_or_else(|| TraceError::protocol("peek on an empty execution stack"))
    }

    pub fn root(&self) -> Result<&Step> {
        self.steps
            .first()
            .ok_or_else(|| TraceError::protocol("no root on an empty execution stack"))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Bottom-first view of the stack.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    /// Drain the whole stack.
    pub fn take(&mut self) -> Vec<Step> {
        std::mem::take(&mut self.steps)
    }

    /// Append `step` to the nearest Task, walking top-down, whose status is
    /// not `OnlySubsteps`.
    ///
    /// The top of the stack must be a Task: anything else means the popped
    /// step and its parent are out of sync with the event stream.
    pub fn attach_to_parent(&mut self, step: Step) -> Result<()> {
        let top = self.peek_last()?;
        if !top.is_task() {
            return Err(TraceError::protocol(format!(
                "cannot attach '{}' to '{}': top of stack is not a task",
                step.name, top.name
            )));
        }

        let parent = self
            .steps
            .iter_mut()
            .rev()
            .find(|s| s.is_task() && s.status != SaveStatus::OnlySubsteps)
            .ok_or_else(|| {
                TraceError::protocol(format!("no recording task on the stack to attach '{}'", step.name))
            })?;
        parent.add_step(step)
    }

    /// Pop the top step, which must be an Action, so substitute steps can be
    /// recorded in its place.
    pub fn remove_last_action_for_replacement(&mut self) -> Result<PendingReplacement> {
        let top = self.peek_last()?;
        if !top.is_action() {
            return Err(TraceError::protocol(format!(
                "'{}' on top of the stack is not an action",
                top.name
            )));
        }
        let action = self.pop()?;
        Ok(PendingReplacement { action })
    }

    /// Drop the last recorded child of the topmost Task. Never fails; the
    /// outcome is reported through the flag and message.
    pub fn remove_last_step_from_nearest_task(&mut self) -> (bool, String) {
        let Some(task) = self.steps.iter_mut().rev().find(|s| s.is_task()) else {
            return (false, "no task on the execution stack".to_string());
        };
        let task_name = task.name.clone();
        match task.children_mut().and_then(Vec::pop) {
            Some(removed) => (
                true,
                format!("removed '{}' from task '{}'", removed.name, task_name),
            ),
            None => (false, format!("task '{task_name}' has no recorded steps")),
        }
    }
}

/// An Action taken off the stack, waiting for its substitutes.
#[derive(Debug)]
#[must_use = "the removed action is lost unless it is substituted and reattached"]
pub struct PendingReplacement {
    action: Step,
}

impl PendingReplacement {
    pub fn action(&self) -> &Step {
        &self.action
    }

    pub fn action_mut(&mut self) -> &mut Step {
        &mut self.action
    }

    /// Attach the substitute steps, in order, to the Task now on top.
    pub fn substitute(self, stack: &mut ExecutionStack, substitutes: Vec<Step>) -> Result<Substituted> {
        for step in substitutes {
            stack.attach_to_parent(step)?;
        }
        Ok(Substituted {
            action: self.action,
        })
    }
}

#[derive(Debug)]
#[must_use = "the removed action is lost unless it is reattached"]
pub struct Substituted {
    action: Step,
}

impl Substituted {
    /// Push the original action back on the stack, optionally with a new
    /// status, so its end event still finds it.
    pub fn reattach(self, stack: &mut ExecutionStack, status: Option<SaveStatus>) -> Reattached {
        let mut action = self.action;
        if let Some(status) = status {
            action.status = status;
        }
        let reattached = Reattached {
            id: action.id,
            status: action.status,
        };
        stack.push(action);
        reattached
    }
}

/// Final state of a replacement: the action is back on top of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reattached {
    pub id: u64,
    pub status: SaveStatus,
}
