//! Instruction histories: what led up to a step, as the prediction model
//! sees it.
//!
//! [`history_for`] returns a nested [`HistoryNode`] mirroring the Task
//! hierarchy around the target. [`candidates`] flattens it into prompt
//! variants, one per enclosing level, each ending with the target.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::step::{ActionArgs, SaveStatus, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Task,
    Action,
}

impl NodeKind {
    fn of(step: &Step) -> Self {
        if step.is_task() {
            NodeKind::Task
        } else {
            NodeKind::Action
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryNode {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub args: Option<ActionArgs>,
    pub children: Vec<HistoryNode>,
}

impl HistoryNode {
    fn shallow(step: &Step) -> Self {
        Self {
            id: step.id,
            name: step.name.clone(),
            kind: NodeKind::of(step),
            args: step.args().cloned(),
            children: Vec::new(),
        }
    }

    fn subtree(step: &Step) -> Self {
        let mut node = Self::shallow(step);
        node.children = recorded(step).map(Self::subtree).collect();
        node
    }

    fn prompt(&self) -> PromptStep {
        PromptStep {
            name: self.name.clone(),
            args: self.args.clone(),
            kind: self.kind,
        }
    }

    fn flatten_into(&self, out: &mut Vec<PromptStep>) {
        out.push(self.prompt());
        for child in &self.children {
            child.flatten_into(out);
        }
    }

    /// Pre-order flattening of this node's subtree.
    pub fn flatten(&self) -> Vec<PromptStep> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }
}

/// One entry of an instruction history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ActionArgs>,
    #[serde(rename = "type")]
    pub kind: NodeKind,
}

impl PromptStep {
    /// Label teaching the model that the enclosing task is finished.
    pub fn end() -> Self {
        Self {
            name: "end".to_string(),
            args: None,
            kind: NodeKind::Action,
        }
    }

    pub fn is_scroll(&self) -> bool {
        self.name.to_lowercase().contains("scroll")
    }
}

fn recorded(step: &Step) -> impl Iterator<Item = &Step> {
    step.children()
        .iter()
        .filter(|child| child.status != SaveStatus::NoRecord)
}

/// Build the history leading up to `step_id` inside `root`.
///
/// With `include_task_names` every enclosing level down from the root is
/// unfolded. Without it the history stays local: a Task target yields only
/// itself, an Action target yields its parent Task with the siblings up to
/// and including the target.
pub fn history_for(root: &Step, step_id: u64, include_task_names: bool) -> Result<HistoryNode> {
    let mut chain = root.parent_ids(step_id)?;
    chain.push(step_id);

    if !include_task_names {
        let target = root.find_step(step_id)?;
        let keep = if target.is_task() { 1 } else { 2 };
        chain.drain(..chain.len().saturating_sub(keep));
    }

    expand(root, &chain)
}

/// Unfold `chain[0]`: earlier recorded siblings of the next chain element
/// come with their whole subtree, the chain element itself is expanded
/// recursively whatever its status.
fn expand(root: &Step, chain: &[u64]) -> Result<HistoryNode> {
    let step = root.find_step(chain[0])?;
    let mut node = HistoryNode::shallow(step);
    if let Some(&next) = chain.get(1) {
        for sibling in step.children() {
            if sibling.id == next {
                node.children.push(expand(root, &chain[1..])?);
                break;
            }
            if sibling.status != SaveStatus::NoRecord {
                node.children.push(HistoryNode::subtree(sibling));
            }
        }
    }
    Ok(node)
}

/// Prompt variants for a history, innermost enclosing level first. Each
/// variant is the pre-order flattening of one level and ends with the
/// target; the last one is the longest.
pub fn candidates(history: &HistoryNode) -> Vec<Vec<PromptStep>> {
    let mut levels = vec![history];
    let mut current = history;
    while let Some(last) = current.children.last() {
        levels.push(last);
        current = last;
    }
    let target = current;

    let mut prompts = Vec::new();
    if target.kind == NodeKind::Task {
        prompts.push(vec![target.prompt()]);
    }
    prompts.extend(
        levels[..levels.len() - 1]
            .iter()
            .rev()
            .map(|level| level.flatten()),
    );
    prompts
}

/// The longest candidate, what a single inference call sends.
pub fn longest_candidate(history: &HistoryNode) -> Vec<PromptStep> {
    candidates(history)
        .into_iter()
        .fold(Vec::new(), |best, prompt| if prompt.len() > best.len() { prompt } else { best })
}

/// Drop entries whose name mentions scrolling.
pub fn without_scrolls(prompt: Vec<PromptStep>) -> Vec<PromptStep> {
    prompt.into_iter().filter(|p| !p.is_scroll()).collect()
}

/// History prompt for one step, ready for the inference service.
pub fn build_history(
    root: &Step,
    step_id: u64,
    include_task_names: bool,
    ignore_scroll_entries: bool,
) -> Result<Vec<PromptStep>> {
    let history = history_for(root, step_id, include_task_names)?;
    let prompt = longest_candidate(&history);
    Ok(if ignore_scroll_entries {
        without_scrolls(prompt)
    } else {
        prompt
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::BBox;

    fn click(id: u64, bbox: BBox) -> Step {
        Step::action(id, "click_at_bbox", ActionArgs::new("", "", Some(bbox)))
    }

    fn names(prompt: &[PromptStep]) -> Vec<&str> {
        prompt.iter().map(|p| p.name.as_str()).collect()
    }

    /// Shop(0) -> [Search(1) -> [Filters(2) -> [click(3)], click(4)], click(5)]
    fn nested() -> Step {
        let filters = Step::task(2, "Filters").with_children(vec![click(3, BBox::new(1, 1, 1, 1))]);
        let search = Step::task(1, "Search").with_children(vec![filters, click(4, BBox::new(2, 2, 2, 2))]);
        Step::task(0, "Shop").with_children(vec![search, click(5, BBox::new(3, 3, 3, 3))])
    }

    #[test]
    fn local_history_stays_in_parent() {
        let root = nested();
        let history = history_for(&root, 4, false).unwrap();
        assert_eq!(history.id, 1);
        let ids: Vec<u64> = history.children.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(history.children[0].children[0].id, 3);
    }

    #[test]
    fn local_history_of_task_is_itself() {
        let root = nested();
        let history = history_for(&root, 2, false).unwrap();
        assert_eq!(history.id, 2);
        assert!(history.children.is_empty());
        assert_eq!(names(&candidates(&history)[0]), vec!["Filters"]);
    }

    #[test]
    fn candidates_end_with_the_target() {
        let root = nested();
        let history = history_for(&root, 3, true).unwrap();
        let prompts = candidates(&history);
        assert_eq!(prompts.len(), 3);
        assert_eq!(names(&prompts[0]), vec!["Filters", "click_at_bbox"]);
        assert_eq!(names(&prompts[1]), vec!["Search", "Filters", "click_at_bbox"]);
        assert_eq!(names(&prompts[2]), vec!["Shop", "Search", "Filters", "click_at_bbox"]);
        assert!(prompts.iter().all(|p| p.last().map(|s| s.kind) == Some(NodeKind::Action)));
    }

    #[test]
    fn task_target_gets_a_single_entry_candidate_first() {
        let root = nested();
        let history = history_for(&root, 2, true).unwrap();
        let prompts = candidates(&history);
        assert_eq!(names(&prompts[0]), vec!["Filters"]);
        assert_eq!(names(prompts.last().unwrap()), vec!["Shop", "Search", "Filters"]);
    }

    #[test]
    fn single_inference_uses_the_longest_candidate() {
        let root = nested();
        let prompt = build_history(&root, 5, true, false).unwrap();
        assert_eq!(
            names(&prompt),
            vec!["Shop", "Search", "Filters", "click_at_bbox", "click_at_bbox", "click_at_bbox"]
        );
        assert_eq!(prompt.last().unwrap().args.as_ref().unwrap().bbox, Some(BBox::new(3, 3, 3, 3)));
    }

    #[test]
    fn scroll_entries_can_be_dropped() {
        let scroll = Step::action(2, "Scroll Down", ActionArgs::default());
        let root = Step::task(0, "Read").with_children(vec![scroll, click(3, BBox::new(0, 0, 1, 1))]);
        let prompt = build_history(&root, 3, false, true).unwrap();
        assert_eq!(names(&prompt), vec!["Read", "click_at_bbox"]);
    }

    #[test]
    fn target_below_an_unrecorded_task_is_still_the_target() {
        let hidden = Step::task(1, "Hidden")
            .with_status(SaveStatus::NoRecord)
            .with_children(vec![Step::action(2, "click_inside", ActionArgs::default())]);
        let root = Step::task(0, "Root").with_children(vec![hidden, Step::action(3, "click_after", ActionArgs::default())]);

        let prompt = build_history(&root, 2, true, false).unwrap();
        assert_eq!(names(&prompt), vec!["Root", "Hidden", "click_inside"]);

        // unrecorded siblings stay out of other histories
        let after = build_history(&root, 3, true, false).unwrap();
        assert_eq!(names(&after), vec!["Root", "click_after"]);
    }

    #[test]
    fn unknown_step_is_an_error() {
        assert!(history_for(&nested(), 99, true).is_err());
    }
}
