//! Flattening recorded traces into training examples.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::history::{PromptStep, candidates, history_for, longest_candidate, without_scrolls};
use crate::persist::{JSON_EXTENSION, TRACE_EXTENSION, is_trace_file, load_trace};
use crate::step::{SaveStatus, Step};

/// (instruction history, screenshot, next action) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub instruction_history: Vec<PromptStep>,
    /// Base64 PNG.
    pub screenshot: String,
    pub action: PromptStep,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenOptions {
    pub include_task_names: bool,
    pub ignore_scroll_entries: bool,
}

impl FlattenOptions {
    fn history(&self, prompt: Vec<PromptStep>) -> Vec<PromptStep> {
        if self.ignore_scroll_entries {
            without_scrolls(prompt)
        } else {
            prompt
        }
    }
}

/// Every training example a recorded tree yields.
///
/// Each recorded Action gives one example per history candidate, labelled
/// with the action itself and showing its start screenshot. The last Action
/// of a Task also gives an `end` example on its end screenshot. With task
/// names included, every finished Task gives `end` examples too.
pub fn flatten_examples(root: &Step, options: FlattenOptions) -> Result<Vec<TrainingExample>> {
    let mut examples = Vec::new();
    let hidden = unrecorded_ids(root);

    for step in root.all_steps() {
        if hidden.contains(&step.id) {
            continue;
        }
        let history = history_for(root, step.id, options.include_task_names)?;
        let prompts = candidates(&history);

        let start_screen = step
            .start_observation()
            .map(|o| o.screenshot.to_string())
            .unwrap_or_default();
        let end_screen = step
            .end_observation()
            .map(|o| o.screenshot.to_string())
            .unwrap_or_default();
        if start_screen.is_empty() || end_screen.is_empty() {
            warn!(step = step.id, name = %step.name, "missing screenshot");
        }

        if step.is_action() {
            for mut prompt in prompts {
                let Some(action) = prompt.pop() else { continue };
                examples.push(TrainingExample {
                    instruction_history: options.history(prompt),
                    screenshot: start_screen.clone(),
                    action,
                });
            }

            let parent = root.parent_of(step.id)?;
            let last_recorded = parent
                .children()
                .iter()
                .rev()
                .find(|child| child.status != SaveStatus::NoRecord);
            if last_recorded.map(|last| last.id) == Some(step.id) {
                examples.push(TrainingExample {
                    instruction_history: options.history(longest_candidate(&history)),
                    screenshot: end_screen,
                    action: PromptStep::end(),
                });
            }
        } else if options.include_task_names && step.end_observation().is_some() {
            for prompt in prompts {
                examples.push(TrainingExample {
                    instruction_history: options.history(prompt),
                    screenshot: end_screen.clone(),
                    action: PromptStep::end(),
                });
            }
        }
    }

    Ok(examples)
}

/// Steps that are unrecorded themselves or sit below an unrecorded step.
fn unrecorded_ids(root: &Step) -> HashSet<u64> {
    root.all_steps()
        .into_iter()
        .filter(|step| step.status == SaveStatus::NoRecord)
        .flat_map(Step::all_steps)
        .map(|step| step.id)
        .collect()
}

/// Write one JSON object per line.
pub fn write_jsonl<W: Write>(examples: &[TrainingExample], mut writer: W) -> Result<()> {
    for example in examples {
        serde_json::to_writer(&mut writer, example)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Trace files below `dir`, in a stable order. A JSON mirror is skipped when
/// its binary trace sits next to it.
pub fn find_traces(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_trace_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    paths.retain(|path| {
        !path.extension().is_some_and(|ext| ext == JSON_EXTENSION)
            || !path.with_extension(TRACE_EXTENSION).exists()
    });
    paths.sort();
    paths
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetSummary {
    pub traces: usize,
    pub examples: usize,
}

/// Flatten every trace below `dir` into `writer` as JSON lines.
pub fn build_dataset<W: Write>(dir: &Path, options: FlattenOptions, mut writer: W) -> Result<DatasetSummary> {
    let mut summary = DatasetSummary::default();
    for path in find_traces(dir) {
        let root = load_trace(&path)?;
        let examples = flatten_examples(&root, options)?;
        info!(path = %path.display(), examples = examples.len(), "flattened trace");
        write_jsonl(&examples, &mut writer)?;
        summary.traces += 1;
        summary.examples += examples.len();
    }
    Ok(summary)
}
