use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Result;
use crate::step::Step;

pub const TRACE_EXTENSION: &str = "trace";
pub const JSON_EXTENSION: &str = "json";

/// Keep file names portable whatever the scenario is called.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// `<scenario>_<YYYY-MM-DD_HH-MM-SS>`
pub fn trace_file_stem(scenario: &str, at: DateTime<Local>) -> String {
    format!("{}_{}", sanitize(scenario), at.format("%Y-%m-%d_%H-%M-%S"))
}

/// `<output_dir>/<suite>_<YYYY-MM-DD_HH-MM>`
pub fn suite_dir(output_dir: &Path, suite: &str, at: DateTime<Local>) -> PathBuf {
    output_dir.join(format!("{}_{}", sanitize(suite), at.format("%Y-%m-%d_%H-%M")))
}

/// Persist a finished root step as `<stem>.trace` and, when asked, a pretty
/// JSON mirror next to it. Returns the binary path.
pub fn save_trace(root: &Step, dir: &Path, stem: &str, with_json: bool) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let trace_path = dir.join(format!("{stem}.{TRACE_EXTENSION}"));
    let bytes = postcard::to_stdvec(root)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&trace_path)?;
    file.write_all(&bytes)?;
    info!(path = %trace_path.display(), steps = root.all_steps().len(), "trace saved");

    if with_json {
        let json_path = dir.join(format!("{stem}.{JSON_EXTENSION}"));
        let mut writer = BufWriter::new(std::fs::File::create(&json_path)?);
        serde_json::to_writer_pretty(&mut writer, root)?;
        writer.flush()?;
        debug!(path = %json_path.display(), "json mirror saved");
    }

    Ok(trace_path)
}

/// Decode a trace, choosing the format from the file extension.
pub fn load_trace(path: &Path) -> Result<Step> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(JSON_EXTENSION));
    if is_json {
        let reader = BufReader::new(std::fs::File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    } else {
        let bytes = std::fs::read(path)?;
        Ok(postcard::from_bytes(&bytes)?)
    }
}

pub fn is_trace_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == TRACE_EXTENSION || ext == JSON_EXTENSION)
}
