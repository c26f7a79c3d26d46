//! Output extraction from per-stage JSON-lines logs.

use super::planner::{ExecutionStage, StageKind};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

#[allow(clippy::unwrap_used)]
static RECORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"^\{"(.*?)"\}$"#).unwrap());

/// One line of a stage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: String,
    pub msg: String,
}

impl LogLine {
    pub fn info(msg: &str) -> Self {
        Self {
            level: "info".to_string(),
            msg: msg.to_string(),
        }
    }

    pub fn error(msg: &str) -> Self {
        Self {
            level: "error".to_string(),
            msg: msg.to_string(),
        }
    }
}

/// Split `key = value` at the first `=`, trimming both sides.
pub fn find_pair(s: &str) -> Option<(String, String)> {
    let (key, value) = s.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

/// Messages of a log file. Lines that are not JSON records are taken verbatim.
pub fn log_messages(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| match serde_json::from_str::<LogLine>(line) {
            Ok(record) => record.msg,
            Err(_) => line.to_string(),
        })
        .collect()
}

/// Values for the stage's declared outputs found in its log. Later lines win.
pub fn extract_outputs(stage: &ExecutionStage, content: &str) -> IndexMap<String, String> {
    let messages = log_messages(content);
    match stage.kind {
        StageKind::Command => extract_records(stage, &messages),
        StageKind::DeclarativeInfra => extract_stack_outputs(stage, &messages),
    }
}

/// `{"name=value"}` records echoed by command stages.
fn extract_records(stage: &ExecutionStage, messages: &[String]) -> IndexMap<String, String> {
    let mut found = IndexMap::new();
    for msg in messages {
        let Some(caps) = RECORD.captures(msg.trim()) else {
            continue;
        };
        let Some((name, value)) = find_pair(&caps[1]) else {
            continue;
        };
        if stage.outputs.iter().any(|o| *o == name) {
            found.insert(name, value);
        }
    }
    found
}

/// `Stack.OutputKey = value` lines printed by the deploy tool.
fn extract_stack_outputs(stage: &ExecutionStage, messages: &[String]) -> IndexMap<String, String> {
    let mut found = IndexMap::new();
    let prefix = format!("{}.", stage.stack_name);
    for name in &stage.outputs {
        let pattern = format!(
            r"^{}\w*{}\w*\s*=",
            regex::escape(&prefix),
            regex::escape(name)
        );
        let re = match Regex::new(&pattern) {
            Ok(re) => re,
            Err(e) => {
                tracing::error!(stage = %stage.name, output = %name, error = %e, "bad output pattern");
                continue;
            }
        };
        for msg in messages {
            let line = msg.trim();
            if !re.is_match(line) {
                continue;
            }
            if let Some((_, value)) = find_pair(&line[prefix.len()..]) {
                found.insert(name.clone(), value);
            }
        }
    }
    found
}
