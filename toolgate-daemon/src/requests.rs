// ABOUTME: Reads enqueue requests from a JSON-lines file.
// ABOUTME: Blank lines and lines starting with '#' are skipped.

use std::path::Path;

use anyhow::{Context, Result};
use toolgate::prelude::EnqueueRequest;

pub fn load(path: &Path) -> Result<Vec<EnqueueRequest>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading requests from {}", path.display()))?;
    parse(&data)
}

pub fn parse(data: &str) -> Result<Vec<EnqueueRequest>> {
    let mut requests = Vec::new();
    for (idx, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let request: EnqueueRequest =
            serde_json::from_str(line).with_context(|| format!("line {}", idx + 1))?;
        requests.push(request);
    }
    Ok(requests)
}
