//! JSONL input and output of the `dispatch` command.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use infergate_runtime::{DispatchOutcome, DispatchReport, WorkUnit};

/// One input row: `{"recordId": "...", "modelInput": {"inputText": "..."}}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRow {
    pub record_id: String,
    pub model_input: Value,
}

/// One output row per successful unit.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRow {
    pub record_id: String,
    pub input_text: String,
    pub embeddings: Value,
}

/// Parsed input: the units to dispatch plus each unit's input text, for the output rows.
#[derive(Debug)]
pub struct Batch {
    pub units: Vec<WorkUnit>,
    pub input_text: HashMap<String, String>,
}

/// Parse input rows. `dimensions` is added to each `modelInput` that does not set its own.
pub fn read_rows(reader: impl BufRead, dimensions: u32) -> Result<Batch> {
    let mut units = Vec::new();
    let mut input_text = HashMap::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut row: InputRow = serde_json::from_str(&line)
            .with_context(|| format!("parsing line {}", index + 1))?;
        let Some(text) = row.model_input.get("inputText").and_then(Value::as_str) else {
            bail!("line {}: modelInput.inputText is missing", index + 1);
        };
        input_text.insert(row.record_id.clone(), text.to_string());
        if let Value::Object(fields) = &mut row.model_input {
            fields
                .entry("dimensions")
                .or_insert_with(|| Value::from(dimensions));
        }
        units.push(WorkUnit::new(row.record_id, row.model_input));
    }
    Ok(Batch { units, input_text })
}

/// Write one row per success; returns the number written.
pub fn write_results(
    mut writer: impl Write,
    report: &DispatchReport,
    input_text: &HashMap<String, String>,
) -> Result<usize> {
    let mut written = 0;
    for result in &report.results {
        let DispatchOutcome::Success(payload) = &result.outcome else {
            continue;
        };
        let row = OutputRow {
            record_id: result.unit_id.clone(),
            input_text: input_text.get(&result.unit_id).cloned().unwrap_or_default(),
            embeddings: payload.get("embedding").cloned().unwrap_or(Value::Null),
        };
        serde_json::to_writer(&mut writer, &row)?;
        writer.write_all(b"\n")?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}
