//! Diagnostic comparison of produced goal statistics against a reference JSON
//! document. Results only annotate the request log.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use super::{artifacts, pipeline::RequestLog};

/// Properties that legitimately differ between runs.
const IGNORED_PROPERTIES: [&str; 3] = ["proctm", "thumburl", "graphurl"];
const NUMERIC_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    ExactMatch,
    MinorIssues,
    Critical,
}

impl Verdict {
    pub fn message(self) -> &'static str {
        match self {
            Verdict::ExactMatch => "Success: Exact match!",
            Verdict::MinorIssues => "Error: Minor issues",
            Verdict::Critical => "Error: CRITICAL!",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Comparison {
    /// No hard mismatch and no numeric drift beyond tolerance.
    pub valid: bool,
    /// At least one numeric difference was seen.
    pub numeric: bool,
    /// At least one summary string differed.
    pub summary: bool,
    pub details: Vec<String>,
}

impl Comparison {
    pub fn verdict(&self) -> Verdict {
        match (self.valid, self.numeric || self.summary) {
            (true, false) => Verdict::ExactMatch,
            (true, true) => Verdict::MinorIssues,
            (false, _) => Verdict::Critical,
        }
    }
}

/// Compare `stats` against `reference`, property by property of the reference.
pub fn compare_stats(stats: &Map<String, Value>, reference: &Map<String, Value>) -> Comparison {
    if let Some(error) = stats.get("error").and_then(Value::as_str)
        && !error.is_empty()
    {
        return Comparison {
            valid: false,
            details: vec![format!("Processing error: {error}")],
            ..Comparison::default()
        };
    }

    let mut outcome = Comparison {
        valid: true,
        ..Comparison::default()
    };

    for (prop, expected) in reference {
        if IGNORED_PROPERTIES.contains(&prop.as_str()) {
            continue;
        }
        let Some(actual) = stats.get(prop) else {
            outcome
                .details
                .push(format!("Prp {prop} is missing from the output"));
            outcome.valid = false;
            continue;
        };

        if let Value::Array(items) = actual {
            if !arrays_equal(items, expected) {
                outcome.details.push(format!(
                    "Arr {prop} differs:\n py:{}\n js:{}",
                    display(expected),
                    display(actual)
                ));
                outcome.valid = false;
            }
            continue;
        }

        if actual == expected {
            continue;
        }

        if let (Some(a), Some(b)) = (numeric(actual), numeric(expected)) {
            outcome.details.push(format!(
                "Numeric value {prop} differs:\n py:{}\n js:{}",
                display(expected),
                display(actual)
            ));
            outcome.numeric = true;
            if (a - b).abs() > NUMERIC_TOLERANCE {
                outcome.valid = false;
            }
        } else if prop.ends_with("sum") {
            outcome.details.push(format!(
                "Summary string {prop} differs:\n py:{}\n js:{}",
                display(expected),
                display(actual)
            ));
            outcome.summary = true;
        } else {
            outcome.details.push(format!(
                "String {prop} differs:\n py:{}\n js:{}",
                display(expected),
                display(actual)
            ));
            outcome.valid = false;
        }
    }

    outcome
}

/// Compare against the reference file at `path`, annotating `log`.
///
/// A missing or unreadable reference is logged and otherwise ignored.
pub async fn compare_with_reference(
    stats: &Map<String, Value>,
    reference_path: &Path,
    log: &mut RequestLog,
) -> Option<Verdict> {
    if !artifacts::is_file(reference_path).await {
        log.line(format!(
            " Comparing to reference: Could not find file {}",
            reference_path.display()
        ));
        return None;
    }

    let reference = match tokio::fs::read(reference_path).await {
        Ok(bytes) => serde_json::from_slice::<Map<String, Value>>(&bytes)
            .map_err(|err| format!("could not parse {}: {err}", reference_path.display())),
        Err(err) => Err(format!("could not read {}: {err}", reference_path.display())),
    };
    let reference = match reference {
        Ok(reference) => reference,
        Err(message) => {
            log.line(format!(" Comparing to reference: {message}"));
            return None;
        }
    };

    let comparison = compare_stats(stats, &reference);
    let verdict = comparison.verdict();
    log.line(format!(" Comparing to reference: --** {}", verdict.message()));
    if verdict != Verdict::ExactMatch {
        for detail in &comparison.details {
            log.line(format!("   {detail}"));
        }
        log.append("------------------\n");
    }
    debug!(
        target = "application::compare",
        op = "compare::reference",
        path = %reference_path.display(),
        verdict = verdict.message(),
        differences = comparison.details.len(),
        "Compared statistics against reference"
    );
    Some(verdict)
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn arrays_equal(actual: &[Value], expected: &Value) -> bool {
    let Value::Array(expected) = expected else {
        return false;
    };
    actual.len() == expected.len()
        && actual.iter().zip(expected).all(|(a, b)| match a {
            Value::Array(inner) => arrays_equal(inner, b),
            _ => a == b || matches!((numeric(a), numeric(b)), (Some(x), Some(y)) if x == y),
        })
}

fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
