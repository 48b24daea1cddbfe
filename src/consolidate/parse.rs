//! Findings extraction from raw pass responses
//!
//! Model output is treated as hostile JSON: fences stripped, common issues
//! repaired, and individual objects salvaged when the whole payload refuses
//! to parse.

use crate::consolidate::Severity;
use crate::error::ConsolidationError;
use serde::Deserialize;

/// One finding as reported by the model, chunk-local and unvalidated.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawFinding {
    #[serde(default)]
    pub chunk: String,
    pub line: usize,
    pub end_line: Option<usize>,
    #[serde(default)]
    pub severity: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
struct FindingsEnvelope {
    findings: Vec<RawFinding>,
}

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = if clean.ends_with("```") {
        clean.strip_suffix("```").unwrap_or(clean)
    } else {
        clean
    };
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment<'a>(text: &'a str, open: char, close: char) -> Option<&'a str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Fix common JSON issues from model responses
fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    // Remove trailing commas before ] or }
    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(",}", "}");

    // Smart quotes to regular quotes
    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");
    fixed = fixed.replace('\u{2018}', "'");
    fixed = fixed.replace('\u{2019}', "'");

    // Drop control characters that slipped in
    fixed = fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    fixed
}

/// Salvage individual finding objects when array parsing fails
fn try_parse_individual_findings(json: &str) -> Vec<RawFinding> {
    let mut findings = Vec::new();
    let mut depth: i32 = 0;
    let mut start = None;

    for (i, c) in json.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        let obj_str = &json[s..=i];
                        if let Ok(f) = serde_json::from_str::<RawFinding>(obj_str) {
                            findings.push(f);
                        }
                    }
                    start = None;
                }
            }
            _ => {}
        }
    }

    findings
}

/// Parse the findings payload of one pass response.
///
/// Accepts both `{"findings": [...]}` and a bare array. An empty findings
/// list is a valid result, not an error.
pub(crate) fn parse_findings(
    pass_index: usize,
    response: &str,
) -> Result<Vec<RawFinding>, ConsolidationError> {
    let clean = strip_markdown_fences(response);
    let sanitized = fix_json_issues(clean);

    let json_str = if let Some(obj_str) = extract_json_fragment(&sanitized, '{', '}') {
        obj_str.to_string()
    } else if let Some(array_str) = extract_json_fragment(&sanitized, '[', ']') {
        array_str.to_string()
    } else {
        return Err(ConsolidationError::MissingPayload { pass_index });
    };

    if let Ok(envelope) = serde_json::from_str::<FindingsEnvelope>(&json_str) {
        return Ok(envelope.findings);
    }
    if let Ok(findings) = serde_json::from_str::<Vec<RawFinding>>(&json_str) {
        return Ok(findings);
    }
    if let Some(array_str) = extract_json_fragment(&json_str, '[', ']') {
        if let Ok(findings) = serde_json::from_str::<Vec<RawFinding>>(array_str) {
            return Ok(findings);
        }
    }

    let array_region = extract_json_fragment(&json_str, '[', ']').unwrap_or(&json_str);
    let salvaged = try_parse_individual_findings(array_region);
    if !salvaged.is_empty() {
        return Ok(salvaged);
    }

    Err(ConsolidationError::UnparseableResponse {
        pass_index,
        message: format!("unparseable findings payload ({} chars)", response.len()),
    })
}

/// Normalize a loose severity string; anything unrecognized is a suggestion.
pub(crate) fn parse_severity(raw: &str) -> Severity {
    match raw.trim().to_lowercase().as_str() {
        "critical" | "blocker" | "high" => Severity::Critical,
        "warning" | "warn" | "medium" => Severity::Warning,
        "nitpick" | "nit" | "minor" => Severity::Nitpick,
        _ => Severity::Suggestion,
    }
}
