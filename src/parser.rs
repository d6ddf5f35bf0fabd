//! Extraction of tagged payloads from free-form model responses.
//!
//! Models are asked to wrap their structured answer in a tag pair such as
//! `<csv>...</csv>` or `<output>...</output>`. When a response contains more
//! than one block, the last one wins: models tend to correct themselves
//! further down.

use regex::Regex;
use serde::Deserialize;

use crate::error::{AppError, Result};

/// Structured format a committed payload is expected to have.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Csv,
    Json,
}

impl PayloadFormat {
    /// Tag the model is instructed to wrap its answer in.
    pub fn tag(&self) -> &'static str {
        match self {
            PayloadFormat::Csv => "csv",
            PayloadFormat::Json => "output",
        }
    }

    /// Extension of the committed output artifact.
    pub fn extension(&self) -> &'static str {
        match self {
            PayloadFormat::Csv => "csv",
            PayloadFormat::Json => "json",
        }
    }
}

/// Return the trimmed contents of the last `<tag>...</tag>` block.
pub fn extract(raw: &str, tag: &str) -> Result<String> {
    let tag = regex::escape(tag);
    let pattern = Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>"))
        .map_err(|e| AppError::Internal(format!("Invalid tag pattern: {e}")))?;

    let last = pattern
        .captures_iter(raw)
        .last()
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| AppError::Parse(format!("No <{tag}> block in response")))?;

    let payload = last.as_str().trim();
    if payload.is_empty() {
        return Err(AppError::Parse(format!("Empty <{tag}> block in response")));
    }
    Ok(payload.to_string())
}

/// Extract the payload for `format` and check that it deserializes.
///
/// Returns the text to commit: CSV is passed through as extracted, JSON is
/// re-rendered pretty-printed.
pub fn parse(raw: &str, format: PayloadFormat) -> Result<String> {
    let payload = extract(raw, format.tag())?;
    match format {
        PayloadFormat::Csv => {
            validate_csv(&payload)?;
            Ok(payload)
        }
        PayloadFormat::Json => {
            let value: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| AppError::Parse(format!("Could not decode JSON payload: {e}")))?;
            Ok(serde_json::to_string_pretty(&value)?)
        }
    }
}

/// Check that a CSV payload is a header row followed by at least one value
/// row, every row having the header's column count.
pub fn validate_csv(payload: &str) -> Result<()> {
    let rows = payload
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(split_csv_row)
        .collect::<Result<Vec<_>>>()?;

    let (header, values) = rows
        .split_first()
        .ok_or_else(|| AppError::Parse("CSV payload is empty".to_string()))?;

    if header.iter().any(|h| h.is_empty()) {
        return Err(AppError::Parse("CSV header has an empty column name".to_string()));
    }
    if values.is_empty() {
        return Err(AppError::Parse("CSV payload has no value row".to_string()));
    }
    for (index, row) in values.iter().enumerate() {
        if row.len() != header.len() {
            return Err(AppError::Parse(format!(
                "CSV row {} has {} columns, header has {}",
                index + 2,
                row.len(),
                header.len()
            )));
        }
    }
    Ok(())
}

/// Split one CSV line into trimmed fields, honouring double quotes and `""` escapes.
fn split_csv_row(line: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(field.trim().to_string());
                field.clear();
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(AppError::Parse(format!("Unterminated quote in CSV row: {line}")));
    }
    fields.push(field.trim().to_string());
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CSV: &str = "Description, Disaster Type, Region\n\"Severe flooding, downtown\", \"Water\", \"Urban\"";

    #[test]
    fn test_extract_single_block() {
        let raw = "Here you go:\n<csv>\na,b\n1,2\n</csv>\nThanks";
        assert_eq!(extract(raw, "csv").unwrap(), "a,b\n1,2");
    }

    #[test]
    fn test_extract_last_block_wins() {
        let raw = "<csv>A</csv> wait, let me fix that <csv>B</csv>";
        assert_eq!(extract(raw, "csv").unwrap(), "B");
    }

    #[test]
    fn test_extract_missing_tag() {
        let err = extract("no structured answer here", "csv").unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn test_extract_ignores_other_tags() {
        let raw = "<output>{\"a\": 1}</output>";
        assert!(extract(raw, "csv").is_err());
        assert_eq!(extract(raw, "output").unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_empty_block() {
        assert!(matches!(extract("<csv>  \n </csv>", "csv"), Err(AppError::Parse(_))));
    }

    #[test]
    fn test_parse_csv_accepts_quoted_commas() {
        let raw = format!("<csv>\n{SAMPLE_CSV}\n</csv>");
        assert_eq!(parse(&raw, PayloadFormat::Csv).unwrap(), SAMPLE_CSV);
    }

    #[test]
    fn test_parse_csv_rejects_ragged_rows() {
        let raw = "<csv>a, b, c\n1, 2</csv>";
        assert!(matches!(parse(raw, PayloadFormat::Csv), Err(AppError::Parse(_))));
    }

    #[test]
    fn test_parse_csv_rejects_header_only() {
        assert!(parse("<csv>a, b, c</csv>", PayloadFormat::Csv).is_err());
    }

    #[test]
    fn test_parse_csv_rejects_unterminated_quote() {
        assert!(parse("<csv>a, b\n\"oops, 2</csv>", PayloadFormat::Csv).is_err());
    }

    #[test]
    fn test_split_csv_row_escaped_quotes() {
        let fields = split_csv_row(r#""say ""hi""", 2"#).unwrap();
        assert_eq!(fields, vec![r#"say "hi""#.to_string(), "2".to_string()]);
    }

    #[test]
    fn test_parse_json_uses_last_output_block() {
        let raw = r#"draft <output>[{"characteristic": "x"</output> final <output>[{"characteristic": "Region", "description": "Type of region", "estimated value": "Urban"}]</output>"#;
        let payload = parse(raw, PayloadFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value[0]["estimated value"], "Urban");
    }

    #[test]
    fn test_parse_json_rejects_malformed() {
        let raw = "<output>{not json}</output>";
        assert!(matches!(parse(raw, PayloadFormat::Json), Err(AppError::Parse(_))));
    }
}
