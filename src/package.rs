//! Aggregation of committed items into a single fine-tuning mapping file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::parser::PayloadFormat;
use crate::store::WorkItemStore;

/// One training example: image reference, prompt, and the expected answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub image: String,
    pub prompt: String,
    pub response: String,
}

/// Result of an aggregation pass.
#[derive(Debug, Default)]
pub struct PackageSummary {
    pub records: usize,
    pub missing: usize,
}

/// Collect a record for every committed item, ascending by id.
///
/// The stored payload is re-wrapped in the format's tag so the response
/// matches what the model is asked to produce.
pub async fn collect_records(
    store: &WorkItemStore,
    prompt: &str,
    format: PayloadFormat,
) -> Result<(Vec<TrainingRecord>, PackageSummary)> {
    let tag = format.tag();
    let mut records = Vec::new();
    let mut summary = PackageSummary::default();

    for item in store.discover().await? {
        if !store.is_done(&item).await {
            tracing::warn!(
                item = item.id,
                input = %item.input.display(),
                "No output artifact for input, leaving it out"
            );
            summary.missing += 1;
            continue;
        }

        let payload = store.read_output(&item).await?;
        records.push(TrainingRecord {
            image: item.input.to_string_lossy().to_string(),
            prompt: prompt.to_string(),
            response: format!("<{tag}>\n{}\n</{tag}>", payload.trim()),
        });
    }

    summary.records = records.len();
    Ok((records, summary))
}

/// Aggregate all committed items and write them to `output` as a JSON array.
pub async fn write_package(
    store: &WorkItemStore,
    prompt: &str,
    format: PayloadFormat,
    output: &Path,
) -> Result<PackageSummary> {
    let (records, summary) = collect_records(store, prompt, format).await?;
    let json = serde_json::to_string_pretty(&records)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(output).await.map_err(|e| {
        AppError::Store(format!("Failed to create {}: {e}", output.display()))
    })?;
    file.write_all(json.as_bytes()).await?;
    file.flush().await?;

    tracing::info!(
        records = summary.records,
        missing = summary.missing,
        output = %output.display(),
        "Package written"
    );
    Ok(summary)
}
