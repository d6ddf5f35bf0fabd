use std::path::Path;

use crate::error::{AppError, Result};
use crate::parser::PayloadFormat;

pub const DISASTER_CSV_PROMPT: &str = r#"Given an image of this disaster, create a CSV filling out the following characteristics. Provide numeric estimates of events, or brief descriptions or yes/no. Do not be vague, and specify a reasonable number or number range. Do not include the information section if one exists for a certain parameter, and just the parameter with its value.

Parameter, Information:
Description, One sentence description of event
Disaster Type, Type of disaster (water, fire, earthquake, drought, demolition, etc.)
Region, Type of region (urban, rural, etc.)
Damaged Buildings, Number of damaged buildings
Damaged Vehicles, Number of damaged vehicles
Financial Burden, Financial cost of affected region (in USD)
Displaced People, number of displaced people
Recovery Personnel
Equipment, What equipment is needed (water, food, cranes etc.)
Response Time
Disaster Cause
Medical Aid Needed
Insurance Claims, estimated cost of insurance claims
Weather

Make your first row the parameters, and the second row its values. Please output your csv in <csv></csv> tags."#;

pub const DISASTER_JSON_PROMPT: &str = "I am making a spreadsheet detailing characteristics of a certain event \
(e.g. Type of natural disaster, type of region (urban, rural, etc.), Number of damaged buildings, \
Number of vehicles affected, Financial cost of affected region ($$ number), \
Number of people displaced, Number of people needed, \
What equipment is needed (water, cranes, etc.)). \
Provide additional relevant characteristics. \
Return in JSON format with fields: 'characteristic', 'description', and 'estimated value'. \
Wrap your JSON output, including brackets and commas as needed, in <output></output> tags.";

pub fn default_prompt(format: PayloadFormat) -> &'static str {
    match format {
        PayloadFormat::Csv => DISASTER_CSV_PROMPT,
        PayloadFormat::Json => DISASTER_JSON_PROMPT,
    }
}

/// The prompt from `prompt_file` if given, otherwise the built-in one for `format`.
pub fn load_prompt(prompt_file: Option<&Path>, format: PayloadFormat) -> Result<String> {
    let Some(path) = prompt_file else {
        return Ok(default_prompt(format).to_string());
    };

    let prompt = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("Failed to read prompt file {}: {e}", path.display()))
    })?;
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(AppError::Config(format!("Prompt file {} is empty", path.display())));
    }

    let tag = format!("<{}>", format.tag());
    if !prompt.contains(&tag) {
        tracing::warn!(
            path = %path.display(),
            tag = %tag,
            "Prompt does not mention the expected tag; responses may fail to parse"
        );
    }
    Ok(prompt.to_string())
}
