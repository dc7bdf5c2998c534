//! Google Sheets tools backed by `sheets_client`.

use super::{OperationError, SpreadsheetOperations, ToolDefinition, ToolOutput};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sheets_client::SheetsClient;

pub const READ_RANGE: &str = "sheets.read_range";
pub const WRITE_RANGE: &str = "sheets.write_range";
pub const APPEND_ROW: &str = "sheets.append_row";

#[derive(Deserialize)]
struct ReadRangeArgs {
    spreadsheet_id: String,
    range: String,
}

#[derive(Deserialize)]
struct WriteRangeArgs {
    spreadsheet_id: String,
    range: String,
    values: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct AppendRowArgs {
    spreadsheet_id: String,
    range: String,
    values: Vec<String>,
}

/// The spreadsheet tools exposed over MCP.
pub struct SheetsOperations {
    client: SheetsClient,
}

impl SheetsOperations {
    pub fn new(client: SheetsClient) -> Self {
        Self { client }
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, OperationError> {
    serde_json::from_value(arguments)
        .map_err(|e| OperationError::InvalidArguments(format!("{}: {}", tool, e)))
}

#[async_trait]
impl SpreadsheetOperations for SheetsOperations {
    fn tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: READ_RANGE.to_string(),
                description: "Read values from a Google Sheet range".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "spreadsheet_id": {"type": "string"},
                        "range": {"type": "string"}
                    },
                    "required": ["spreadsheet_id", "range"]
                }),
            },
            ToolDefinition {
                name: WRITE_RANGE.to_string(),
                description: "Write values to a Google Sheet range".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "spreadsheet_id": {"type": "string"},
                        "range": {"type": "string"},
                        "values": {
                            "type": "array",
                            "items": {"type": "array", "items": {"type": "string"}}
                        }
                    },
                    "required": ["spreadsheet_id", "range", "values"]
                }),
            },
            ToolDefinition {
                name: APPEND_ROW.to_string(),
                description: "Append a new row to a Google Sheet".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "spreadsheet_id": {"type": "string"},
                        "range": {"type": "string"},
                        "values": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["spreadsheet_id", "range", "values"]
                }),
            },
        ]
    }

    async fn execute(
        &self,
        access_token: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolOutput, OperationError> {
        match tool {
            READ_RANGE => {
                let args: ReadRangeArgs = parse_args(tool, arguments)?;
                let rows = self
                    .client
                    .read_range(access_token, &args.spreadsheet_id, &args.range)
                    .await?;
                Ok(ToolOutput::Json(json!(rows)))
            }
            WRITE_RANGE => {
                let args: WriteRangeArgs = parse_args(tool, arguments)?;
                let summary = self
                    .client
                    .write_range(access_token, &args.spreadsheet_id, &args.range, &args.values)
                    .await?;
                Ok(ToolOutput::Text(format!(
                    "Sheet updated: {} cells in {}",
                    summary.updated_cells.unwrap_or(0),
                    summary.updated_range.as_deref().unwrap_or(&args.range)
                )))
            }
            APPEND_ROW => {
                let args: AppendRowArgs = parse_args(tool, arguments)?;
                let summary = self
                    .client
                    .append_row(access_token, &args.spreadsheet_id, &args.range, &args.values)
                    .await?;
                let target = summary
                    .updates
                    .and_then(|u| u.updated_range)
                    .unwrap_or(args.range);
                Ok(ToolOutput::Text(format!("Row appended at {}", target)))
            }
            other => Err(OperationError::UnknownTool(other.to_string())),
        }
    }
}
