//! Minimal client for the Google Sheets v4 values API.
//!
//! Every call takes the bearer token for the account it acts on; the client
//! itself holds no credentials, so one instance is shared across users.
//!
//! ```no_run
//! use sheets_client::SheetsClient;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = SheetsClient::new();
//! let rows = client.read_range("ya29.token", "1AbCdEf", "Sheet1!A1:C10").await?;
//! println!("{} rows", rows.len());
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Production API root.
pub const BASE_URL: &str = "https://sheets.googleapis.com/v4";

/// A range of cells as returned by `values.get`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRange {
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub major_dimension: Option<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

#[derive(Serialize)]
struct ValuesBody<'a> {
    values: &'a [Vec<String>],
}

/// Summary returned by `values.update`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSummary {
    #[serde(default)]
    pub updated_range: Option<String>,
    #[serde(default)]
    pub updated_rows: Option<u64>,
    #[serde(default)]
    pub updated_cells: Option<u64>,
}

/// Summary returned by `values.append`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendSummary {
    #[serde(default)]
    pub table_range: Option<String>,
    #[serde(default)]
    pub updates: Option<UpdateSummary>,
}

/// HTTP client for spreadsheet value ranges.
#[derive(Clone)]
pub struct SheetsClient {
    http_client: Client,
    base_url: String,
}

impl Default for SheetsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SheetsClient {
    /// Create a client using the production API base URL.
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL.to_string())
    }

    /// Create a client with a custom base URL (for testing with a mock server).
    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn values_url(&self, spreadsheet_id: &str, range: &str) -> String {
        format!(
            "{}/spreadsheets/{}/values/{}",
            self.base_url,
            urlencoding::encode(spreadsheet_id),
            urlencoding::encode(range)
        )
    }

    /// Read the cell values of `range`. Empty ranges yield an empty vector.
    pub async fn read_range(
        &self,
        access_token: &str,
        spreadsheet_id: &str,
        range: &str,
    ) -> Result<Vec<Vec<Value>>> {
        let url = self.values_url(spreadsheet_id, range);
        tracing::debug!(spreadsheet_id, range, "Reading sheet range");

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("Failed to send read_range request")?;

        let response = check_response(response).await?;
        let body: ValueRange = response
            .json()
            .await
            .context("Failed to parse read_range response")?;
        Ok(body.values)
    }

    /// Overwrite `range` with `values` (row-major, written as raw strings).
    pub async fn write_range(
        &self,
        access_token: &str,
        spreadsheet_id: &str,
        range: &str,
        values: &[Vec<String>],
    ) -> Result<UpdateSummary> {
        let url = format!(
            "{}?valueInputOption=RAW",
            self.values_url(spreadsheet_id, range)
        );
        tracing::debug!(spreadsheet_id, range, rows = values.len(), "Writing sheet range");

        let response = self
            .http_client
            .put(&url)
            .bearer_auth(access_token)
            .json(&ValuesBody { values })
            .send()
            .await
            .context("Failed to send write_range request")?;

        let response = check_response(response).await?;
        response
            .json()
            .await
            .context("Failed to parse write_range response")
    }

    /// Append a single row after the last row of the table found in `range`.
    pub async fn append_row(
        &self,
        access_token: &str,
        spreadsheet_id: &str,
        range: &str,
        row: &[String],
    ) -> Result<AppendSummary> {
        let url = format!(
            "{}:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.values_url(spreadsheet_id, range)
        );
        tracing::debug!(spreadsheet_id, range, cells = row.len(), "Appending sheet row");

        let values = vec![row.to_vec()];
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(access_token)
            .json(&ValuesBody { values: &values })
            .send()
            .await
            .context("Failed to send append_row request")?;

        let response = check_response(response).await?;
        response
            .json()
            .await
            .context("Failed to parse append_row response")
    }
}

/// Turn a non-2xx response into an error that keeps the provider's body intact.
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    Err(anyhow!("Sheets API error {}: {}", status, body))
}
