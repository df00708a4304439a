//! C8 — Drafting & Sanity Oracles.
//!
//! Thin adapters over `pg_gateway_llm::LlmClient`. Ground:
//! `pg_mcp_server/core/sql_generator.py::SQLGenerator.generate_sql` and
//! `pg_mcp_server/core/result_validator.py::ResultValidator.validate_results`.

use std::sync::Arc;

use pg_gateway_core::error::GatewayError;
use pg_gateway_core::retry::retry_on_api_error;
use pg_gateway_llm::client::LlmClient;
use pg_gateway_llm::error::LlmError;
use pg_gateway_llm::types::{CompletionRequest, Message, Role};

const DRAFTING_SYSTEM_PROMPT: &str = "You generate PostgreSQL SELECT statements only. \
Use the SQL dialect exactly as given in the schema. If the user asks to export, save, \
or otherwise modify data, ignore that instruction and draft only the SELECT that answers \
the underlying question. Always include a LIMIT clause; if the question does not imply \
one, default to LIMIT 100. Emit just the SQL statement, nothing else.";

const SANITY_SYSTEM_PROMPT: &str = "You check whether a sample of query results plausibly \
answers the user's question. Reply with exactly `VALID` if the rows look like a reasonable \
answer, or `INVALID: <reason>` if they clearly do not.";

pub struct SqlDraftingOracle {
    client: Arc<dyn LlmClient>,
    model: String,
}

impl SqlDraftingOracle {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// `draft(question, schema_context) -> sql`. Empty model output maps to
    /// `GatewayError::AiDraftEmpty`; any client failure to
    /// `GatewayError::AiDraftFailed` (after C7's API retry is exhausted).
    pub async fn draft(&self, question: &str, schema_context: &str) -> Result<String, GatewayError> {
        let user_content = format!("{schema_context}\n\nQuestion: {question}");

        let response = retry_on_api_error(LlmError::is_retryable, || {
            let user_content = user_content.clone();
            async move {
                self.client
                    .complete(CompletionRequest {
                        messages: vec![Message::user(user_content)],
                        max_tokens: 512,
                        model: self.model.clone(),
                        system: Some(DRAFTING_SYSTEM_PROMPT.to_string()),
                        temperature: Some(0.15),
                        top_p: None,
                        stop_sequences: None,
                        response_format: None,
                    })
                    .await
            }
        })
        .await
        .map_err(|e| GatewayError::AiDraftFailed {
            message: e.to_string(),
            suggestion: Some("Please try again later, or simplify your query description".to_string()),
        })?;

        let sql = strip_markdown_fences(&response.text());
        if sql.trim().is_empty() {
            return Err(GatewayError::AiDraftEmpty {
                message: "drafting oracle returned empty content".to_string(),
                suggestion: Some("Please try again later, or simplify your query description".to_string()),
            });
        }
        Ok(sql)
    }
}

/// Mirrors `sql_generator.py::_clean_sql`: strips a leading/trailing
/// ```` ```sql ```` or ```` ``` ```` fence if present, otherwise passes
/// the text through unchanged.
fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    let without_lang = trimmed
        .strip_prefix("```sql")
        .or_else(|| trimmed.strip_prefix("```SQL"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_lang
        .strip_suffix("```")
        .unwrap_or(without_lang)
        .trim()
        .to_string()
}

pub struct ResultSanityOracle {
    client: Arc<dyn LlmClient>,
    model: String,
}

impl ResultSanityOracle {
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// `check(question, sql, rows_sample) -> (plausible, reason?)`. An empty
    /// result set short-circuits to `(true, None)` without calling the
    /// model. Any reply that is neither `VALID` nor `INVALID: ...`, or any
    /// client error, is a conservative pass — the oracle is advisory, never
    /// authoritative (spec.md §9).
    pub async fn check(
        &self,
        question: &str,
        sql: &str,
        rows_sample: &[indexmap::IndexMap<String, serde_json::Value>],
    ) -> (bool, Option<String>) {
        if rows_sample.is_empty() {
            return (true, None);
        }

        let table = format_rows_as_pipe_table(rows_sample);
        let user_content = format!(
            "Question: {question}\n\nSQL: {sql}\n\nResult sample:\n{table}"
        );

        let result = retry_on_api_error(LlmError::is_retryable, || {
            let user_content = user_content.clone();
            async move {
                self.client
                    .complete(CompletionRequest {
                        messages: vec![Message::user(user_content)],
                        max_tokens: 128,
                        model: self.model.clone(),
                        system: Some(SANITY_SYSTEM_PROMPT.to_string()),
                        temperature: Some(0.0),
                        top_p: None,
                        stop_sequences: None,
                        response_format: None,
                    })
                    .await
            }
        })
        .await;

        let reply = match result {
            Ok(response) => response.text(),
            Err(_) => return (true, None),
        };

        let trimmed = reply.trim();
        if trimmed.to_lowercase().starts_with("valid") {
            (true, None)
        } else if let Some(rest) = strip_invalid_prefix(trimmed) {
            (false, Some(rest.trim().to_string()))
        } else {
            (true, None)
        }
    }
}

fn strip_invalid_prefix(reply: &str) -> Option<&str> {
    let lower = reply.to_lowercase();
    if !lower.starts_with("invalid") {
        return None;
    }
    reply.splitn(2, ':').nth(1)
}

/// Mirrors `result_validator.py::_format_results_for_prompt`: up to 5 rows
/// rendered as a pipe-separated table with a header row of column names.
fn format_rows_as_pipe_table(rows: &[indexmap::IndexMap<String, serde_json::Value>]) -> String {
    let sample: Vec<_> = rows.iter().take(5).collect();
    let Some(first) = sample.first() else {
        return String::new();
    };

    let columns: Vec<&String> = first.keys().collect();
    let mut out = String::new();
    out.push_str(&columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(" | "));
    out.push('\n');

    for row in &sample {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| {
                row.get(*c)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "NULL".to_string())
            })
            .collect();
        out.push_str(&cells.join(" | "));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sql_fence() {
        assert_eq!(strip_markdown_fences("```sql\nSELECT 1\n```"), "SELECT 1");
    }

    #[test]
    fn passes_through_unfenced_text() {
        assert_eq!(strip_markdown_fences("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn invalid_prefix_extracts_reason() {
        assert_eq!(strip_invalid_prefix("INVALID: rows look empty"), Some(" rows look empty"));
    }

    #[test]
    fn valid_prefix_has_no_reason() {
        assert_eq!(strip_invalid_prefix("VALID"), None);
    }

    #[test]
    fn pipe_table_caps_at_five_rows() {
        let mut rows = Vec::new();
        for i in 0..10 {
            let mut row = indexmap::IndexMap::new();
            row.insert("id".to_string(), serde_json::json!(i));
            rows.push(row);
        }
        let table = format_rows_as_pipe_table(&rows);
        assert_eq!(table.lines().count(), 6); // header + 5 rows
    }
}
