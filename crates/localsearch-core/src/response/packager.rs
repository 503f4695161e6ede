use serde::{Deserialize, Serialize};

use crate::process::{ProcessInvocation, ProcessOutcome};

/// Prefix on every failure message produced by a capability run.
pub const FAILURE_PREFIX: &str = "Search failed: ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text { text: String },
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Self::Text { text } => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl InvocationResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: false,
        }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: true,
        }
    }

    /// Text of the first content item, or `""` if there is none.
    pub fn text(&self) -> &str {
        self.content.first().map(ContentItem::as_text).unwrap_or("")
    }
}

fn truncation_marker(limit_hint: usize) -> String {
    format!("\n[output truncated after {limit_hint} bytes]")
}

fn generic_failure(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("search command exited with status {code}"),
        None => "search command was terminated by a signal".to_string(),
    }
}

/// Turn a finished run into the reply content. Never fails.
pub fn pack(invocation: ProcessInvocation) -> InvocationResult {
    match invocation.outcome {
        ProcessOutcome::SpawnFailed(ref msg) => {
            InvocationResult::err(format!("{FAILURE_PREFIX}{msg}"))
        }
        ProcessOutcome::Exited { code: Some(0) } => {
            let mut text = invocation.stdout;
            if invocation.stdout_truncated {
                let kept = text.len();
                text.push_str(&truncation_marker(kept));
            }
            InvocationResult::ok(text)
        }
        ProcessOutcome::Exited { code } => {
            let detail = if invocation.stderr.is_empty() {
                generic_failure(code)
            } else {
                let mut stderr = invocation.stderr;
                if invocation.stderr_truncated {
                    let kept = stderr.len();
                    stderr.push_str(&truncation_marker(kept));
                }
                stderr
            };
            InvocationResult::err(format!("{FAILURE_PREFIX}{detail}"))
        }
        ProcessOutcome::TimedOut(after) => InvocationResult::err(format!(
            "{FAILURE_PREFIX}timed out after {}s",
            after.as_secs_f64()
        )),
        ProcessOutcome::Cancelled => InvocationResult::err(format!("{FAILURE_PREFIX}cancelled")),
    }
}

/// Reply for arguments that did not match the declared input schema.
pub fn validation_failure(capability: &str, problems: &[String]) -> InvocationResult {
    InvocationResult::err(format!(
        "Invalid arguments for '{capability}': {}",
        problems.join("; ")
    ))
}
