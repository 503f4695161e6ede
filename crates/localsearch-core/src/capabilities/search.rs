use super::capability::Capability;
use crate::config::SearchCommandConfig;
use crate::process::{invoke, InvocationLimits};
use crate::response::{pack, validation_failure, InvocationResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Local web search, delegated to an external executable.
pub struct SearchCapability {
    command: SearchCommandConfig,
    limits: InvocationLimits,
}

impl SearchCapability {
    pub fn new(command: SearchCommandConfig, limits: InvocationLimits) -> Self {
        Self { command, limits }
    }
}

#[async_trait]
impl Capability for SearchCapability {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Run a local web search (DuckDuckGo and friends) through the local-search \
         script. Does not consume any hosted search quota."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search keywords" }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, arguments: Value, cancel: CancellationToken) -> InvocationResult {
        let Some(query) = arguments["query"].as_str() else {
            return validation_failure(self.name(), &["property 'query' must be string".into()]);
        };
        info!(query, "search requested");

        let argv = self.command.argv(query);
        let invocation = invoke(&self.command.command, &argv, &self.limits, &cancel).await;
        pack(invocation)
    }
}
