//! HTTP-dispatched tools.
//!
//! A [`RemoteTool`] is registered with its endpoint, schema, and alias map
//! at boot. Dispatch POSTs the parameters with the idempotency headers
//! (`x-execution-id`, `x-step-id`) and trace propagation; the remote side
//! answers `{success, output?, error?, compensation?}`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::trace::{EXECUTION_ID_HEADER, STEP_ID_HEADER};

use super::{CompensationRequest, InvocationContext, Tool, ToolError, ToolOutput, ToolSchema};

#[derive(Debug, Deserialize)]
struct RemoteResponse {
    success: bool,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    compensation: Option<RemoteCompensation>,
}

#[derive(Debug, Deserialize)]
struct RemoteCompensation {
    tool: String,
    #[serde(default)]
    parameters: Map<String, Value>,
}

/// A tool reachable over HTTP.
pub struct RemoteTool {
    name: String,
    endpoint: String,
    schema: ToolSchema,
    aliases: Vec<(String, String)>,
    compensation_tool: Option<String>,
    client: reqwest::Client,
}

impl RemoteTool {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, schema: ToolSchema) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            schema,
            aliases: Vec::new(),
            compensation_tool: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<(&str, &str)>) -> Self {
        self.aliases = aliases
            .into_iter()
            .map(|(a, c)| (a.to_owned(), c.to_owned()))
            .collect();
        self
    }

    pub fn with_compensation_tool(mut self, tool: impl Into<String>) -> Self {
        self.compensation_tool = Some(tool.into());
        self
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    fn aliases(&self) -> Vec<(String, String)> {
        self.aliases.clone()
    }

    fn compensation_tool(&self) -> Option<String> {
        self.compensation_tool.clone()
    }

    async fn call(
        &self,
        params: Map<String, Value>,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(EXECUTION_ID_HEADER, ctx.execution_id.to_string())
            .header(STEP_ID_HEADER, &ctx.step_id)
            .json(&params);
        for (name, value) in ctx.trace.headers() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError(format!("request to {} failed: {e}", self.name)))?;

        if !response.status().is_success() {
            return Err(ToolError(format!(
                "{} returned {}",
                self.name,
                response.status()
            )));
        }

        let parsed: RemoteResponse = response
            .json()
            .await
            .map_err(|e| ToolError(format!("invalid response from {}: {e}", self.name)))?;

        if !parsed.success {
            return Err(ToolError(
                parsed
                    .error
                    .unwrap_or_else(|| format!("{} reported failure", self.name)),
            ));
        }

        Ok(ToolOutput {
            output: parsed.output.unwrap_or(Value::Null),
            compensation: parsed.compensation.map(|c| CompensationRequest {
                tool: c.tool,
                parameters: c.parameters,
            }),
        })
    }
}
