//! MCP server implementation using rmcp.
//!
//! Exposes sandbox sessions, execution and debugging as MCP tools. Every
//! tool takes the caller's `owner_id`; identity is resolved by the client.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::debug::DebugCommand;
use crate::error::SandboxError;
use crate::execution::ExecutionStatus;
use crate::language;
use crate::sandbox::Sandbox;

/// MCP server for sandboxed code execution and debugging.
#[derive(Clone)]
pub struct SandboxServer {
    sandbox: Arc<Sandbox>,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateSessionParams {
    #[schemars(description = "Opaque identifier of the caller (user or guest)")]
    pub owner_id: String,

    #[schemars(description = "Language the session container runs (e.g. 'python', 'go', 'node18')")]
    pub language: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionParams {
    #[schemars(description = "Opaque identifier of the caller (user or guest)")]
    pub owner_id: String,

    #[schemars(description = "Session id returned by create_session or start_debug")]
    pub session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct OwnerParams {
    #[schemars(description = "Opaque identifier of the caller (user or guest)")]
    pub owner_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    #[schemars(description = "Opaque identifier of the caller (user or guest)")]
    pub owner_id: String,

    #[schemars(description = "Language of the code")]
    pub language: String,

    #[schemars(description = "The code to execute")]
    pub code: String,

    /// Defaults to the owner's session for `language`, created on demand.
    #[serde(default)]
    #[schemars(description = "Session to run in. Defaults to the caller's session for the language")]
    pub session_id: Option<String>,

    /// When false, return the execution id immediately and stream results as events.
    #[serde(default = "default_wait")]
    #[schemars(description = "Wait for the result (default true). When false, poll_events delivers it")]
    pub wait: bool,
}

const fn default_wait() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StartDebugParams {
    #[schemars(description = "Opaque identifier of the caller (user or guest)")]
    pub owner_id: String,

    #[schemars(description = "Language of the code ('python' or 'go')")]
    pub language: String,

    #[schemars(description = "The program to debug")]
    pub code: String,

    #[serde(default)]
    #[schemars(description = "1-based line numbers to break on")]
    pub breakpoints: Vec<u32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DebugCommandParams {
    #[schemars(description = "Opaque identifier of the caller (user or guest)")]
    pub owner_id: String,

    #[schemars(description = "Debug session id")]
    pub session_id: String,

    #[schemars(
        description = "One of: step_over, step_into, step_out, continue, pause, stop, evaluate"
    )]
    pub command: String,

    #[serde(default)]
    #[schemars(description = "Expression for the evaluate command")]
    pub expression: Option<String>,
}

fn json_result<T: Serialize>(value: &T, is_error: bool) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Failed to encode result: {e}"), None))?;
    let content = vec![Content::text(text)];
    Ok(if is_error {
        CallToolResult::error(content)
    } else {
        CallToolResult::success(content)
    })
}

/// Bad input becomes a protocol error; infrastructure failures become error results.
fn respond<T: Serialize>(result: Result<T, SandboxError>) -> Result<CallToolResult, McpError> {
    match result {
        Ok(value) => json_result(&value, false),
        Err(e) if e.is_client_error() => Err(McpError::invalid_params(e.to_string(), None)),
        Err(e) => {
            error!(error = %e, "Tool call failed");
            Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
        }
    }
}

#[tool_router]
impl SandboxServer {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            sandbox,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Create (or reuse) the caller's sandbox session for a language")]
    async fn create_session(
        &self,
        Parameters(params): Parameters<CreateSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        respond(
            self.sandbox
                .create_session(&params.owner_id, &params.language)
                .await,
        )
    }

    #[tool(description = "Stop a sandbox session and its container")]
    async fn stop_session(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        respond(
            self.sandbox
                .stop_session(&params.owner_id, &params.session_id)
                .await
                .map(|()| json!({ "stopped": params.session_id })),
        )
    }

    #[tool(description = "Execute code in the caller's sandbox session")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(
            owner = %params.owner_id,
            language = %params.language,
            code_len = params.code.len(),
            "Executing code"
        );
        let ticket = match self
            .sandbox
            .execute(
                &params.owner_id,
                params.session_id.as_deref(),
                &params.code,
                &params.language,
            )
            .await
        {
            Ok(ticket) => ticket,
            Err(e) => return respond::<()>(Err(e)),
        };

        if !params.wait {
            return json_result(
                &json!({
                    "execution_id": ticket.execution_id,
                    "session_id": ticket.session_id,
                    "status": ExecutionStatus::Pending,
                }),
                false,
            );
        }

        match ticket.wait().await {
            Ok(record) => {
                let failed = record.status == ExecutionStatus::Failed
                    || record.exit_code.is_some_and(|code| code != 0);
                json_result(&record, failed)
            }
            Err(e) => respond::<()>(Err(e)),
        }
    }

    #[tool(description = "Start a debug session with breakpoints; pauses arrive via poll_events")]
    async fn start_debug(
        &self,
        Parameters(params): Parameters<StartDebugParams>,
    ) -> Result<CallToolResult, McpError> {
        respond(
            self.sandbox
                .start_debug(
                    &params.owner_id,
                    &params.code,
                    &params.language,
                    &params.breakpoints,
                )
                .await,
        )
    }

    #[tool(description = "Send a command (step_over, step_into, step_out, continue, pause, stop, evaluate) to a debug session")]
    async fn debug_command(
        &self,
        Parameters(params): Parameters<DebugCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let command: DebugCommand = serde_json::from_value(json!({
            "type": params.command,
            "expression": params.expression,
        }))
        .map_err(|e| {
            McpError::invalid_params(format!("Invalid debug command '{}': {e}", params.command), None)
        })?;

        respond(
            self.sandbox
                .send_debug_command(&params.owner_id, &params.session_id, command)
                .await
                .map(|result| json!({ "ok": true, "result": result })),
        )
    }

    #[tool(description = "Stop a debug session")]
    async fn stop_debug(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        respond(
            self.sandbox
                .stop_debug(&params.owner_id, &params.session_id)
                .await
                .map(|()| json!({ "stopped": params.session_id })),
        )
    }

    #[tool(description = "Get the state of a debug session (stack, variables, status)")]
    async fn get_debug_session(
        &self,
        Parameters(params): Parameters<SessionParams>,
    ) -> Result<CallToolResult, McpError> {
        respond(
            self.sandbox
                .get_debug_session(&params.owner_id, &params.session_id)
                .await,
        )
    }

    #[tool(description = "Take the events (output, status, debugger pauses) queued for the caller")]
    async fn poll_events(
        &self,
        Parameters(params): Parameters<OwnerParams>,
    ) -> Result<CallToolResult, McpError> {
        json_result(&self.sandbox.poll_events(&params.owner_id), false)
    }

    #[tool(description = "Mark the caller as disconnected; their session stops unless they return within the grace period")]
    async fn disconnect(
        &self,
        Parameters(params): Parameters<OwnerParams>,
    ) -> Result<CallToolResult, McpError> {
        self.sandbox.disconnect(&params.owner_id);
        json_result(&json!({ "disconnected": params.owner_id }), false)
    }

    #[tool(description = "Remove leftover sandbox containers that no live session owns")]
    async fn prune_orphans(&self) -> Result<CallToolResult, McpError> {
        respond(
            self.sandbox
                .prune_orphans()
                .await
                .map(|removed| json!({ "removed": removed })),
        )
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let debuggable = self.sandbox.debuggable_languages();
        let languages = language::supported_languages();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "code-sandbox".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Run and debug code in per-user sandbox containers.\n\
                 Languages: {languages:?}\n\
                 Debuggable: {debuggable:?}\n\
                 \n\
                 Use 'execute' with owner_id, language and code. Sessions are reused\n\
                 per owner and language. Debugger pauses and streamed output are\n\
                 delivered through 'poll_events'."
            )),
        }
    }
}

/// Serve the sandbox over stdio until the client goes away.
pub async fn serve_stdio(sandbox: Arc<Sandbox>) -> anyhow::Result<()> {
    let server = SandboxServer::new(sandbox);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::{ExecScript, MockRuntime, RecordingStore};

    fn server() -> (SandboxServer, Arc<MockRuntime>) {
        let runtime = Arc::new(MockRuntime::new());
        let sandbox = Sandbox::new(
            runtime.clone(),
            Config::default(),
            Arc::new(RecordingStore::default()),
        );
        (SandboxServer::new(Arc::new(sandbox)), runtime)
    }

    fn text(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect()
    }

    fn execute_params(language: &str, code: &str) -> Parameters<ExecuteParams> {
        Parameters(ExecuteParams {
            owner_id: "alice".into(),
            language: language.into(),
            code: code.into(),
            session_id: None,
            wait: true,
        })
    }

    #[tokio::test]
    async fn test_execute_success() {
        let (server, runtime) = server();
        runtime.script(ExecScript::stdout("ok\n"));

        let result = tokio_test::assert_ok!(server.execute(execute_params("python", "print('ok')")).await);
        assert!(!result.is_error.unwrap_or(false));
        let record: serde_json::Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(record["status"], "COMPLETED");
        assert_eq!(record["stdout"], "ok\n");
        assert_eq!(record["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit_is_error_result() {
        let (server, runtime) = server();
        runtime.script(ExecScript {
            exit_code: 2,
            ..ExecScript::default()
        });

        let result = server.execute(execute_params("bash", "exit 2")).await.unwrap();
        assert!(result.is_error.unwrap_or(false));
    }

    #[tokio::test]
    async fn test_execute_unknown_language() {
        let (server, _) = server();
        let result = server.execute(execute_params("cobol", "DISPLAY 'HI'")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_execute_without_waiting_returns_id() {
        let (server, _) = server();
        let mut params = execute_params("python", "pass");
        params.0.wait = false;

        let result = server.execute(params).await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(body["status"], "PENDING");
        assert!(body["execution_id"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_debug_command_is_invalid() {
        let (server, _) = server();
        let result = server
            .debug_command(Parameters(DebugCommandParams {
                owner_id: "alice".into(),
                session_id: "s1".into(),
                command: "rewind".into(),
                expression: None,
            }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_debug_command_for_unknown_session() {
        let (server, _) = server();
        let result = server
            .debug_command(Parameters(DebugCommandParams {
                owner_id: "alice".into(),
                session_id: "s1".into(),
                command: "continue".into(),
                expression: None,
            }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_poll_events_drains_queue() {
        let (server, runtime) = server();
        runtime.script(ExecScript::stdout("ok\n"));
        server.execute(execute_params("python", "print('ok')")).await.unwrap();

        let owner = || Parameters(OwnerParams { owner_id: "alice".into() });
        let events: Vec<serde_json::Value> =
            serde_json::from_str(&text(&server.poll_events(owner()).await.unwrap())).unwrap();
        assert_eq!(events.first().unwrap()["type"], "execution_status");
        assert!(events.iter().any(|e| e["type"] == "execution_complete"));

        let again: Vec<serde_json::Value> =
            serde_json::from_str(&text(&server.poll_events(owner()).await.unwrap())).unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_server_info() {
        let (server, _) = server();
        let info = server.get_info();
        assert_eq!(info.server_info.name, "code-sandbox");
        assert!(info.instructions.unwrap().contains("python"));
    }
}
