use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use super::transport::{Incoming, ResponseWriter, StdioTransport};
use crate::capabilities::{validate_arguments, Capability, CapabilityRegistry};
use crate::config::BridgeConfig;
use crate::error::{codes, BridgeError};
use crate::response::validation_failure;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Lifecycle of one session, from handshake to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for `initialize`.
    Idle,
    /// Handshake answered, client has not confirmed yet.
    Connected,
    Serving,
    Terminated,
}

/// Identity reported to the client in the handshake.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl ServerInfo {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            name: config.server_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    #[serde(rename = "requestId")]
    request_id: Value,
}

enum Dispatch {
    Reply(Value),
    Invoke {
        capability: Arc<dyn Capability>,
        arguments: Value,
    },
}

// ── SessionDispatcher ────────────────────────────────────────────────────────

/// Routes MCP requests from one client to the capability registry.
///
/// Listing and handshake requests are answered inline. Each `tools/call` runs
/// in its own task, so several searches can be in flight at once and replies
/// may go out in a different order than the requests came in.
pub struct SessionDispatcher {
    registry: Arc<CapabilityRegistry>,
    info: ServerInfo,
    state: SessionState,
    shutdown: CancellationToken,
    in_flight: Arc<DashMap<String, CancellationToken>>,
}

impl SessionDispatcher {
    pub fn new(registry: CapabilityRegistry, info: ServerInfo) -> Self {
        Self {
            registry: Arc::new(registry),
            info,
            state: SessionState::Idle,
            shutdown: CancellationToken::new(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve requests until the client disconnects or the transport breaks.
    ///
    /// On the way out every in-flight invocation is cancelled and awaited, so
    /// no child process outlives the session.
    pub async fn serve<R, W>(
        &mut self,
        mut transport: StdioTransport<R, W>,
    ) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = transport.writer();
        let mut tasks = JoinSet::new();

        let outcome = self.run_loop(&mut transport, &writer, &mut tasks).await;
        if let Err(e) = &outcome {
            warn!("session ended on transport failure: {e}");
        }

        self.transition(SessionState::Terminated);
        if !tasks.is_empty() {
            info!("cancelling {} in-flight invocation(s)", tasks.len());
        }
        self.shutdown.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("invocation task failed: {e}");
            }
        }
        outcome
    }

    async fn run_loop<R, W>(
        &mut self,
        transport: &mut StdioTransport<R, W>,
        writer: &ResponseWriter<W>,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(message) = transport.receive().await? {
            while tasks.try_join_next().is_some() {}

            let req = match message {
                Incoming::Request(req) => req,
                Incoming::Malformed(reason) => {
                    warn!("dropping malformed message: {reason}");
                    let err = BridgeError::Parse(reason);
                    writer.send(&JsonRpcResponse::failure(Value::Null, &err)).await?;
                    continue;
                }
                Incoming::Invalid(reason) => {
                    warn!("dropping invalid request: {reason}");
                    let err = BridgeError::InvalidRequest(reason);
                    writer.send(&JsonRpcResponse::failure(Value::Null, &err)).await?;
                    continue;
                }
            };

            if req.is_notification() {
                self.handle_notification(&req);
                continue;
            }

            let id = req.id.clone().unwrap_or(Value::Null);
            match self.handle_request(req) {
                Ok(Dispatch::Reply(result)) => {
                    writer.send(&JsonRpcResponse::success(id, result)).await?;
                }
                Ok(Dispatch::Invoke {
                    capability,
                    arguments,
                }) => {
                    if let Err(err) = self.spawn_invocation(
                        tasks,
                        id.clone(),
                        capability,
                        arguments,
                        writer.clone(),
                    ) {
                        debug!("request {} failed: {}", id, err);
                        writer.send(&JsonRpcResponse::failure(id, &err)).await?;
                    }
                }
                Err(err) => {
                    debug!("request {} failed: {}", id, err);
                    writer.send(&JsonRpcResponse::failure(id, &err)).await?;
                }
            }
        }
        info!("client closed the session");
        Ok(())
    }

    fn handle_request(&mut self, req: JsonRpcRequest) -> Result<Dispatch, BridgeError> {
        match req.method.as_str() {
            "initialize" => {
                if self.state != SessionState::Idle {
                    debug!("repeated initialize in state {:?}", self.state);
                } else {
                    self.transition(SessionState::Connected);
                }
                Ok(Dispatch::Reply(self.initialize_result()))
            }
            "ping" => Ok(Dispatch::Reply(json!({}))),
            _ if self.state == SessionState::Idle => Err(BridgeError::NotInitialized),
            "tools/list" => {
                self.mark_serving();
                Ok(Dispatch::Reply(json!({ "tools": self.registry.list() })))
            }
            "resources/list" => {
                self.mark_serving();
                Ok(Dispatch::Reply(json!({ "resources": [] })))
            }
            "tools/call" => {
                self.mark_serving();
                self.prepare_call(req.params)
            }
            other => Err(BridgeError::MethodNotFound(other.to_string())),
        }
    }

    fn handle_notification(&mut self, req: &JsonRpcRequest) {
        match req.method.as_str() {
            "notifications/initialized" => {
                if self.state == SessionState::Connected {
                    self.transition(SessionState::Serving);
                }
            }
            "notifications/cancelled" => {
                let parsed = req
                    .params
                    .clone()
                    .map(serde_json::from_value::<CancelParams>);
                match parsed {
                    Some(Ok(params)) => {
                        let key = params.request_id.to_string();
                        match self.in_flight.get(&key) {
                            Some(token) => {
                                info!("client cancelled request {}", key);
                                token.cancel();
                            }
                            None => debug!("cancel for unknown or finished request {}", key),
                        }
                    }
                    _ => debug!("ignoring malformed cancel notification"),
                }
            }
            other => debug!("ignoring notification {}", other),
        }
    }

    fn prepare_call(&self, params: Option<Value>) -> Result<Dispatch, BridgeError> {
        let params = params.ok_or_else(|| BridgeError::InvalidParams("missing params".into()))?;
        let CallParams { name, arguments } = serde_json::from_value(params)
            .map_err(|e| BridgeError::InvalidParams(e.to_string()))?;

        let capability = self
            .registry
            .get(&name)
            .ok_or(BridgeError::UnknownCapability(name))?;

        if let Err(problems) = validate_arguments(&capability.input_schema(), &arguments) {
            warn!("rejecting {} call: {}", capability.name(), problems.join("; "));
            let result = validation_failure(capability.name(), &problems);
            return Ok(Dispatch::Reply(json!(result)));
        }

        Ok(Dispatch::Invoke {
            capability,
            arguments,
        })
    }

    fn spawn_invocation<W>(
        &self,
        tasks: &mut JoinSet<()>,
        id: Value,
        capability: Arc<dyn Capability>,
        arguments: Value,
        writer: ResponseWriter<W>,
    ) -> Result<(), BridgeError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let key = id.to_string();
        let cancel = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::InvalidRequest(format!(
                    "request id {key} is already in flight"
                )))
            }
            Entry::Vacant(slot) => {
                let cancel = self.shutdown.child_token();
                slot.insert(cancel.clone());
                cancel
            }
        };
        let in_flight = Arc::clone(&self.in_flight);

        tasks.spawn(async move {
            let result = capability.invoke(arguments, cancel).await;
            in_flight.remove(&key);

            let response = match serde_json::to_value(&result) {
                Ok(payload) => JsonRpcResponse::success(id, payload),
                Err(e) => JsonRpcResponse::failure(
                    id,
                    JsonRpcError {
                        code: codes::INTERNAL_ERROR,
                        message: e.to_string(),
                        data: None,
                    },
                ),
            };
            if let Err(e) = writer.send(&response).await {
                warn!("could not deliver response for request {}: {}", key, e);
            }
        });
        Ok(())
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {},
                "resources": {}
            },
            "serverInfo": {
                "name": self.info.name,
                "version": self.info.version
            }
        })
    }

    fn mark_serving(&mut self) {
        if self.state == SessionState::Connected {
            self.transition(SessionState::Serving);
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!("session {:?} → {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::SearchCommandConfig;
    use std::time::Duration;
    use tokio::io::{
        duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf,
        WriteHalf,
    };
    use tokio::task::JoinHandle;

    type Served = (SessionState, Result<(), BridgeError>);

    struct Client {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        tx: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn send(&mut self, message: Value) {
            let mut line = message.to_string();
            line.push('\n');
            self.tx.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, line: &[u8]) {
            self.tx.write_all(line).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
                .await
                .expect("timed out waiting for a response")
                .unwrap()
                .expect("server closed the stream");
            serde_json::from_str(&line).unwrap()
        }

        async fn request(&mut self, id: u64, method: &str, params: Value) -> Value {
            self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
                .await;
            self.recv().await
        }

        async fn handshake(&mut self) {
            let resp = self
                .request(0, "initialize", json!({ "protocolVersion": PROTOCOL_VERSION }))
                .await;
            assert_eq!(resp["id"], 0);
            self.send(json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
                .await;
        }

        async fn hang_up(&mut self) {
            self.tx.shutdown().await.unwrap();
        }
    }

    /// Start a dispatcher whose `search` runs `sh -c <script> sh search <query> --json`.
    fn start(script: &str) -> (Client, JoinHandle<Served>) {
        let config = BridgeConfig {
            search: SearchCommandConfig {
                command: "sh".into(),
                args: vec!["-c".into(), script.into(), "sh".into()],
                output_flag: "--json".into(),
            },
            timeout_secs: 20,
            ..Default::default()
        };
        let mut dispatcher = SessionDispatcher::new(
            CapabilityRegistry::builtin(&config).unwrap(),
            ServerInfo::from_config(&config),
        );

        let (client_io, server_io) = duplex(64 * 1024);
        let (server_rx, server_tx) = tokio::io::split(server_io);
        let transport = StdioTransport::new(server_rx, server_tx);
        let handle = tokio::spawn(async move {
            let outcome = dispatcher.serve(transport).await;
            (dispatcher.state(), outcome)
        });

        let (client_rx, client_tx) = tokio::io::split(client_io);
        let client = Client {
            lines: BufReader::new(client_rx).lines(),
            tx: client_tx,
        };
        (client, handle)
    }

    fn call(query: &str) -> Value {
        json!({ "name": "search", "arguments": { "query": query } })
    }

    #[tokio::test]
    async fn handshake_reports_server_identity() {
        let (mut client, _server) = start("true");
        let resp = client
            .request(1, "initialize", json!({ "protocolVersion": PROTOCOL_VERSION }))
            .await;

        assert_eq!(resp["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(resp["result"]["serverInfo"]["name"], "local-search");
        assert!(resp["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_returns_the_search_descriptor() {
        let (mut client, _server) = start("true");
        client.handshake().await;

        let resp = client.request(1, "tools/list", json!({})).await;
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "search");
        assert!(!tools[0]["description"].as_str().unwrap().is_empty());
        assert_eq!(tools[0]["inputSchema"]["properties"]["query"]["type"], "string");
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["query"]));
    }

    #[tokio::test]
    async fn requests_before_handshake_are_rejected() {
        let (mut client, _server) = start("true");

        let resp = client.request(1, "tools/list", json!({})).await;
        assert_eq!(resp["error"]["code"], codes::NOT_INITIALIZED);

        let pong = client.request(2, "ping", json!({})).await;
        assert_eq!(pong["result"], json!({}));
    }

    #[tokio::test]
    async fn search_returns_stdout_verbatim() {
        let (mut client, _server) = start("printf 'results for %s\\n' \"$2\"");
        client.handshake().await;

        let resp = client.request(1, "tools/call", call("rust tokio")).await;
        let result = &resp["result"];
        assert_eq!(result["content"].as_array().unwrap().len(), 1);
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(result["content"][0]["text"], "results for rust tokio\n");
        assert!(result.get("isError").is_none());
    }

    #[tokio::test]
    async fn failing_search_is_content_not_a_fault() {
        let (mut client, _server) = start("echo 'rate limited' >&2; exit 2");
        client.handshake().await;

        let resp = client.request(1, "tools/call", call("anything")).await;
        assert!(resp.get("error").is_none());
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(
            resp["result"]["content"][0]["text"],
            "Search failed: rate limited\n"
        );

        // The session keeps serving after a failed search.
        let pong = client.request(2, "ping", json!({})).await;
        assert_eq!(pong["id"], 2);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_protocol_fault() {
        let (mut client, _server) = start("true");
        client.handshake().await;

        let resp = client
            .request(
                1,
                "tools/call",
                json!({ "name": "delete-everything", "arguments": {} }),
            )
            .await;
        assert!(resp.get("result").is_none());
        assert_eq!(resp["error"]["code"], codes::INVALID_PARAMS);
        assert_eq!(resp["error"]["message"], "Unknown tool: delete-everything");
    }

    #[tokio::test]
    async fn missing_query_fails_validation_without_running() {
        let (mut client, _server) = start("printf ran");
        client.handshake().await;

        let resp = client
            .request(1, "tools/call", json!({ "name": "search", "arguments": {} }))
            .await;
        assert_eq!(resp["result"]["isError"], true);
        assert_eq!(
            resp["result"]["content"][0]["text"],
            "Invalid arguments for 'search': missing required property 'query'"
        );
    }

    #[tokio::test]
    async fn malformed_call_params_are_invalid_params() {
        let (mut client, _server) = start("true");
        client.handshake().await;

        let resp = client
            .request(1, "tools/call", json!({ "arguments": { "query": "x" } }))
            .await;
        assert_eq!(resp["error"]["code"], codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn concurrent_searches_do_not_share_buffers() {
        let (mut client, _server) =
            start("if [ \"$2\" = slow ]; then sleep 1; fi; printf 'out:%s' \"$2\"");
        client.handshake().await;

        client
            .send(json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": call("slow") }))
            .await;
        client
            .send(json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": call("fast") }))
            .await;

        let first = client.recv().await;
        let second = client.recv().await;

        // The slow call does not hold up the fast one.
        assert_eq!(first["id"], 2);
        assert_eq!(first["result"]["content"][0]["text"], "out:fast");
        assert_eq!(second["id"], 1);
        assert_eq!(second["result"]["content"][0]["text"], "out:slow");
    }

    #[tokio::test]
    async fn garbage_line_gets_a_parse_error() {
        let (mut client, _server) = start("true");
        client.send_raw(b"{this is not json\n").await;

        let resp = client.recv().await;
        assert!(resp["id"].is_null());
        assert_eq!(resp["error"]["code"], codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn invalid_utf8_line_gets_a_parse_error_and_the_session_survives() {
        let (mut client, _server) = start("true");
        client.handshake().await;

        client
            .send_raw(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\",\"x\":\"\xff\xfe\"}\n")
            .await;
        let resp = client.recv().await;
        assert!(resp["id"].is_null());
        assert_eq!(resp["error"]["code"], codes::PARSE_ERROR);

        let pong = client.request(2, "ping", json!({})).await;
        assert_eq!(pong["id"], 2);
        assert_eq!(pong["result"], json!({}));
    }

    #[tokio::test]
    async fn non_request_json_gets_invalid_request() {
        let (mut client, _server) = start("true");
        client.send_raw(b"{\"hello\": \"world\"}\n").await;

        let resp = client.recv().await;
        assert_eq!(resp["error"]["code"], codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (mut client, _server) = start("true");
        client.handshake().await;

        let resp = client.request(1, "prompts/list", json!({})).await;
        assert_eq!(resp["error"]["code"], codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn resources_list_is_empty() {
        let (mut client, _server) = start("true");
        client.handshake().await;

        let resp = client.request(1, "resources/list", json!({})).await;
        assert_eq!(resp["result"]["resources"], json!([]));
    }

    #[tokio::test]
    async fn string_request_ids_are_echoed() {
        let (mut client, _server) = start("true");
        client
            .send(json!({ "jsonrpc": "2.0", "id": "req-α", "method": "ping" }))
            .await;
        let resp = client.recv().await;
        assert_eq!(resp["id"], "req-α");
    }

    #[tokio::test]
    async fn client_cancel_kills_that_invocation() {
        let (mut client, _server) = start("sleep 30");
        client.handshake().await;

        client
            .send(json!({ "jsonrpc": "2.0", "id": 5, "method": "tools/call", "params": call("x") }))
            .await;
        client
            .send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/cancelled",
                "params": { "requestId": 5, "reason": "user aborted" }
            }))
            .await;

        let resp = client.recv().await;
        assert_eq!(resp["id"], 5);
        assert_eq!(resp["result"]["content"][0]["text"], "Search failed: cancelled");
    }

    #[tokio::test]
    async fn reused_in_flight_id_is_rejected_and_the_first_call_stays_cancellable() {
        let (mut client, _server) = start("sleep 30");
        client.handshake().await;

        client
            .send(json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": call("a") }))
            .await;
        let dup = client.request(3, "tools/call", call("b")).await;
        assert_eq!(dup["id"], 3);
        assert_eq!(dup["error"]["code"], codes::INVALID_REQUEST);

        client
            .send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/cancelled",
                "params": { "requestId": 3 }
            }))
            .await;
        let resp = client.recv().await;
        assert_eq!(resp["id"], 3);
        assert_eq!(resp["result"]["content"][0]["text"], "Search failed: cancelled");
    }

    #[tokio::test]
    async fn hang_up_terminates_and_cancels_in_flight_work() {
        let (mut client, server) = start("sleep 30");
        client.handshake().await;

        client
            .send(json!({ "jsonrpc": "2.0", "id": 9, "method": "tools/call", "params": call("x") }))
            .await;
        client.hang_up().await;

        let resp = client.recv().await;
        assert_eq!(resp["id"], 9);
        assert_eq!(resp["result"]["isError"], true);

        let (state, outcome) = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("dispatcher did not shut down")
            .unwrap();
        assert_eq!(state, SessionState::Terminated);
        assert!(outcome.is_ok());
    }
}
