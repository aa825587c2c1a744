//! Tool server implementation
//!
//! Decodes requests, validates params, runs handlers and frames responses.
//! Serves stdio for a spawned child process and TCP for socket clients.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, READY_MARKER};
use crate::error::{HandlerError, Result};
use crate::mcp::framing::{FrameReader, FrameWriter};
use crate::mcp::registry::ToolRegistry;
use crate::mcp::types::{Request, Response, LIST_TOOLS};

/// Responses buffered between handler tasks and the writer
const OUTBOUND_QUEUE: usize = 64;

/// Routes requests to registered tools
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Produce exactly one response for a request. Never fails.
    pub async fn dispatch(&self, request: Request) -> Response {
        let Request { id, tool, params } = request;

        if tool == LIST_TOOLS {
            return self.handle_list_tools(id);
        }

        let entry = match self.registry.get(&tool) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(request_id = %id, "{}", e);
                return Response::error(id, e.to_string());
            }
        };

        if let Err(e) = entry.schema.validate(&params) {
            debug!(request_id = %id, tool = %tool, "Rejected params: {}", e);
            return Response::error(id, e.to_string());
        }

        let outcome = AssertUnwindSafe(async move { entry.call(params).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => Response::text(id, render_result(value)),
            Ok(Err(cause)) => {
                let err = HandlerError::Failed {
                    tool,
                    message: format!("{:#}", cause),
                };
                warn!(request_id = %id, "{}", err);
                Response::error(id, err.to_string())
            }
            Err(_) => {
                let err = HandlerError::Panicked { tool };
                error!(request_id = %id, "{}", err);
                Response::error(id, err.to_string())
            }
        }
    }

    fn handle_list_tools(&self, id: String) -> Response {
        match serde_json::to_string(&self.registry.list()) {
            Ok(text) => Response::text(id, text),
            Err(e) => Response::error(id, format!("Failed to list tools: {}", e)),
        }
    }
}

/// Strings are returned verbatim, anything else as JSON text
fn render_result(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// Tool server, shareable across connections
#[derive(Clone)]
pub struct ToolServer {
    dispatcher: Dispatcher,
    config: ServerConfig,
}

impl ToolServer {
    /// Create a server that owns the given registry
    pub fn new(registry: ToolRegistry, config: ServerConfig) -> Self {
        Self::with_registry(Arc::new(registry), config)
    }

    /// Create a server over an already-shared registry
    pub fn with_registry(registry: Arc<ToolRegistry>, config: ServerConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry),
            config,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run the server on stdio
    pub async fn run_stdio(&self) -> Result<()> {
        announce_ready(self.dispatcher.registry());
        info!(
            "Serving {} tools on stdio",
            self.dispatcher.registry().len()
        );

        self.serve_connection(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Serve one connection until the peer closes it.
    ///
    /// Each request runs on its own task; responses are written by a single
    /// writer task. A framing error tears the connection down immediately.
    pub async fn serve_connection<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Response>(OUTBOUND_QUEUE);

        let writer_task = tokio::spawn(async move {
            let mut frames = FrameWriter::new(writer);
            while let Some(response) = rx.recv().await {
                if let Err(e) = frames.write_frame(&response).await {
                    warn!(request_id = %response.id, "Failed to write response: {}", e);
                    return;
                }
            }
            let _ = frames.shutdown().await;
        });

        let mut frames = FrameReader::new(reader, self.config.max_line_bytes);
        loop {
            let frame = match frames.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    error!("Closing connection: {}", e);
                    writer_task.abort();
                    return Err(e.into());
                }
            };

            let id = frame.get("id").and_then(Value::as_str).map(str::to_string);
            match serde_json::from_value::<Request>(frame) {
                Ok(request) => {
                    debug!(request_id = %request.id, tool = %request.tool, "Received request");
                    let dispatcher = self.dispatcher.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = dispatcher.dispatch(request).await;
                        if tx.send(response).await.is_err() {
                            debug!("Connection closed before response could be sent");
                        }
                    });
                }
                Err(e) => match id {
                    Some(id) => {
                        let response = Response::error(id, format!("Invalid request: {}", e));
                        if tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    None => warn!("Dropping message without an id: {}", e),
                },
            }
        }

        // In-flight handlers still hold senders; the writer drains them.
        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }
}

/// TCP front end: one concurrent dispatcher task per accepted connection
pub struct TcpServer {
    listener: TcpListener,
    server: ToolServer,
}

impl TcpServer {
    pub async fn bind(addr: &str, server: ToolServer) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, server })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        announce_ready(self.server.dispatcher().registry());
        info!("Listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            info!(%peer, "Client connected");
            let server = self.server.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                match server.serve_connection(reader, writer).await {
                    Ok(()) => info!(%peer, "Client disconnected"),
                    Err(e) => warn!(%peer, "Connection dropped: {}", e),
                }
            });
        }
    }
}

/// Print the readiness marker the process transport waits for
fn announce_ready(registry: &ToolRegistry) {
    eprintln!("{} {:?}", READY_MARKER, registry.names());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::schema::Schema;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn test_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "echo",
                "Echo text back",
                Schema::object().property("text", Schema::string()),
                |params| async move { Ok(json!({"echoed": params["text"]})) },
            )
            .unwrap();
        registry
            .register("greet", "Plain text result", Schema::object(), |_| async {
                Ok(json!("hello there"))
            })
            .unwrap();
        registry
            .register("fail", "Always fails", Schema::object(), |_| async {
                Err(anyhow::anyhow!("Order abc not found"))
            })
            .unwrap();
        registry
            .register("explode", "Panics", Schema::object(), explode)
            .unwrap();
        registry
    }

    async fn explode(_params: Value) -> anyhow::Result<Value> {
        panic!("handler bug")
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(test_registry()))
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let response = dispatcher()
            .dispatch(Request::new("1", "echo", json!({"text": "hi"})))
            .await;
        assert_eq!(response.id, "1");
        assert!(!response.is_error);
        assert_eq!(response.first_text(), Some("{\"echoed\":\"hi\"}"));
    }

    #[tokio::test]
    async fn test_dispatch_string_result_verbatim() {
        let response = dispatcher()
            .dispatch(Request::new("2", "greet", json!({})))
            .await;
        assert_eq!(response.first_text(), Some("hello there"));
    }

    #[tokio::test]
    async fn test_dispatch_not_found() {
        let response = dispatcher()
            .dispatch(Request::new("3", "missing", json!({})))
            .await;
        assert_eq!(response.id, "3");
        assert!(response.is_error);
        assert!(response.first_text().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_dispatch_validation_error() {
        let response = dispatcher()
            .dispatch(Request::new("4", "echo", json!({"text": 5})))
            .await;
        assert!(response.is_error);
        assert!(response.first_text().unwrap().contains("text"));
    }

    #[tokio::test]
    async fn test_dispatch_handler_error() {
        let response = dispatcher()
            .dispatch(Request::new("5", "fail", json!({})))
            .await;
        assert!(response.is_error);
        assert!(response
            .first_text()
            .unwrap()
            .contains("Order abc not found"));
    }

    #[tokio::test]
    async fn test_dispatch_handler_panic() {
        let response = dispatcher()
            .dispatch(Request::new("6", "explode", json!({})))
            .await;
        assert_eq!(response.id, "6");
        assert!(response.is_error);
        assert!(response.first_text().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_dispatch_list_tools() {
        let response = dispatcher()
            .dispatch(Request::new("7", LIST_TOOLS, json!({})))
            .await;
        let tools: Vec<Value> = serde_json::from_str(response.first_text().unwrap()).unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["echo", "greet", "fail", "explode"]);
        assert_eq!(tools[0]["parameters"]["properties"]["text"]["type"], "string");
    }

    #[tokio::test]
    async fn test_connection_answers_malformed_request_with_id() {
        let server = ToolServer::new(test_registry(), ServerConfig::default());
        let (client, server_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let serve = tokio::spawn(async move {
            server.serve_connection(server_read, server_write).await
        });

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"{\"id\":\"bad\",\"params\":{}}\n{\"id\":\"ok\",\"tool\":\"greet\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let first: Response = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.id, "bad");
        assert!(first.is_error);
        assert!(first.first_text().unwrap().contains("Invalid request"));

        let second: Response =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.id, "ok");
        assert_eq!(second.first_text(), Some("hello there"));

        client_write.shutdown().await.unwrap();
        assert!(serve.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_connection_torn_down_on_invalid_json() {
        let server = ToolServer::new(test_registry(), ServerConfig::default());
        let (client, server_side) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_side);
        let serve = tokio::spawn(async move {
            server.serve_connection(server_read, server_write).await
        });

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"{this is not json}\n").await.unwrap();

        let result = serve.await.unwrap();
        assert!(matches!(
            result,
            Err(crate::error::ToolwireError::Framing(_))
        ));

        let mut lines = BufReader::new(client_read).lines();
        assert!(lines.next_line().await.unwrap().is_none());
    }
}
