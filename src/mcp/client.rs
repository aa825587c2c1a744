//! Tool client
//!
//! Sends framed requests and matches responses to callers strictly by
//! correlation id, so overlapping calls on one stream never see each other's
//! results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{CallError, FramingError};
use crate::mcp::framing::{encode_frame, FrameReader, FrameWriter};
use crate::mcp::lifecycle::{ConnectionState, LinkState};
use crate::mcp::types::{Request, Response, ToolDescriptor, LIST_TOOLS};

/// Frames buffered between callers and the writer task
const OUTBOUND_QUEUE: usize = 64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<Response, CallError>>;

/// In-flight calls, keyed by request id
#[derive(Default)]
struct PendingCalls {
    table: Mutex<PendingTable>,
}

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<String, Waiter>,
    closed: bool,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        // Critical sections never panic mid-update, so a poisoned table is still consistent.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, id: &str) -> Result<oneshot::Receiver<Result<Response, CallError>>, CallError> {
        let mut table = self.lock();
        if table.closed {
            return Err(CallError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(id.to_string(), tx);
        Ok(rx)
    }

    fn remove(&self, id: &str) -> Option<Waiter> {
        self.lock().waiters.remove(id)
    }

    /// Deliver a response to its waiter. False if nobody is waiting for it.
    fn resolve(&self, response: Response) -> bool {
        match self.remove(&response.id) {
            Some(waiter) => waiter.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    /// Fail every waiter with `ConnectionClosed` and refuse new calls
    fn fail_all(&self) -> usize {
        let waiters: Vec<Waiter> = {
            let mut table = self.lock();
            table.closed = true;
            table.waiters.drain().map(|(_, waiter)| waiter).collect()
        };
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(CallError::ConnectionClosed));
        }
        count
    }

    fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// Removes a call's table entry when the call finishes, times out or is dropped
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

struct ClientInner {
    outbound: mpsc::Sender<Vec<u8>>,
    /// Set once the stream is going away; the writer task then closes the write half
    closing: Arc<watch::Sender<bool>>,
    pending: Arc<PendingCalls>,
    state: LinkState,
    config: ClientConfig,
    reader_task: JoinHandle<()>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.pending.fail_all();
        self.closing.send_replace(true);
    }
}

/// Handle to one client stream. Cheap to clone; clones share the stream.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start a client over an already-established stream
    pub fn connect<R, W>(reader: R, writer: W, config: ClientConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_state(reader, writer, config, LinkState::new(ConnectionState::Ready))
    }

    /// Start a client whose read loop reports into a transport's state
    pub fn with_state<R, W>(reader: R, writer: W, config: ClientConfig, state: LinkState) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending = Arc::new(PendingCalls::default());
        let (closing, _) = watch::channel(false);
        let closing = Arc::new(closing);
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);

        let writer: BoxedWriter = Box::new(writer);
        let writer_task = tokio::spawn(write_loop(
            FrameWriter::new(writer),
            queue,
            closing.subscribe(),
            pending.clone(),
            state.clone(),
        ));
        let reader_task = tokio::spawn(read_loop(
            FrameReader::new(reader, config.max_line_bytes),
            pending.clone(),
            state.clone(),
            closing.clone(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                outbound,
                closing,
                pending,
                state,
                config,
                reader_task,
                writer_task: Mutex::new(Some(writer_task)),
            }),
        }
    }

    /// Invoke a tool with the configured timeout
    pub async fn call(&self, tool: &str, params: Value) -> Result<Response, CallError> {
        self.call_with_timeout(tool, params, self.inner.config.call_timeout)
            .await
    }

    /// Invoke a tool with an explicit timeout budget.
    ///
    /// Only the writer task touches the stream, so a call that times out or is
    /// dropped never leaves a partial frame in front of the next request.
    pub async fn call_with_timeout(
        &self,
        tool: &str,
        params: Value,
        budget: Duration,
    ) -> Result<Response, CallError> {
        let id = Uuid::new_v4().to_string();
        let request = Request::new(id.as_str(), tool, params);
        let frame = encode_frame(&request).map_err(|e| match e {
            FramingError::Encode { message } => CallError::Encode { message },
            other => CallError::Encode {
                message: other.to_string(),
            },
        })?;

        let rx = self.inner.pending.insert(&id)?;
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id: &id,
        };

        let exchange = async {
            // A frame is queued whole or not at all.
            self.inner
                .outbound
                .send(frame)
                .await
                .map_err(|_| CallError::ConnectionClosed)?;
            debug!(request_id = %id, tool, "Queued request");

            rx.await.unwrap_or(Err(CallError::ConnectionClosed))
        };

        match tokio::time::timeout(budget, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id = %id, tool, "Request timed out after {:?}", budget);
                Err(CallError::Timeout {
                    tool: tool.to_string(),
                    timeout_ms: budget.as_millis() as u64,
                })
            }
        }
    }

    /// Invoke a tool and decode its text payload as `T`.
    ///
    /// Error responses become `CallError::ToolFailed`. A payload that is not
    /// JSON is offered to `T` as a plain string.
    pub async fn invoke<T: DeserializeOwned>(&self, tool: &str, params: Value) -> Result<T, CallError> {
        let response = self.call(tool, params).await?;
        let text = response.first_text().unwrap_or_default();

        if response.is_error {
            return Err(CallError::ToolFailed {
                tool: tool.to_string(),
                message: text.strip_prefix("Error: ").unwrap_or(text).to_string(),
            });
        }

        serde_json::from_str(text)
            .or_else(|_| serde_json::from_value(Value::String(text.to_string())))
            .map_err(|e| CallError::InvalidPayload {
                tool: tool.to_string(),
                message: e.to_string(),
            })
    }

    /// Discover the server's tools
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, CallError> {
        self.invoke(LIST_TOOLS, json!({})).await
    }

    /// Fail every pending call, refuse new ones and close the write half.
    ///
    /// A standalone client ends `Disconnected`; a transport that is already
    /// `Disconnecting` finishes the transition itself.
    pub async fn close(&self) {
        let failed = self.inner.pending.fail_all();
        if failed > 0 {
            info!("Cancelled {} pending call(s) on close", failed);
        }
        self.inner.reader_task.abort();
        self.inner
            .state
            .transition(ConnectionState::Ready, ConnectionState::Disconnected);
        self.inner.closing.send_replace(true);

        let writer_task = self
            .inner
            .writer_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(writer_task) = writer_task {
            if let Err(e) = writer_task.await {
                debug!("Writer task ended abnormally: {}", e);
            }
        }
    }

    /// Number of calls awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn link_state(&self) -> &LinkState {
        &self.inner.state
    }
}

/// Write queued frames in order until the stream closes.
///
/// `closing` only ever flips to `true`, so any change means stop.
async fn write_loop(
    mut frames: FrameWriter<BoxedWriter>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    mut closing: watch::Receiver<bool>,
    pending: Arc<PendingCalls>,
    state: LinkState,
) {
    loop {
        let frame = tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closing.changed() => break,
        };

        // A half-written frame is only abandoned when the stream is closing anyway.
        let written = tokio::select! {
            written = frames.write_encoded(&frame) => written,
            _ = closing.changed() => break,
        };

        if let Err(e) = written {
            error!("Failed to send request: {}", e);
            state.mark_disconnected();
            let failed = pending.fail_all();
            if failed > 0 {
                warn!("Failed {} pending call(s): connection closed", failed);
            }
            break;
        }
    }

    if let Err(e) = frames.shutdown().await {
        debug!("Error closing client stream: {}", e);
    }
}

/// Decode responses and route them to waiters until the stream ends
async fn read_loop<R>(
    mut frames: FrameReader<R>,
    pending: Arc<PendingCalls>,
    state: LinkState,
    closing: Arc<watch::Sender<bool>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match frames.read_frame().await {
            Ok(Some(frame)) => match serde_json::from_value::<Response>(frame) {
                Ok(response) => {
                    let id = response.id.clone();
                    if pending.resolve(response) {
                        debug!(request_id = %id, "Delivered response");
                    } else {
                        warn!(request_id = %id, "Discarding response for unknown or expired request");
                    }
                }
                Err(e) => warn!("Ignoring message that is not a response: {}", e),
            },
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                error!("Closing connection: {}", e);
                break;
            }
        }
    }

    state.mark_disconnected();
    let failed = pending.fail_all();
    if failed > 0 {
        warn!("Failed {} pending call(s): connection closed", failed);
    }
    closing.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct FakeServer {
        frames: FrameReader<ReadHalf<DuplexStream>>,
        writer: FrameWriter<WriteHalf<DuplexStream>>,
    }

    impl FakeServer {
        async fn next_request(&mut self) -> Request {
            let frame = self.frames.read_frame().await.unwrap().unwrap();
            serde_json::from_value(frame).unwrap()
        }

        async fn reply(&mut self, response: Response) {
            self.writer.write_frame(&response).await.unwrap();
        }
    }

    fn pair(call_timeout: Duration) -> (Client, FakeServer) {
        pair_with_buffer(64 * 1024, call_timeout)
    }

    /// Client and fake server over a duplex pipe holding at most `buffer` bytes per direction
    fn pair_with_buffer(buffer: usize, call_timeout: Duration) -> (Client, FakeServer) {
        let (client_side, server_side) = tokio::io::duplex(buffer);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (server_read, server_write) = tokio::io::split(server_side);

        let config = ClientConfig {
            call_timeout,
            max_line_bytes: 64 * 1024,
        };
        let client = Client::connect(client_read, client_write, config);
        let server = FakeServer {
            frames: FrameReader::new(server_read, 64 * 1024),
            writer: FrameWriter::new(server_write),
        };
        (client, server)
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (client, mut server) = pair(Duration::from_secs(5));

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.call("slow", json!({})).await }
        });
        let req_a = server.next_request().await;
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.call("fast", json!({})).await }
        });
        let req_b = server.next_request().await;
        assert_ne!(req_a.id, req_b.id);

        let (slow, fast) = if req_a.tool == "slow" {
            (req_a, req_b)
        } else {
            (req_b, req_a)
        };
        server.reply(Response::text(fast.id.clone(), "fast result")).await;
        server.reply(Response::text(slow.id.clone(), "slow result")).await;

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.first_text(), Some("slow result"));
        assert_eq!(second.first_text(), Some("fast result"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_id_is_discarded() {
        let (client, mut server) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("echo", json!({"text": "hi"})).await }
        });
        let request = server.next_request().await;
        server.reply(Response::text("someone-else", "not yours")).await;
        server.reply(Response::text(request.id.clone(), "yours")).await;

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.id, request.id);
        assert_eq!(response.first_text(), Some("yours"));
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_late_reply_is_dropped() {
        let (client, mut server) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .call_with_timeout("slow", json!({}), Duration::from_millis(50))
                    .await
            }
        });
        let request = server.next_request().await;
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            CallError::Timeout {
                tool: "slow".to_string(),
                timeout_ms: 50
            }
        );
        assert_eq!(client.pending_count(), 0);

        server.reply(Response::text(request.id, "too late")).await;

        let next = tokio::spawn({
            let client = client.clone();
            async move { client.call("echo", json!({})).await }
        });
        let request = server.next_request().await;
        server.reply(Response::text(request.id, "on time")).await;
        assert_eq!(next.await.unwrap().unwrap().first_text(), Some("on time"));
    }

    #[tokio::test]
    async fn test_dropped_call_is_cancelled() {
        let (client, mut server) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("slow", json!({})).await }
        });
        server.next_request().await;
        assert_eq!(client.pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_calls() {
        let (client, mut server) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("slow", json!({})).await }
        });
        server.next_request().await;
        drop(server);

        assert_eq!(call.await.unwrap().unwrap_err(), CallError::ConnectionClosed);
        client
            .link_state()
            .wait_for(ConnectionState::Disconnected)
            .await;
        assert_eq!(
            client.call("echo", json!({})).await.unwrap_err(),
            CallError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_server_eof_fails_pending() {
        let (client, mut server) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("echo", json!({})).await }
        });
        server.next_request().await;
        server.writer.shutdown().await.unwrap();

        assert_eq!(call.await.unwrap().unwrap_err(), CallError::ConnectionClosed);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_line_from_server_closes_stream() {
        let (client, mut server) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("echo", json!({})).await }
        });
        server.next_request().await;
        server.writer.write_encoded(b"{broken\n").await.unwrap();

        assert_eq!(call.await.unwrap().unwrap_err(), CallError::ConnectionClosed);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let eof = tokio::time::timeout(Duration::from_secs(1), server.frames.read_frame())
            .await
            .unwrap();
        assert!(eof.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timeout_mid_write_keeps_stream_framed() {
        let (client, mut server) = pair_with_buffer(64, Duration::from_secs(5));
        let large = "x".repeat(10_000);

        // Nobody reads yet, so the first frame stalls after 64 bytes.
        let err = client
            .call_with_timeout("echo", json!({"text": large}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout { timeout_ms: 50, .. }));

        let second = tokio::spawn({
            let client = client.clone();
            async move { client.call("echo", json!({"text": "small"})).await }
        });

        let first = server.next_request().await;
        assert_eq!(first.params["text"].as_str().map(str::len), Some(10_000));
        let next = server.next_request().await;
        assert_eq!(next.params["text"], "small");

        server.reply(Response::text(first.id, "too late")).await;
        server.reply(Response::text(next.id, "on time")).await;
        assert_eq!(second.await.unwrap().unwrap().first_text(), Some("on time"));
        assert_eq!(client.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_cancel_mid_write_keeps_stream_framed() {
        let (client, mut server) = pair_with_buffer(64, Duration::from_secs(5));
        let large = "y".repeat(10_000);

        let stalled = tokio::spawn({
            let client = client.clone();
            async move { client.call("echo", json!({"text": large})).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stalled.abort();
        let _ = stalled.await;
        assert_eq!(client.pending_count(), 0);

        let second = tokio::spawn({
            let client = client.clone();
            async move { client.call("echo", json!({"text": "after"})).await }
        });

        let first = server.next_request().await;
        assert_eq!(first.params["text"].as_str().map(str::len), Some(10_000));
        let next = server.next_request().await;
        server.reply(Response::text(next.id, "after")).await;
        assert_eq!(second.await.unwrap().unwrap().first_text(), Some("after"));
    }

    #[tokio::test]
    async fn test_close_fails_in_flight_calls() {
        let (client, mut server) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call("slow", json!({})).await }
        });
        server.next_request().await;

        client.close().await;
        assert_eq!(call.await.unwrap().unwrap_err(), CallError::ConnectionClosed);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(
            client.call("echo", json!({})).await.unwrap_err(),
            CallError::ConnectionClosed
        );
        assert!(server.frames.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invoke_decodes_payloads() {
        let (client, mut server) = pair(Duration::from_secs(5));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.invoke::<Value>("echo", json!({"text": "hi"})).await }
        });
        let request = server.next_request().await;
        server
            .reply(Response::text(request.id, "{\"echoed\":\"hi\"}"))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), json!({"echoed": "hi"}));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.invoke::<String>("greet", json!({})).await }
        });
        let request = server.next_request().await;
        server.reply(Response::text(request.id, "hello there")).await;
        assert_eq!(call.await.unwrap().unwrap(), "hello there");

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.invoke::<Value>("missing", json!({})).await }
        });
        let request = server.next_request().await;
        server
            .reply(Response::error(request.id, "Tool missing not found"))
            .await;
        assert_eq!(
            call.await.unwrap().unwrap_err(),
            CallError::ToolFailed {
                tool: "missing".to_string(),
                message: "Tool missing not found".to_string()
            }
        );
    }
}
