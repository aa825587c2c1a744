//! Client transports
//!
//! Establishes the stream a [`Client`] talks over and drives the connection
//! state machine around it. The process transport launches the server as a
//! child and waits for its readiness marker on stderr; the socket transport
//! dials TCP and treats the completed handshake as ready.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ProcessConfig, SocketConfig};
use crate::error::TransportError;
use crate::mcp::client::Client;
use crate::mcp::lifecycle::{ConnectionState, LinkState};

/// A running child server
struct ProcessSession {
    child: Child,
    client: Client,
    stderr_task: JoinHandle<()>,
}

/// Talks to a server launched as a child process over its stdin/stdout
pub struct ProcessTransport {
    config: ProcessConfig,
    state: LinkState,
    session: Option<ProcessSession>,
}

impl ProcessTransport {
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            state: LinkState::default(),
            session: None,
        }
    }

    /// Launch the server and wait for it to announce readiness
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        begin_connect(&self.state)?;
        info!("Launching server {}", self.config.command.display());

        let session = match self.launch().await {
            Ok(session) => session,
            Err(e) => {
                self.state.mark_disconnected();
                return Err(e);
            }
        };

        // The read loop may already have seen the child exit.
        if !self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Ready)
        {
            let mut session = session;
            session.client.close().await;
            let _ = session.child.kill().await;
            session.stderr_task.abort();
            self.state.mark_disconnected();
            return Err(TransportError::ExitedBeforeReady);
        }

        info!(pid = ?session.child.id(), "Server ready");
        self.session = Some(session);
        Ok(())
    }

    async fn launch(&self) -> Result<ProcessSession, TransportError> {
        let command = self.config.command.display().to_string();
        let spawn_failed = |reason: String| TransportError::SpawnFailed {
            command: command.clone(),
            reason,
        };

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stderr".to_string()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let stderr_task = tokio::spawn(watch_stderr(
            stderr,
            self.config.ready_marker.clone(),
            ready_tx,
        ));

        match tokio::time::timeout(self.config.startup_timeout, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(TransportError::ExitedBeforeReady);
            }
            Err(_) => {
                warn!(
                    "Server did not signal readiness within {:?}",
                    self.config.startup_timeout
                );
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(TransportError::StartupTimeout {
                    timeout_ms: self.config.startup_timeout.as_millis() as u64,
                });
            }
        }

        let client = Client::with_state(stdout, stdin, self.config.client.clone(), self.state.clone());
        Ok(ProcessSession {
            child,
            client,
            stderr_task,
        })
    }

    /// Client for the running server
    pub fn client(&self) -> Result<Client, TransportError> {
        match &self.session {
            Some(session) if self.state.is_ready() => Ok(session.client.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Fail pending calls, close the child's stdin and wait for it to exit.
    ///
    /// A child still running after the shutdown timeout is killed.
    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(mut session) = self.session.take() else {
            self.state.mark_disconnected();
            return Ok(());
        };
        self.state
            .transition(ConnectionState::Ready, ConnectionState::Disconnecting);

        session.client.close().await;

        match tokio::time::timeout(self.config.shutdown_timeout, session.child.wait()).await {
            Ok(Ok(status)) => info!("Server exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for server exit: {}", e),
            Err(_) => {
                warn!(
                    "Server still running after {:?}, killing it",
                    self.config.shutdown_timeout
                );
                if let Err(e) = session.child.kill().await {
                    warn!("Failed to kill server: {}", e);
                }
            }
        }

        session.stderr_task.abort();
        self.state.mark_disconnected();
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn link_state(&self) -> &LinkState {
        &self.state
    }
}

/// Forward child stderr to tracing, firing `ready` on the first marker line.
///
/// Dropping `ready` unsent tells the connecting side that stderr closed first.
async fn watch_stderr(stderr: ChildStderr, marker: String, ready: oneshot::Sender<()>) {
    let mut ready = Some(ready);
    let mut lines = BufReader::new(stderr).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.contains(&marker) {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
                info!(target: "toolwire::child", "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading server stderr: {}", e);
                break;
            }
        }
    }
}

/// Talks to a server over a TCP connection
pub struct SocketTransport {
    config: SocketConfig,
    state: LinkState,
    client: Option<Client>,
}

impl SocketTransport {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            state: LinkState::default(),
            client: None,
        }
    }

    /// Dial the server
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        begin_connect(&self.state)?;
        info!("Connecting to {}", self.config.addr);

        let stream = match tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.mark_disconnected();
                return Err(TransportError::ConnectFailed {
                    addr: self.config.addr.clone(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.state.mark_disconnected();
                return Err(TransportError::StartupTimeout {
                    timeout_ms: self.config.connect_timeout.as_millis() as u64,
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let client = Client::with_state(reader, writer, self.config.client.clone(), self.state.clone());
        if !self
            .state
            .transition(ConnectionState::Connecting, ConnectionState::Ready)
        {
            client.close().await;
            self.state.mark_disconnected();
            return Err(TransportError::ConnectFailed {
                addr: self.config.addr.clone(),
                reason: "connection closed during setup".to_string(),
            });
        }

        info!("Connected to {}", self.config.addr);
        self.client = Some(client);
        Ok(())
    }

    pub fn client(&self) -> Result<Client, TransportError> {
        match &self.client {
            Some(client) if self.state.is_ready() => Ok(client.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Fail pending calls and close the socket
    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(client) = self.client.take() {
            self.state
                .transition(ConnectionState::Ready, ConnectionState::Disconnecting);
            client.close().await;
            info!("Disconnected from {}", self.config.addr);
        }
        self.state.mark_disconnected();
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn link_state(&self) -> &LinkState {
        &self.state
    }
}

/// Either transport, chosen at runtime
pub enum Transport {
    Process(ProcessTransport),
    Socket(SocketTransport),
}

impl Transport {
    pub fn process(config: ProcessConfig) -> Self {
        Transport::Process(ProcessTransport::new(config))
    }

    pub fn socket(config: SocketConfig) -> Self {
        Transport::Socket(SocketTransport::new(config))
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        match self {
            Transport::Process(transport) => transport.connect().await,
            Transport::Socket(transport) => transport.connect().await,
        }
    }

    pub fn client(&self) -> Result<Client, TransportError> {
        match self {
            Transport::Process(transport) => transport.client(),
            Transport::Socket(transport) => transport.client(),
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        match self {
            Transport::Process(transport) => transport.disconnect().await,
            Transport::Socket(transport) => transport.disconnect().await,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Transport::Process(transport) => transport.state(),
            Transport::Socket(transport) => transport.state(),
        }
    }
}

fn begin_connect(state: &LinkState) -> Result<(), TransportError> {
    if state.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
        Ok(())
    } else {
        Err(TransportError::InvalidState {
            action: "connect",
            state: state.get().to_string(),
        })
    }
}
