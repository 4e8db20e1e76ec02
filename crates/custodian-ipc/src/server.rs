//! Socket server
//!
//! Each connection gets a reader task that parses requests and a writer
//! task that owns the write half. Responses and events both go through the
//! writer, so lines never interleave and a subscription's response always
//! precedes its first event.

use custodian_api::{
    ClientInfo, ClientRole, ErrorCode, ErrorInfo, Event, Request, Response, ResponsePayload,
    ResponseResult,
};
use custodian_util::ClientId;
use serde::Serialize;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{IpcError, IpcResult, MAX_REQUEST_BYTES};

const EVENT_BACKLOG: usize = 128;

/// What the service receives from the socket
#[derive(Debug)]
pub enum ServerMessage {
    Request {
        client_id: ClientId,
        request: Request,
    },
    ClientConnected {
        client_id: ClientId,
        info: ClientInfo,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
}

/// Encoded line queued for one client's writer
enum Outbound {
    Response(String),
    /// Events start flowing once this is written
    Subscribed(String),
}

struct Connection {
    info: ClientInfo,
    outbound: mpsc::UnboundedSender<Outbound>,
}

type Connections = Arc<RwLock<HashMap<ClientId, Connection>>>;

pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    connections: Connections,
    /// Events are encoded once and shared by every subscriber
    events: broadcast::Sender<Arc<str>>,
    messages_tx: mpsc::UnboundedSender<ServerMessage>,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BACKLOG);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            connections: Arc::new(RwLock::new(HashMap::new())),
            events,
            messages_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket (mode 0660).
    ///
    /// A leftover socket file is replaced, but not one another instance is
    /// still answering on.
    pub async fn start(&mut self) -> IpcResult<()> {
        if self.socket_path.exists() {
            if std::os::unix::net::UnixStream::connect(&self.socket_path).is_ok() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("another instance is listening on {}", self.socket_path.display()),
                )
                .into());
            }
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;

        info!(path = %self.socket_path.display(), "IPC server listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// The receiver can be taken once
    pub async fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.messages_rx.lock().await.take()
    }

    /// Accept connections until the task is aborted
    pub async fn run(&self) -> IpcResult<()> {
        let listener = self.listener.as_ref().ok_or(IpcError::NotStarted)?;
        let service_uid = nix::unistd::getuid().as_raw();

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    // Usually descriptor exhaustion; give it a moment
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let uid = peer_uid(&stream);
            let info = ClientInfo::new(role_for_uid(uid, service_uid), uid);
            self.attach(stream, info).await;
        }
    }

    async fn attach(&self, stream: UnixStream, info: ClientInfo) {
        let client_id = info.client_id.clone();
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        debug!(client_id = %client_id, uid = ?info.uid, role = ?info.role, "Accepted connection");

        self.connections.write().await.insert(
            client_id.clone(),
            Connection {
                info: info.clone(),
                outbound: outbound_tx.clone(),
            },
        );
        let _ = self.messages_tx.send(ServerMessage::ClientConnected {
            client_id: client_id.clone(),
            info,
        });

        tokio::spawn(read_requests(
            read_half,
            client_id.clone(),
            outbound_tx,
            self.messages_tx.clone(),
            self.connections.clone(),
        ));
        tokio::spawn(write_lines(
            write_half,
            client_id,
            outbound_rx,
            self.events.clone(),
            self.messages_tx.clone(),
            self.connections.clone(),
        ));
    }

    /// Queue a response for one client. A `Subscribed` response also
    /// starts that client's event stream.
    pub async fn send_response(&self, client_id: &ClientId, response: Response) -> IpcResult<()> {
        let subscribes = matches!(
            response.result,
            ResponseResult::Ok(ResponsePayload::Subscribed { .. })
        );
        let line = encode_line(&response)?;

        let connections = self.connections.read().await;
        let connection = connections
            .get(client_id)
            .ok_or(IpcError::ConnectionClosed)?;

        let item = if subscribes {
            Outbound::Subscribed(line)
        } else {
            Outbound::Response(line)
        };
        connection
            .outbound
            .send(item)
            .map_err(|_| IpcError::ConnectionClosed)
    }

    /// Send an event to every subscribed client
    pub fn broadcast_event(&self, event: Event) {
        match encode_line(&event) {
            Ok(line) => {
                // No subscribers is fine
                let _ = self.events.send(Arc::from(line));
            }
            Err(e) => warn!(error = %e, "Failed to encode event"),
        }
    }

    pub async fn get_client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        let connections = self.connections.read().await;
        connections.get(client_id).map(|c| c.info.clone())
    }

    pub async fn client_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Remove the socket file, if this server bound it
    pub fn shutdown(&self) {
        if self.listener.is_some() && self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn read_requests(
    read_half: OwnedReadHalf,
    client_id: ClientId,
    outbound: mpsc::UnboundedSender<Outbound>,
    messages: mpsc::UnboundedSender<ServerMessage>,
    connections: Connections,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let limit = (MAX_REQUEST_BYTES + 1) as u64;

    loop {
        line.clear();
        match (&mut reader).take(limit).read_line(&mut line).await {
            Ok(0) => {
                debug!(client_id = %client_id, "Client closed connection");
                break;
            }
            Ok(_) if line.len() > MAX_REQUEST_BYTES => {
                warn!(client_id = %client_id, "Oversized request, closing connection");
                reject(&outbound, format!("request exceeds {} bytes", MAX_REQUEST_BYTES));
                break;
            }
            Ok(_) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Request>(text) {
                    Ok(request) => {
                        let message = ServerMessage::Request {
                            client_id: client_id.clone(),
                            request,
                        };
                        if messages.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "Invalid request");
                        reject(&outbound, e.to_string());
                    }
                }
            }
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "Read error");
                break;
            }
        }
    }

    // Once the last outbound sender is gone the writer drains and exits
    connections.write().await.remove(&client_id);
}

async fn write_lines(
    mut writer: OwnedWriteHalf,
    client_id: ClientId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    event_source: broadcast::Sender<Arc<str>>,
    messages: mpsc::UnboundedSender<ServerMessage>,
    connections: Connections,
) {
    let mut events: Option<broadcast::Receiver<Arc<str>>> = None;

    loop {
        let line: Arc<str> = tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Response(line)) => Arc::from(line),
                Some(Outbound::Subscribed(line)) => {
                    if events.is_none() {
                        events = Some(event_source.subscribe());
                    }
                    Arc::from(line)
                }
                None => break,
            },

            event = next_event(&mut events) => match event {
                Ok(line) => line,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(client_id = %client_id, skipped, "Subscriber lagging, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(client_id = %client_id, error = %e, "Write error");
            break;
        }
    }

    connections.write().await.remove(&client_id);
    let _ = messages.send(ServerMessage::ClientDisconnected { client_id });
}

/// Pending forever until the client subscribes
async fn next_event(
    events: &mut Option<broadcast::Receiver<Arc<str>>>,
) -> Result<Arc<str>, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Answer a line that could not be turned into a request
fn reject(outbound: &mpsc::UnboundedSender<Outbound>, message: String) {
    let response = Response::error(0, ErrorInfo::new(ErrorCode::InvalidRequest, message));
    if let Ok(line) = encode_line(&response) {
        let _ = outbound.send(Outbound::Response(line));
    }
}

fn encode_line<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Root and the service's own user may change settings
pub fn role_for_uid(peer: Option<u32>, service_uid: u32) -> ClientRole {
    match peer {
        Some(0) => ClientRole::Owner,
        Some(uid) if uid == service_uid => ClientRole::Owner,
        _ => ClientRole::Observer,
    }
}

fn peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsFd;

    nix::sys::socket::getsockopt(&stream.as_fd(), nix::sys::socket::sockopt::PeerCredentials)
        .ok()
        .map(|cred| cred.uid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IpcClient;
    use custodian_api::{Command, EventPayload};
    use tempfile::tempdir;

    #[tokio::test]
    async fn server_creates_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("sub").join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();

        assert!(socket_path.exists());
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_live_one_is_not() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        // Bound then abandoned: nobody accepts on it
        drop(std::os::unix::net::UnixListener::bind(&socket_path).unwrap());
        assert!(socket_path.exists());

        let mut first = IpcServer::new(&socket_path);
        first.start().await.unwrap();

        let mut second = IpcServer::new(&socket_path);
        match second.start().await {
            Err(IpcError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse),
            other => panic!("expected AddrInUse, got {:?}", other.map(|_| ())),
        }

        // Dropping the loser must not remove the winner's socket
        drop(second);
        assert!(socket_path.exists());
    }

    #[test]
    fn roles() {
        assert_eq!(role_for_uid(Some(0), 1000), ClientRole::Owner);
        assert_eq!(role_for_uid(Some(1000), 1000), ClientRole::Owner);
        assert_eq!(role_for_uid(Some(1001), 1000), ClientRole::Observer);
        assert_eq!(role_for_uid(None, 1000), ClientRole::Observer);
    }

    async fn serve(dir: &Path) -> (Arc<IpcServer>, PathBuf) {
        let socket_path = dir.join("custodian.sock");
        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();
        let server = Arc::new(server);
        let mut messages = server.take_message_receiver().await.unwrap();

        let accept = server.clone();
        tokio::spawn(async move {
            let _ = accept.run().await;
        });

        // Minimal responder: pong, or subscribed
        let responder = server.clone();
        tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                if let ServerMessage::Request { client_id, request } = msg {
                    let payload = match request.command {
                        Command::SubscribeEvents => ResponsePayload::Subscribed {
                            client_id: client_id.clone(),
                        },
                        _ => ResponsePayload::Pong,
                    };
                    let response = Response::success(request.request_id, payload);
                    let _ = responder.send_response(&client_id, response).await;
                }
            }
        });

        (server, socket_path)
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let dir = tempdir().unwrap();
        let (server, socket_path) = serve(dir.path()).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let response = client.send(Command::Ping).await.unwrap();
        assert_eq!(response.request_id, 1);
        assert!(matches!(response.result, ResponseResult::Ok(ResponsePayload::Pong)));

        assert_eq!(server.client_count().await, 1);
        drop(client);
    }

    #[tokio::test]
    async fn events_start_after_subscription() {
        let dir = tempdir().unwrap();
        let (server, socket_path) = serve(dir.path()).await;

        let client = IpcClient::connect(&socket_path).await.unwrap();

        // Not subscribed yet, so never delivered
        server.broadcast_event(Event::new(EventPayload::ConfigReloaded));

        let mut events = client.subscribe().await.unwrap();
        server.broadcast_event(Event::new(EventPayload::Shutdown));

        let event = events.next().await.unwrap();
        assert!(matches!(event.payload, EventPayload::Shutdown));
    }

    #[tokio::test]
    async fn malformed_request_gets_error() {
        let dir = tempdir().unwrap();
        let (_server, socket_path) = serve(dir.path()).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"{not json}\n").await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(response.request_id, 0);
        match response.result {
            ResponseResult::Err(e) => assert_eq!(e.code, ErrorCode::InvalidRequest),
            ResponseResult::Ok(_) => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn oversized_request_closes_connection() {
        let dir = tempdir().unwrap();
        let (_server, socket_path) = serve(dir.path()).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut huge = vec![b'a'; MAX_REQUEST_BYTES + 10];
        huge.push(b'\n');
        // The server may hang up before reading it all
        let _ = write_half.write_all(&huge).await;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(line.trim()).unwrap();
        assert!(matches!(response.result, ResponseResult::Err(ref e) if e.code == ErrorCode::InvalidRequest));

        line.clear();
        assert_eq!(reader.read_line(&mut line).await.unwrap(), 0);
    }
}
