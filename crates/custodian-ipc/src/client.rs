//! Socket client

use custodian_api::{Command, Event, Request, Response, ResponsePayload};
use serde::Deserialize;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use crate::{IpcError, IpcResult};

/// Any line the service may send
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response(Response),
    Event(Event),
}

struct LineReader {
    reader: BufReader<OwnedReadHalf>,
    line: String,
}

impl LineReader {
    async fn next(&mut self) -> IpcResult<Incoming> {
        self.line.clear();
        if self.reader.read_line(&mut self.line).await? == 0 {
            return Err(IpcError::ConnectionClosed);
        }
        Ok(serde_json::from_str(self.line.trim())?)
    }
}

pub struct IpcClient {
    incoming: LineReader,
    writer: OwnedWriteHalf,
    next_request_id: u64,
}

impl IpcClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let (read_half, writer) = UnixStream::connect(socket_path).await?.into_split();

        Ok(Self {
            incoming: LineReader {
                reader: BufReader::new(read_half),
                line: String::new(),
            },
            writer,
            next_request_id: 1,
        })
    }

    /// Send a command and wait for its response.
    ///
    /// Events arriving in the meantime are skipped. Request id 0 is the
    /// service's answer to a line it could not parse.
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut line = serde_json::to_string(&Request::new(request_id, command))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            match self.incoming.next().await? {
                Incoming::Response(response)
                    if response.request_id == request_id || response.request_id == 0 =>
                {
                    return Ok(response);
                }
                Incoming::Response(response) => {
                    debug!(expected = request_id, got = response.request_id, "Skipping stale response");
                }
                Incoming::Event(_) => {}
            }
        }
    }

    /// Like [`send`](Self::send), but an error response becomes
    /// [`IpcError::Rejected`]
    pub async fn call(&mut self, command: Command) -> IpcResult<ResponsePayload> {
        Ok(self.send(command).await?.result.into_result()?)
    }

    /// Turn this connection into an event stream
    pub async fn subscribe(mut self) -> IpcResult<EventStream> {
        self.call(Command::SubscribeEvents).await?;

        Ok(EventStream {
            incoming: self.incoming,
            _writer: self.writer,
        })
    }
}

pub struct EventStream {
    incoming: LineReader,
    // Dropping the write half would shut the connection down
    _writer: OwnedWriteHalf,
}

impl EventStream {
    pub async fn next(&mut self) -> IpcResult<Event> {
        loop {
            if let Incoming::Event(event) = self.incoming.next().await? {
                return Ok(event);
            }
        }
    }
}
