//! IPC client implementation

use habitlink_api::{Command, Event, Request, Response, ResponsePayload, ResponseResult};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use crate::{IpcError, IpcResult};

/// One line from the service: a reply or a pushed event
#[derive(Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response(Response),
    Event(Event),
}

/// IPC Client for connecting to habitlinkd
pub struct IpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_request_id: u64,
    /// Events that arrived while waiting for a response
    pending: VecDeque<Event>,
}

impl IpcClient {
    /// Connect to habitlinkd
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_request_id: 1,
            pending: VecDeque::new(),
        })
    }

    /// Send a command and wait for its response
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = Request::new(request_id, command);
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;

        loop {
            match read_incoming(&mut self.reader).await? {
                Incoming::Response(response) if response.request_id == request_id => {
                    return Ok(response);
                }
                Incoming::Response(response) => {
                    return Err(IpcError::InvalidMessage(format!(
                        "response for request {} while waiting for {}",
                        response.request_id, request_id
                    )));
                }
                Incoming::Event(event) => self.pending.push_back(event),
            }
        }
    }

    /// Send a command and unwrap its payload, turning error replies into
    /// [`IpcError::Rejected`]
    pub async fn call(&mut self, command: Command) -> IpcResult<ResponsePayload> {
        match self.send(command).await?.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(info) => Err(IpcError::Rejected(info)),
        }
    }

    /// Subscribe to events and consume this client to return an event stream
    pub async fn subscribe(mut self) -> IpcResult<EventStream> {
        self.call(Command::SubscribeEvents).await?;

        Ok(EventStream {
            reader: self.reader,
            pending: self.pending,
            _writer: self.writer,
        })
    }
}

/// Stream of events from habitlinkd
pub struct EventStream {
    reader: BufReader<OwnedReadHalf>,
    pending: VecDeque<Event>,
    // Dropping the write half would end the session on the service side.
    _writer: OwnedWriteHalf,
}

impl EventStream {
    /// Wait for the next event
    pub async fn next(&mut self) -> IpcResult<Event> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }

        loop {
            match read_incoming(&mut self.reader).await? {
                Incoming::Event(event) => return Ok(event),
                Incoming::Response(_) => continue,
            }
        }
    }
}

async fn read_incoming(reader: &mut BufReader<OwnedReadHalf>) -> IpcResult<Incoming> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(IpcError::ConnectionClosed);
    }

    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IpcServer, ServerMessage};
    use habitlink_api::{ErrorCode, ErrorInfo, EventPayload};
    use habitlink_util::{HabitId, UserId};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Server that answers pings and subscriptions, rejects everything else
    async fn serve(socket: &Path) -> Arc<IpcServer> {
        let mut server = IpcServer::new(socket);
        server.start().await.unwrap();
        let server = Arc::new(server);

        let mut messages = server.take_message_receiver().await.unwrap();
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });

        let responder = server.clone();
        tokio::spawn(async move {
            while let Some(msg) = messages.recv().await {
                if let ServerMessage::Request { client_id, request } = msg {
                    let response = match request.command {
                        Command::Ping => Response::success(request.request_id, ResponsePayload::Pong),
                        Command::SubscribeEvents => Response::success(
                            request.request_id,
                            ResponsePayload::Subscribed {
                                client_id: client_id.clone(),
                            },
                        ),
                        _ => Response::error(
                            request.request_id,
                            ErrorInfo::new(ErrorCode::PermissionDenied, "nope"),
                        ),
                    };
                    responder.send_response(&client_id, response).await.unwrap();
                }
            }
        });

        server
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("habitlinkd.sock");
        let _server = serve(&socket).await;

        let mut client = IpcClient::connect(&socket).await.unwrap();
        let payload = client.call(Command::Ping).await.unwrap();
        assert!(matches!(payload, ResponsePayload::Pong));

        let err = client.call(Command::RunRecurrence).await.unwrap_err();
        assert!(matches!(err, IpcError::Rejected(info) if info.code == ErrorCode::PermissionDenied));
    }

    #[tokio::test]
    async fn subscriber_receives_broadcasts() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("habitlinkd.sock");
        let server = serve(&socket).await;

        let client = IpcClient::connect(&socket).await.unwrap();
        let mut events = client.subscribe().await.unwrap();
        assert_eq!(server.subscriber_count().await, 1);

        let habit_id = HabitId::new();
        server.broadcast_event(Event::new(EventPayload::HabitReset {
            habit_id,
            user_id: UserId::new("u1"),
        }));

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.payload, EventPayload::HabitReset { habit_id: id, .. } if id == habit_id));
    }

    #[tokio::test]
    async fn malformed_line_gets_invalid_request() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("habitlinkd.sock");
        let _server = serve(&socket).await;

        let stream = UnixStream::connect(&socket).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"{not json}\n").await.unwrap();

        let mut reader = BufReader::new(read_half);
        let Incoming::Response(response) = read_incoming(&mut reader).await.unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(response.request_id, 0);
        assert!(matches!(
            response.result,
            ResponseResult::Err(ref info) if info.code == ErrorCode::InvalidRequest
        ));
    }
}
