//! Control-socket client for the CLI.
//!
//! Connects to the daemon, performs the handshake, and provides one
//! method per control request.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::ipc::codec::MessageCodec;
use crate::ipc::protocol::{
    ClipboardDescriptor, EndpointDescriptor, EntryDescriptor, Message, PROTOCOL_VERSION, Response,
    Status,
};

use super::ClientError;

/// An entry fetched with `get_entry` / `get_entry_by_id`.
pub struct FetchedEntry {
    pub entry: EntryDescriptor,
    pub content: Option<Vec<u8>>,
}

/// One-shot client: each CLI invocation performs a single
/// request/response cycle, so no split sink/stream is needed.
pub struct DaemonClient {
    framed: Framed<UnixStream, MessageCodec>,
    next_id: u32,
}

impl DaemonClient {
    /// Connect to the daemon at `socket_path` and perform the handshake.
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            ClientError::Daemon(format!("connect {}: {e}", socket_path.display()))
        })?;
        let mut framed = Framed::new(stream, MessageCodec::new());

        framed
            .send(Message::Hello {
                id: 0,
                version: PROTOCOL_VERSION,
            })
            .await
            .map_err(|e| ClientError::Daemon(format!("send hello: {e}")))?;

        match framed.next().await {
            Some(Ok(Message::HelloAck {
                status: Status::Ok, ..
            })) => {}
            Some(Ok(Message::HelloAck {
                status: Status::Error,
                error,
                ..
            })) => {
                return Err(ClientError::Daemon(format!(
                    "handshake rejected: {}",
                    error.unwrap_or_default()
                )));
            }
            other => {
                return Err(ClientError::Daemon(format!(
                    "unexpected handshake response: {other:?}"
                )));
            }
        }

        Ok(Self {
            framed,
            next_id: 1, // 0 = Hello
        })
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send one request and wait for its successful response.
    async fn call(&mut self, what: &str, request: Message) -> Result<Response, ClientError> {
        let id = request.id();
        self.framed
            .send(request)
            .await
            .map_err(|e| ClientError::Daemon(format!("send {what}: {e}")))?;

        match self.framed.next().await {
            Some(Ok(Message::Response(response))) if response.id == id => match response.status {
                Status::Ok => Ok(response),
                Status::Error => Err(ClientError::Daemon(format!(
                    "{what} failed: {}",
                    response.error.unwrap_or_default()
                ))),
            },
            other => Err(ClientError::Daemon(format!(
                "unexpected {what} response: {other:?}"
            ))),
        }
    }

    pub async fn list_clipboards(&mut self) -> Result<Vec<ClipboardDescriptor>, ClientError> {
        let id = self.next_id();
        let response = self
            .call("list_clipboards", Message::ListClipboards { id })
            .await?;
        Ok(response.clipboards.unwrap_or_default())
    }

    pub async fn add_clipboard(
        &mut self,
        label: &str,
        max_entries: Option<u32>,
    ) -> Result<(), ClientError> {
        let id = self.next_id();
        self.call(
            "add_clipboard",
            Message::AddClipboard {
                id,
                label: label.to_string(),
                max_entries,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn rename_clipboard(&mut self, clipboard: &str, label: &str) -> Result<(), ClientError> {
        let id = self.next_id();
        self.call(
            "rename_clipboard",
            Message::RenameClipboard {
                id,
                clipboard: clipboard.to_string(),
                label: label.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn list_endpoints(
        &mut self,
        clipboard: &str,
    ) -> Result<Vec<EndpointDescriptor>, ClientError> {
        let id = self.next_id();
        let response = self
            .call(
                "list_endpoints",
                Message::ListEndpoints {
                    id,
                    clipboard: clipboard.to_string(),
                },
            )
            .await?;
        Ok(response.endpoints.unwrap_or_default())
    }

    pub async fn list_entries(
        &mut self,
        clipboard: &str,
        limit: Option<u32>,
    ) -> Result<Vec<EntryDescriptor>, ClientError> {
        let id = self.next_id();
        let response = self
            .call(
                "list_entries",
                Message::ListEntries {
                    id,
                    clipboard: clipboard.to_string(),
                    limit,
                },
            )
            .await?;
        Ok(response.entries.unwrap_or_default())
    }

    pub async fn get_entry(
        &mut self,
        clipboard: &str,
        index: u32,
        mime_type: Option<String>,
    ) -> Result<FetchedEntry, ClientError> {
        let id = self.next_id();
        let response = self
            .call(
                "get_entry",
                Message::GetEntry {
                    id,
                    clipboard: clipboard.to_string(),
                    index,
                    mime_type,
                },
            )
            .await?;
        fetched("get_entry", response)
    }

    pub async fn get_entry_by_id(
        &mut self,
        entry_id: &str,
        mime_type: Option<String>,
    ) -> Result<FetchedEntry, ClientError> {
        let id = self.next_id();
        let response = self
            .call(
                "get_entry_by_id",
                Message::GetEntryById {
                    id,
                    entry_id: entry_id.to_string(),
                    mime_type,
                },
            )
            .await?;
        fetched("get_entry_by_id", response)
    }

    pub async fn set_starred(&mut self, entry_id: &str, starred: bool) -> Result<(), ClientError> {
        let id = self.next_id();
        self.call(
            "set_starred",
            Message::SetStarred {
                id,
                entry_id: entry_id.to_string(),
                starred,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn remove_entry(&mut self, entry_id: &str) -> Result<(), ClientError> {
        let id = self.next_id();
        self.call(
            "remove_entry",
            Message::RemoveEntry {
                id,
                entry_id: entry_id.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Returns how many entries were removed.
    pub async fn clear_history(&mut self, clipboard: &str) -> Result<u32, ClientError> {
        let id = self.next_id();
        let response = self
            .call(
                "clear_history",
                Message::ClearHistory {
                    id,
                    clipboard: clipboard.to_string(),
                },
            )
            .await?;
        Ok(response.removed.unwrap_or_default())
    }

    pub async fn activate_entry(&mut self, entry_id: &str) -> Result<(), ClientError> {
        let id = self.next_id();
        self.call(
            "activate_entry",
            Message::ActivateEntry {
                id,
                entry_id: entry_id.to_string(),
            },
        )
        .await?;
        Ok(())
    }
}

fn fetched(what: &str, response: Response) -> Result<FetchedEntry, ClientError> {
    match response.entry {
        Some(entry) => Ok(FetchedEntry {
            entry,
            content: response.content,
        }),
        None => Err(ClientError::Daemon(format!("{what}: response without entry"))),
    }
}
