//! Per-connection task: framed I/O, handshake, command forwarding.
//!
//! Each control connection spawns a tokio task that:
//! 1. Wraps the socket in a length-prefixed MessagePack codec.
//! 2. Reads the first message (must be `Hello`) and forwards it to
//!    the daemon loop for handshake validation.
//! 3. Forwards every following request to the loop and writes back the
//!    response, one at a time.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::ipc::codec::{CodecError, DecodeResult, FrameCodec, decode_frame};
use crate::ipc::protocol::{Message, Response, Status};

/// Command sent from a connection task to the daemon loop.
#[derive(Debug)]
pub struct DaemonCommand {
    pub request: Message,
    pub response_tx: oneshot::Sender<Message>,
}

/// Connection-level errors.
#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("unexpected EOF during handshake")]
    HandshakeEof,
    #[error("first message must be Hello")]
    NotHello,
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] rmp_serde::decode::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("daemon loop closed")]
    DaemonGone,
    #[error("response channel closed")]
    ResponseDropped,
}

/// Spawn a connection handler task. It runs until the client
/// disconnects or breaks the protocol.
pub fn spawn_connection(stream: UnixStream, cmd_tx: mpsc::UnboundedSender<DaemonCommand>) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, cmd_tx).await {
            tracing::debug!(error = %e, "connection closed");
        }
    });
}

async fn handle_connection(
    stream: UnixStream,
    cmd_tx: mpsc::UnboundedSender<DaemonCommand>,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // -- Handshake: first message must be Hello --
    let first_frame = framed
        .next()
        .await
        .ok_or(ConnectionError::HandshakeEof)??;

    let first_msg = match decode_frame(&first_frame) {
        DecodeResult::Ok(msg @ Message::Hello { .. }) => msg,
        // The client broke the protocol; close without a reply.
        DecodeResult::Ok(_) | DecodeResult::UnknownType(_) => {
            return Err(ConnectionError::NotHello);
        }
        DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
    };

    let response = send_command(&cmd_tx, first_msg).await?;
    let rejected = matches!(
        response,
        Message::HelloAck {
            status: Status::Error,
            ..
        }
    );
    framed.send(response).await?;
    if rejected {
        return Ok(());
    }

    // -- Main loop --
    while let Some(frame) = framed.next().await {
        let raw = frame?;
        let response = match decode_frame(&raw) {
            DecodeResult::Ok(msg) => send_command(&cmd_tx, msg).await?,
            // Echo the id and keep the connection open.
            DecodeResult::UnknownType(envelope) => {
                Response::error(envelope.id, "unknown_type").into()
            }
            DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
        };
        framed.send(response).await?;
    }
    Ok(())
}

/// Send a command to the daemon loop and wait for the response.
async fn send_command(
    cmd_tx: &mpsc::UnboundedSender<DaemonCommand>,
    request: Message,
) -> Result<Message, ConnectionError> {
    let (response_tx, response_rx) = oneshot::channel();
    cmd_tx
        .send(DaemonCommand {
            request,
            response_tx,
        })
        .map_err(|_| ConnectionError::DaemonGone)?;
    response_rx
        .await
        .map_err(|_| ConnectionError::ResponseDropped)
}
