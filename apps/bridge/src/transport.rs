//! JSON-lines transport
//!
//! One request per input line, one message per output line. Requests:
//!
//! ```text
//! {"id": 1, "method": "seekTo", "arguments": {"position": 5000}}
//! {"listen": "position"}
//! {"cancel": "position"}
//! {"settingsReturned": 1001}
//! ```
//!
//! Output is a reply (`{"id", "reply"}` or `{"id", "error"}`) or a stream
//! value (`{"stream", "value"}`). Replies carry the request id, since calls run
//! concurrently and `openSettings` answers late.

use anyhow::Result;
use mediabridge_core::BridgeError;
use mediabridge_media_session::{BridgeHandle, MethodCall, StreamKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Call {
        #[serde(default)]
        id: Option<Value>,
        method: String,
        #[serde(default)]
        arguments: Value,
    },
    Listen {
        listen: StreamKind,
    },
    Cancel {
        cancel: StreamKind,
    },
    SettingsReturned {
        #[serde(rename = "settingsReturned")]
        settings_returned: i32,
    },
}

#[derive(Debug, PartialEq, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl From<&BridgeError> for ErrorBody {
    fn from(error: &BridgeError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(untagged)]
enum Outbound {
    Reply {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        reply: Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        error: ErrorBody,
    },
    Stream {
        stream: StreamKind,
        value: Option<Value>,
    },
}

impl Outbound {
    fn from_reply(id: Option<Value>, reply: Result<Value, BridgeError>) -> Self {
        match reply {
            Ok(reply) => Outbound::Reply { id, reply },
            Err(e) => Outbound::Error {
                id,
                error: ErrorBody::from(&e),
            },
        }
    }
}

/// Serve requests from `reader` until end of input, then shut the engine down
pub async fn serve<R, W>(handle: BridgeHandle, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_lines(writer, out_rx));

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Inbound>(line) {
            Ok(request) => handle_request(&handle, &out_tx, request),
            Err(e) => {
                warn!("Malformed request: {}", e);
                let error = BridgeError::InvalidArgument(format!("malformed request: {}", e));
                let _ = out_tx.send(Outbound::from_reply(None, Err(error)));
            }
        }
    }

    debug!("Input closed");
    handle.shutdown();
    drop(out_tx);
    drop(handle);
    writer_task.await??;
    Ok(())
}

fn handle_request(handle: &BridgeHandle, out: &mpsc::UnboundedSender<Outbound>, request: Inbound) {
    let result = match request {
        Inbound::Call { id, method, arguments } => match handle.submit(MethodCall::new(method, arguments)) {
            Ok(pending) => {
                let out = out.clone();
                tokio::spawn(async move {
                    let reply = pending.await.unwrap_or(Err(BridgeError::EngineStopped));
                    let _ = out.send(Outbound::from_reply(id, reply));
                });
                Ok(())
            }
            Err(e) => {
                let _ = out.send(Outbound::from_reply(id, Err(e)));
                Ok(())
            }
        },
        Inbound::Listen { listen } => {
            let out = out.clone();
            handle.listen_json(listen, move |value| {
                let _ = out.send(Outbound::Stream { stream: listen, value });
            })
        }
        Inbound::Cancel { cancel } => handle.cancel(cancel),
        Inbound::SettingsReturned { settings_returned } => handle.settings_returned(settings_returned),
    };

    if let Err(e) = result {
        let _ = out.send(Outbound::from_reply(None, Err(e)));
    }
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}
