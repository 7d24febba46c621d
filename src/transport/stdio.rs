use super::Conn;
use super::json_rpc::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures_lite::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use futures_lite::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;
type Closed = Arc<AtomicBool>;

/// Line-delimited JSON-RPC connection over a child's stdin/stdout.
///
/// A background task reads stdout line by line and hands each response to
/// the request waiting on its id. When stdout closes, every pending request
/// fails with a "Connection closed" error.
pub struct StdioConn {
    /// Server name, used in logs
    name: String,
    /// Request sink (the child's stdin)
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Requests waiting for a response, by id
    pending: Pending,
    /// Set once stdout has closed
    closed: Closed,
    /// Task reading the child's stdout
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioConn {
    /// Wraps a child process's stdin and stdout.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        stdin: async_process::ChildStdin,
        stdout: async_process::ChildStdout,
    ) -> Self {
        Self::from_io(name, stdin, stdout)
    }

    /// Builds a connection over any async byte pipe pair.
    pub fn from_io<W, R>(name: impl Into<String>, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let name = name.into();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed: Closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_responses(
            name.clone(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            name,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            closed,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    /// Gets the name of the server associated with this connection.
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn write_line(&self, message: &impl Serialize) -> Result<()> {
        let mut line = serde_json::to_vec(message)
            .map_err(|e| Error::Serialization(format!("Failed to serialize message: {}", e)))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| Error::Communication(format!("Failed to write to stdin: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Communication(format!("Failed to flush stdin: {}", e)))
    }

    /// Sends a JSON-RPC request and waits for its response.
    pub async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let id = match &request.id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return Err(Error::Communication("Invalid request ID type".to_string())),
        };

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(id.clone(), sender);
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };
        // The reader marks the connection closed before draining, so a
        // request inserted after the drain is caught here.
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Communication("Connection closed".to_string()));
        }

        self.write_line(&request).await?;

        let response = receiver
            .await
            .map_err(|_| Error::Communication("Failed to receive response".to_string()))?;

        if let Some(error) = response.error {
            return Err(Error::JsonRpc(error.to_string()));
        }
        Ok(response)
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Sends a JSON-RPC notification (no response expected).
    pub async fn send_notification(&self, notification: JsonRpcNotification) -> Result<()> {
        self.write_line(&notification).await
    }
}

/// Removes a request's pending entry when its caller finishes or gives up.
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

async fn read_responses<R>(name: String, reader: R, pending: Pending, closed: Closed)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(server = %name, error = %e, "stdout read failed");
                break;
            }
        };
        let response = match serde_json::from_str::<JsonRpcMessage>(&line) {
            Ok(JsonRpcMessage::Response(response)) => response,
            Ok(_) => continue,
            Err(_) => {
                tracing::trace!(server = %name, line = %line, "Ignoring non JSON-RPC output");
                continue;
            }
        };
        let Some(id) = response.correlation_id() else {
            continue;
        };
        if let Some(sender) = pending.lock().remove(&id) {
            let _ = sender.send(response);
        }
    }

    tracing::debug!(server = %name, "stdout closed");
    closed.store(true, Ordering::SeqCst);
    for (_, sender) in pending.lock().drain() {
        let _ = sender.send(JsonRpcResponse::connection_closed());
    }
}

impl fmt::Debug for StdioConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioConn")
            .field("name", &self.name)
            .field("pending", &self.pending_requests())
            .finish()
    }
}

#[async_trait]
impl Conn for StdioConn {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = JsonRpcRequest::new(Uuid::new_v4().to_string(), method, params);
        let response = self.send_request(request).await?;
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send_notification(JsonRpcNotification::new(method, params))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let task = self.reader_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        for (_, sender) in self.pending.lock().drain() {
            let _ = sender.send(JsonRpcResponse::connection_closed());
        }

        let mut writer = self.writer.lock().await;
        writer
            .close()
            .await
            .map_err(|e| Error::Transport(format!("Failed to close stdin: {}", e)))
    }
}
