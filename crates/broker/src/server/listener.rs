//! TCP listener and per-connection loop
//!
//! Each accepted connection gets a reader loop that decodes frames and runs
//! them through its [`Dispatcher`] on a blocking thread, and a writer task
//! that drains the connection's outbox. Responses queued by monitors and
//! adapter tasks interleave with command output through the same outbox.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

use super::dispatcher::Dispatcher;
use crate::protocol::{DecodeResult, Response, Value, decode_frame};
use crate::service::Broker;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Unconsumed request bytes a client may leave pending
const MAX_PENDING_BYTES: usize = 256 * 1024 * 1024;

pub struct Server {
    broker: Arc<Broker>,
    listener: TcpListener,
}

impl Server {
    /// Bind to the configured listen address
    pub async fn bind(broker: Arc<Broker>) -> Result<Self> {
        let addr = broker.config().listen.clone();
        Self::bind_to(broker, &addr).await
    }

    pub async fn bind_to(broker: Arc<Broker>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        Ok(Self { broker, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Listening on {}", self.local_addr()?);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let broker = Arc::clone(&self.broker);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(broker, stream, peer, shutdown).await {
                                debug!("Connection from {} ended: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Listener stopped");
        Ok(())
    }
}

fn greeting() -> Response {
    Response::Data(vec![
        Value::atom("OK"),
        Value::atom("MERIDIAN1"),
        Value::atom("ready"),
    ])
}

async fn handle_connection(
    broker: Arc<Broker>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let id = broker.next_connection_id();
    debug!("conn-{} accepted from {}", id, peer);

    let (mut reader, writer) = stream.into_split();
    let (outbox, responses) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    let writer_task = tokio::spawn(write_responses(writer, responses, closed_rx));

    let _ = outbox.send(greeting());
    let mut dispatcher = Dispatcher::new(broker, id, outbox);
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let result: Result<()> = 'connection: loop {
        loop {
            match decode_frame(&mut buffer) {
                DecodeResult::Complete(frame) => {
                    let mut running = dispatcher;
                    dispatcher = match tokio::task::spawn_blocking(move || {
                        running.handle_frame(frame);
                        running
                    })
                    .await
                    {
                        Ok(dispatcher) => dispatcher,
                        // the session state went down with the handler
                        Err(e) => return Err(anyhow::anyhow!("conn-{} handler panicked: {}", id, e)),
                    };
                    if dispatcher.is_closing() {
                        break 'connection Ok(());
                    }
                }
                DecodeResult::Invalid(error) => dispatcher.handle_invalid(error),
                DecodeResult::Incomplete => break,
            }
        }
        if buffer.len() > MAX_PENDING_BYTES {
            warn!("{}: request exceeds {} bytes, closing", dispatcher.session(), MAX_PENDING_BYTES);
            dispatcher.send_bye("Request too large");
            break Ok(());
        }

        let read = tokio::select! {
            read = reader.read_buf(&mut buffer) => read,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    dispatcher.send_bye("Server shutting down");
                    break Ok(());
                }
                continue;
            }
        };
        match read {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e.into()),
        }
    };

    dispatcher.close();
    debug!("{} closed", dispatcher.session());
    drop(dispatcher);
    let _ = closed_tx.send(());
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("conn-{} writer failed: {:#}", id, e),
        Err(e) => warn!("conn-{} writer panicked: {}", id, e),
    }
    result
}

/// Drain the outbox into the socket, batching whatever is queued
async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut responses: mpsc::UnboundedReceiver<Response>,
    mut closed: oneshot::Receiver<()>,
) -> Result<()> {
    let mut out = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let finished = tokio::select! {
            biased;
            response = responses.recv() => match response {
                Some(response) => {
                    response.encode(&mut out);
                    false
                }
                None => true,
            },
            _ = &mut closed => true,
        };
        while let Ok(response) = responses.try_recv() {
            response.encode(&mut out);
        }
        if !out.is_empty() {
            writer.write_all(&out).await?;
            out.clear();
        }
        if finished {
            break;
        }
    }
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, ResourceManifest};
    use std::time::Duration;
    use tempfile::tempdir;

    async fn read_until(stream: &mut TcpStream, marker: &str) -> Result<String> {
        let mut text = String::new();
        let mut chunk = [0u8; 4096];
        while !text.contains(marker) {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk)).await??;
            if n == 0 {
                break;
            }
            text.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
        Ok(text)
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() -> Result<()> {
        let dir = tempdir()?;
        let broker = Broker::open(BrokerConfig::in_dir(dir.path()), &ResourceManifest::default())?;
        let server = Server::bind_to(broker, "127.0.0.1:0").await?;
        let addr = server.local_addr()?;
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(server.run(shutdown));

        let mut client = TcpStream::connect(addr).await?;
        let hello = read_until(&mut client, "\r\n").await?;
        assert!(hello.starts_with("* OK MERIDIAN1"));

        client
            .write_all(b"a1 LOGIN test\r\na2 CAPABILITY\r\na3 BOGUS\r\n")
            .await?;
        let text = read_until(&mut client, "a3 BAD").await?;
        assert!(text.contains("a1 OK"));
        assert!(text.contains("* CAPABILITY MERIDIAN1"));

        client.write_all(b"a4 LOGOUT\r\n").await?;
        let text = read_until(&mut client, "a4 OK").await?;
        assert!(text.contains("* BYE"));

        stop.send(true)?;
        running.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_says_bye_to_open_connections() -> Result<()> {
        let dir = tempdir()?;
        let broker = Broker::open(BrokerConfig::in_dir(dir.path()), &ResourceManifest::default())?;
        let server = Server::bind_to(broker, "127.0.0.1:0").await?;
        let addr = server.local_addr()?;
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(server.run(shutdown));

        let mut client = TcpStream::connect(addr).await?;
        read_until(&mut client, "\r\n").await?;
        stop.send(true)?;
        let text = read_until(&mut client, "shutting down").await?;
        assert!(text.contains("* BYE Server shutting down"));
        running.await??;
        Ok(())
    }
}
