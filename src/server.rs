//! Newline-delimited JSON-RPC server.
//!
//! Reads one message per line, dispatches every request on its own task so a
//! slow command on one connection never blocks another, and funnels responses
//! through a single writer task so lines are never interleaved.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::mcp::Dispatcher;
use crate::pool::Pool;
use crate::transport::Connector;

/// Serve requests from `reader` until EOF or until `cancel` fires, then wait
/// for in-flight requests to finish and flush their responses.
pub async fn serve<R, W>(
    dispatcher: Arc<Dispatcher>,
    reader: R,
    writer: W,
    cancel: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let mut lines = BufReader::new(reader).lines();
    let mut in_flight = JoinSet::new();

    let read_result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("server received cancel signal, stopping read loop");
                break Ok(());
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(?e, "request task failed");
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let dispatcher = dispatcher.clone();
                        let tx = tx.clone();
                        in_flight.spawn(async move {
                            if let Some(response) = dispatcher.handle_line(&line).await {
                                // The writer only goes away once output is broken.
                                let _ = tx.send(response.to_line());
                            }
                        });
                    }
                    Ok(None) => {
                        tracing::debug!("input closed");
                        break Ok(());
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to read request");
                        break Err(e);
                    }
                }
            }
        }
    };

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!(?e, "request task failed");
        }
    }
    drop(tx);

    let write_result = writer_task
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    read_result.and(write_result)
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await.or_else(|e| match e.kind() {
        // Stdout cannot always be shut down; the flushed data is what matters.
        io::ErrorKind::Unsupported => Ok(()),
        _ => Err(e),
    })
}

/// Build a pool from `config`, run the health sweep alongside [`serve`], and
/// tear everything down once serving stops.
pub async fn run<R, W>(
    config: &ServerConfig,
    connector: Arc<dyn Connector>,
    reader: R,
    writer: W,
    cancel: CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pool = Pool::new(config.max_connections, config.session_policy(), connector);
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        config.identity(),
        config.auth_policy(),
    ));

    let sweep_cancel = cancel.child_token();
    let sweep = pool.start_health_sweep(config.sweep_interval(), sweep_cancel.clone());
    tracing::info!(
        max_connections = config.max_connections,
        sweep_interval_secs = config.health.sweep_interval_secs,
        "server ready"
    );

    let result = serve(dispatcher, reader, writer, cancel).await;

    sweep_cancel.cancel();
    if let Err(e) = sweep.await {
        tracing::warn!(?e, "health sweep task panicked");
    }
    pool.shutdown().await;
    tracing::info!("server stopped");
    result
}
