// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Bidirectional byte relay between two streams.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::TunnelRole;
use crate::metrics;

const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Bytes moved by one relay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Local endpoint to remote endpoint
    pub outbound: u64,
    /// Remote endpoint to local endpoint
    pub inbound: u64,
}

/// How a relay ended.
#[derive(Debug)]
pub enum RelayEnd {
    /// One side closed its stream
    Closed,
    /// The tunnel was stopped
    Cancelled,
    /// A direction failed with an I/O error
    Failed(io::Error),
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

/// Copy bytes both ways until one direction finishes or `cancel` fires.
///
/// The first direction to end tears down the other one; both streams are
/// dropped when this returns.
pub async fn relay<L, R>(
    local: L,
    remote: R,
    role: TunnelRole,
    cancel: &CancellationToken,
) -> (RelayStats, RelayEnd)
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let outbound = AtomicU64::new(0);
    let inbound = AtomicU64::new(0);

    let end = tokio::select! {
        () = cancel.cancelled() => RelayEnd::Cancelled,
        result = copy_counted(&mut local_read, &mut remote_write, &outbound) => match result {
            Ok(()) => RelayEnd::Closed,
            Err(e) => RelayEnd::Failed(e),
        },
        result = copy_counted(&mut remote_read, &mut local_write, &inbound) => match result {
            Ok(()) => RelayEnd::Closed,
            Err(e) => RelayEnd::Failed(e),
        },
    };

    let stats = RelayStats {
        outbound: outbound.load(Ordering::Relaxed),
        inbound: inbound.load(Ordering::Relaxed),
    };
    metrics::record_tunnel_bytes(role.as_str(), "outbound", stats.outbound);
    metrics::record_tunnel_bytes(role.as_str(), "inbound", stats.inbound);

    (stats, end)
}
