use crate::simulation::{
    wait_for, Pair, SimulationError, SimulationOptions, SERVER_ADDRESS, SERVER_PORT,
};
use emtcp_core::protocols::{
    tcp::{SocketOptions, TcpEvent},
    Endpoint,
};
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::Instant;

/// What a transfer accomplished
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferReport {
    pub bytes: usize,
    pub segments: usize,
    pub elapsed: Duration,
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.elapsed.as_secs_f64();
        write!(
            f,
            "{} bytes in {} segments over {:.3} s ({:.1} KiB/s)",
            self.bytes,
            self.segments,
            seconds,
            self.bytes as f64 / 1024.0 / seconds.max(f64::EPSILON)
        )
    }
}

/// Moves a block of data from a client to a server and closes the
/// connection.
///
/// The client sends one segment at a time and waits for it to be
/// acknowledged before sending the next. The server checks that the bytes
/// arrive complete and in order. Over an unreliable link the transfer relies
/// on retransmission, so it only fails if the stack runs out of retries.
pub async fn transfer(options: SimulationOptions) -> Result<TransferReport, SimulationError> {
    let mut pair = Pair::new(&options)?;
    let data: Vec<u8> = (0..options.bytes).map(|i| (i % 251) as u8).collect();
    let server_endpoint = Endpoint::new(SERVER_ADDRESS.into(), SERVER_PORT);

    pair.server
        .handle
        .try_call(|tcp| {
            let listener = tcp.get_socket(SocketOptions::default())?;
            tcp.listen(listener, SERVER_PORT)
        })
        .await?;
    let socket = pair
        .client
        .handle
        .try_call(move |tcp| {
            let socket = tcp.get_socket(SocketOptions::default())?;
            tcp.connect(socket, server_endpoint, None)?;
            Ok(socket)
        })
        .await?;
    let start = Instant::now();
    wait_for(
        &mut pair.client.notifications,
        options.patience,
        "establishment",
        |n| n.event == TcpEvent::Established,
    )
    .await?;

    // Each send takes as much as the stack says it will accept
    let outgoing: Arc<[u8]> = data.clone().into();
    let mut offset = 0;
    let mut segments = 0;
    while offset < outgoing.len() {
        let outgoing = outgoing.clone();
        offset += pair
            .client
            .handle
            .try_call(move |tcp| {
                let window = tcp.send_window(socket)? as usize;
                let len = window.min(outgoing.len() - offset);
                tcp.send_slice(socket, &outgoing[offset..offset + len])?;
                Ok(len)
            })
            .await?;
        segments += 1;
        wait_for(
            &mut pair.client.notifications,
            options.patience,
            "acknowledgement",
            |n| n.event == TcpEvent::AckReceived,
        )
        .await?;
    }

    let mut received = Vec::with_capacity(data.len());
    while received.len() < data.len() {
        let notification = wait_for(
            &mut pair.server.notifications,
            options.patience,
            "data",
            |n| matches!(n.event, TcpEvent::DataReceived(_)),
        )
        .await?;
        if let TcpEvent::DataReceived(text) = notification.event {
            received.extend(text);
        }
    }
    let elapsed = start.elapsed();
    if received != data {
        Err(SimulationError::Mismatch {
            sent: data.len(),
            received: received.len(),
        })?
    }

    pair.client.handle.try_call(move |tcp| tcp.close(socket)).await?;
    let child = wait_for(
        &mut pair.server.notifications,
        options.patience,
        "client FIN",
        |n| n.event == TcpEvent::Closed,
    )
    .await?
    .socket;
    pair.server.handle.try_call(move |tcp| tcp.close(child)).await?;
    wait_for(
        &mut pair.client.notifications,
        options.patience,
        "server FIN",
        |n| n.event == TcpEvent::Closed,
    )
    .await?;
    pair.shutdown().await?;

    let report = TransferReport {
        bytes: received.len(),
        segments,
        elapsed,
    };
    tracing::info!(%report, "Transfer complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use emtcp_core::TcpConfig;

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn transfer_with_reliable() {
        let options = SimulationOptions {
            tick: Duration::from_millis(5),
            bytes: 10_000,
            ..Default::default()
        };
        let report = super::transfer(options).await.unwrap();
        assert_eq!(report.bytes, 10_000);
        assert_eq!(report.segments, 7);
    }

    #[tokio::test]
    #[ntest::timeout(30000)]
    async fn transfer_with_unreliable() {
        let options = SimulationOptions {
            config: TcpConfig {
                max_retries: 10,
                connect_retries: 10,
                ..Default::default()
            },
            tick: Duration::from_millis(5),
            success_rate: 0.8,
            bytes: 8 * 1024,
            ..Default::default()
        };
        let report = super::transfer(options).await.unwrap();
        assert_eq!(report.bytes, 8 * 1024);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn small_segments() {
        let options = SimulationOptions {
            config: TcpConfig {
                max_segment_size: 536,
                ..Default::default()
            },
            tick: Duration::from_millis(5),
            bytes: 2000,
            ..Default::default()
        };
        let report = super::transfer(options).await.unwrap();
        assert_eq!(report.segments, 4);
    }
}
