use crate::simulation::{
    wait_for, Pair, SimulationError, SimulationOptions, CLIENT_ADDRESS, SERVER_ADDRESS,
    SERVER_PORT,
};
use emtcp_core::protocols::{
    tcp::{SocketOptions, State, TcpEvent},
    Endpoint, IpAddress,
};
use tokio::time::Instant;

/// Opens a connection and closes it again without moving any data.
///
/// The client actively opens to a listening server. Once both sides are
/// established the client closes first and the server follows, so the
/// client ends in TIME-WAIT and the accepted socket on the server is
/// released.
pub async fn handshake(options: SimulationOptions) -> Result<(), SimulationError> {
    let mut pair = Pair::new(&options)?;
    let server_endpoint = Endpoint::new(SERVER_ADDRESS.into(), SERVER_PORT);

    let listener = pair
        .server
        .handle
        .try_call(|tcp| {
            let listener = tcp.get_socket(SocketOptions::default())?;
            tcp.listen(listener, SERVER_PORT)?;
            Ok(listener)
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

    let patience = options.patience;
    wait_for(&mut pair.client.notifications, patience, "establishment", |n| {
        n.socket == socket && n.event == TcpEvent::Established
    })
    .await?;
    let connect = wait_for(
        &mut pair.server.notifications,
        patience,
        "connection request",
        |n| matches!(n.event, TcpEvent::Connect(_)),
    )
    .await?;
    let child = connect.socket;
    if connect.listener != Some(listener) {
        Err(SimulationError::Unexpected(format!(
            "{child} was not accepted by {listener}"
        )))?
    }
    let peer = pair.server.handle.try_call(move |tcp| tcp.peer(child)).await?;
    if peer.address != IpAddress::from(CLIENT_ADDRESS) {
        Err(SimulationError::Unexpected(format!("Unexpected peer {peer}")))?
    }
    tracing::info!(%peer, %child, "Server accepted connection");

    pair.client.handle.try_call(move |tcp| tcp.close(socket)).await?;
    wait_for(&mut pair.server.notifications, patience, "client FIN", |n| {
        n.socket == child && n.event == TcpEvent::Closed
    })
    .await?;
    pair.server.handle.try_call(move |tcp| tcp.close(child)).await?;
    wait_for(&mut pair.client.notifications, patience, "server FIN", |n| {
        n.socket == socket && n.event == TcpEvent::Closed
    })
    .await?;

    // The last ACK may still be in flight
    let deadline = Instant::now() + patience;
    loop {
        let released = pair
            .server
            .handle
            .call(move |tcp| tcp.state(child).is_err())
            .await?;
        if released {
            break;
        }
        if Instant::now() >= deadline {
            Err(SimulationError::Timeout("release of the accepted socket"))?
        }
        tokio::time::sleep(options.tick).await;
    }

    let state = pair.client.handle.try_call(move |tcp| tcp.state(socket)).await?;
    if !matches!(state, State::TimeWait | State::Closed) {
        Err(SimulationError::Unexpected(format!(
            "Client ended in {state:?}"
        )))?
    }
    let (_, server) = pair.shutdown().await?;
    if server.sockets_in_use() != 1 {
        Err(SimulationError::Unexpected(format!(
            "{} sockets left on the server",
            server.sockets_in_use()
        )))?
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn handshake() {
        let options = SimulationOptions {
            tick: Duration::from_millis(5),
            ..Default::default()
        };
        super::handshake(options).await.unwrap()
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn handshake_with_latency() {
        let options = SimulationOptions {
            tick: Duration::from_millis(5),
            latency: Duration::from_millis(5),
            ..Default::default()
        };
        super::handshake(options).await.unwrap()
    }
}
