use crate::simulation::{
    wait_for, Pair, SimulationError, SimulationOptions, SERVER_ADDRESS, SERVER_PORT,
};
use emtcp_core::protocols::{
    tcp::{AbortReason, SocketOptions, State, TcpEvent},
    Endpoint,
};

/// Connects to a port nobody listens on.
///
/// The server answers the SYN with a reset without allocating a socket, and
/// the client's open fails with [`AbortReason::Reset`].
pub async fn refused(options: SimulationOptions) -> Result<(), SimulationError> {
    let mut pair = Pair::new(&options)?;
    let server_endpoint = Endpoint::new(SERVER_ADDRESS.into(), SERVER_PORT);

    let socket = pair
        .client
        .handle
        .try_call(move |tcp| {
            let socket = tcp.get_socket(SocketOptions::default())?;
            tcp.connect(socket, server_endpoint, None)?;
            Ok(socket)
        })
        .await?;
    wait_for(&mut pair.client.notifications, options.patience, "reset", |n| {
        n.socket == socket && n.event == TcpEvent::Aborted(AbortReason::Reset)
    })
    .await?;

    let state = pair.client.handle.try_call(move |tcp| tcp.state(socket)).await?;
    if state != State::Closed {
        Err(SimulationError::Unexpected(format!(
            "Client ended in {state:?}"
        )))?
    }
    pair.client
        .handle
        .try_call(move |tcp| tcp.release_socket(socket))
        .await?;

    let (client, server) = pair.shutdown().await?;
    if client.sockets_in_use() != 0 || server.sockets_in_use() != 0 {
        Err(SimulationError::Unexpected(
            "A refused connection left a socket behind".into(),
        ))?
    }
    tracing::info!("Connection refused as expected");
    Ok(())
}
