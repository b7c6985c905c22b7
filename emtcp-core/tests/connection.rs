use emtcp_core::{
    protocols::{
        tcp::{AbortReason, Notification, SocketOptions, State, TcpError, TcpEvent},
        Endpoint, Ipv4Address, Tap,
    },
    Tcp, TcpConfig,
};

const CLIENT: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const SERVER: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);

fn stack(address: Ipv4Address, seed: u64) -> Tcp<Tap> {
    let config = TcpConfig {
        seed: Some(seed),
        ..Default::default()
    };
    Tcp::new(config, Tap::new(address)).unwrap()
}

/// Carries frames between the two stacks until neither has anything left to
/// send
fn pump(a: &mut Tcp<Tap>, b: &mut Tcp<Tap>) {
    loop {
        let from_a = a.ip_mut().frames();
        let from_b = b.ip_mut().frames();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for frame in from_a {
            b.process(frame.local, frame.remote, &frame.bytes);
        }
        for frame in from_b {
            a.process(frame.local, frame.remote, &frame.bytes);
        }
    }
}

fn notifications(tcp: &mut Tcp<Tap>) -> Vec<Notification> {
    std::iter::from_fn(|| tcp.poll_event()).collect()
}

fn events(tcp: &mut Tcp<Tap>) -> Vec<TcpEvent> {
    notifications(tcp)
        .into_iter()
        .map(|notification| notification.event)
        .collect()
}

#[test]
fn connection_lifecycle() -> anyhow::Result<()> {
    let mut server = stack(SERVER, 1);
    let mut client = stack(CLIENT, 2);

    let listener = server.get_socket(SocketOptions::default())?;
    server.listen(listener, 80)?;
    let socket = client.get_socket(SocketOptions::default())?;
    client.connect(socket, Endpoint::new(SERVER.into(), 80), None)?;
    pump(&mut client, &mut server);

    assert_eq!(events(&mut client), [TcpEvent::Established]);
    let client_endpoint = Endpoint::new(CLIENT.into(), client.local_port(socket)?);
    let accepted = notifications(&mut server);
    assert_eq!(accepted.len(), 2);
    assert_eq!(accepted[0].event, TcpEvent::Connect(client_endpoint));
    assert_eq!(accepted[1].event, TcpEvent::Established);
    assert!(accepted.iter().all(|n| n.listener == Some(listener)));
    let child = accepted[0].socket;
    assert_ne!(child, listener);
    assert_eq!(server.state(listener)?, State::Listen);
    assert_eq!(server.state(child)?, State::Established);
    assert_eq!(server.peer(child)?, client_endpoint);
    assert_eq!(server.map_segment(80, CLIENT.into(), client_endpoint.port), Some(child));
    assert_eq!(server.map_segment(80, CLIENT.into(), 1), Some(listener));

    client.send_slice(socket, b"GET /")?;
    pump(&mut client, &mut server);
    assert_eq!(
        events(&mut server),
        [TcpEvent::DataReceived(b"GET /".to_vec())]
    );
    assert_eq!(events(&mut client), [TcpEvent::AckReceived]);

    let mut reply = server.get_buffer(6)?;
    reply.copy_from_slice(b"200 OK");
    server.send(child, reply)?;
    pump(&mut client, &mut server);
    assert_eq!(
        events(&mut client),
        [TcpEvent::DataReceived(b"200 OK".to_vec())]
    );
    assert_eq!(events(&mut server), [TcpEvent::AckReceived]);
    assert_eq!(server.pool().available(), server.pool().capacity());

    client.close(socket)?;
    pump(&mut client, &mut server);
    assert_eq!(events(&mut server), [TcpEvent::Closed]);
    assert_eq!(server.state(child)?, State::CloseWait);
    assert_eq!(client.state(socket)?, State::FinWait2);

    server.close(child)?;
    pump(&mut client, &mut server);
    assert_eq!(events(&mut client), [TcpEvent::Closed]);
    assert_eq!(client.state(socket)?, State::TimeWait);
    // The accepted socket is gone as soon as it closed
    assert_eq!(server.state(child), Err(TcpError::SocketNotValid));
    assert_eq!(server.sockets_in_use(), 1);

    assert_eq!(
        client.release_socket(socket),
        Err(TcpError::WrongState(State::TimeWait))
    );
    client.tick();
    client.tick();
    assert_eq!(client.state(socket)?, State::Closed);
    client.release_socket(socket)?;
    assert_eq!(client.sockets_in_use(), 0);
    Ok(())
}

#[test]
fn connection_refused() -> anyhow::Result<()> {
    let mut server = stack(SERVER, 1);
    let mut client = stack(CLIENT, 2);

    let socket = client.get_socket(SocketOptions::default())?;
    client.connect(socket, Endpoint::new(SERVER.into(), 8080), None)?;
    let syn = client.ip_mut().pop().unwrap();
    server.process(syn.local, syn.remote, &syn.bytes);

    assert_eq!(server.sockets_in_use(), 0);
    assert_eq!(server.ip().len(), 1);
    pump(&mut client, &mut server);

    assert_eq!(
        events(&mut client),
        [TcpEvent::Aborted(AbortReason::Reset)]
    );
    assert_eq!(client.state(socket)?, State::Closed);
    assert!(events(&mut server).is_empty());
    Ok(())
}

#[test]
fn lost_segment_is_retransmitted() -> anyhow::Result<()> {
    let mut server = stack(SERVER, 1);
    let mut client = stack(CLIENT, 2);
    let listener = server.get_socket(SocketOptions::default())?;
    server.listen(listener, 7)?;
    let socket = client.get_socket(SocketOptions::default())?;
    client.connect(socket, Endpoint::new(SERVER.into(), 7), Some(4000))?;
    pump(&mut client, &mut server);
    notifications(&mut server);
    notifications(&mut client);

    assert_eq!(client.send_window(socket)?, 1440);
    client.send_slice(socket, &[0xab; 1000])?;
    assert!(!client.send_ready(socket)?);
    assert_eq!(client.send_window(socket)?, 0);
    assert_eq!(client.send_slice(socket, b"x"), Err(TcpError::DataUnacked));
    // The link eats the segment
    assert_eq!(client.ip_mut().frames().len(), 1);

    let mut ticks = 0;
    while client.ip().is_empty() {
        client.tick();
        server.tick();
        ticks += 1;
    }
    assert_eq!(ticks, client.config().retry_timeout);
    pump(&mut client, &mut server);

    assert_eq!(
        events(&mut server),
        [TcpEvent::DataReceived(vec![0xab; 1000])]
    );
    assert_eq!(events(&mut client), [TcpEvent::AckReceived]);
    assert!(client.send_ready(socket)?);
    Ok(())
}

#[test]
fn abort_resets_peer() -> anyhow::Result<()> {
    let mut server = stack(SERVER, 1);
    let mut client = stack(CLIENT, 2);
    let listener = server.get_socket(SocketOptions::default())?;
    server.listen(listener, 80)?;
    let socket = client.get_socket(SocketOptions::default())?;
    client.connect(socket, Endpoint::new(SERVER.into(), 80), None)?;
    pump(&mut client, &mut server);
    let child = notifications(&mut server)[0].socket;

    client.abort(socket)?;
    assert_eq!(client.state(socket)?, State::Closed);
    pump(&mut client, &mut server);

    let aborted = notifications(&mut server);
    assert_eq!(aborted.len(), 1);
    assert_eq!(aborted[0].socket, child);
    assert_eq!(aborted[0].event, TcpEvent::Aborted(AbortReason::Reset));
    assert_eq!(server.state(child), Err(TcpError::SocketNotValid));
    assert_eq!(server.state(listener)?, State::Listen);
    client.release_socket(socket)?;
    Ok(())
}

#[test]
fn ipv6_connection() -> anyhow::Result<()> {
    use emtcp_core::protocols::Ipv6Address;

    let server_address = Ipv6Address::new([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
    let client_address = Ipv6Address::LOCALHOST;
    let mut server = Tcp::new(TcpConfig::default(), Tap::new(server_address))?;
    let mut client = Tcp::new(TcpConfig::default(), Tap::new(client_address))?;

    let listener = server.get_socket(SocketOptions::default())?;
    server.listen(listener, 443)?;
    let socket = client.get_socket(SocketOptions::default())?;
    client.connect(socket, Endpoint::new(server_address.into(), 443), None)?;
    pump(&mut client, &mut server);
    assert_eq!(client.state(socket)?, State::Established);

    client.send_slice(socket, b"hello over v6")?;
    pump(&mut client, &mut server);
    assert_eq!(
        events(&mut server).last(),
        Some(&TcpEvent::DataReceived(b"hello over v6".to_vec()))
    );
    Ok(())
}

#[test]
fn idle_timer_and_segment_size() -> anyhow::Result<()> {
    let options = SocketOptions {
        timeout: Some(30),
        ..Default::default()
    };
    let mut server = stack(SERVER, 1);
    let mut client = stack(CLIENT, 2);
    let listener = server.get_socket(options)?;
    server.listen(listener, 80)?;

    let socket = client.get_socket(options)?;
    assert_eq!(client.idle_timer(socket)?, 0);
    assert_eq!(
        client.reset_timeout(socket),
        Err(TcpError::WrongState(State::Closed))
    );
    client.connect(socket, Endpoint::new(SERVER.into(), 80), None)?;
    assert_eq!(client.mss(socket)?, 536);
    pump(&mut client, &mut server);
    assert_eq!(client.state(socket)?, State::Established);
    assert_eq!(client.mss(socket)?, 1440);
    assert_eq!(client.idle_timer(socket)?, 30);

    for _ in 0..45 {
        client.tick();
    }
    assert_eq!(client.idle_timer(socket)?, 26);
    client.reset_timeout(socket)?;
    assert_eq!(client.idle_timer(socket)?, 30);
    assert!(client.ip().is_empty());
    Ok(())
}
