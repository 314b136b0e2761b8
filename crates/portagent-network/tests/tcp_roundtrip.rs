use std::{thread, time::Duration};

use mio::{Events, Poll, Token};
use portagent_network::{TcpAcceptor, TcpClient, TokenAlloc};

/// Raw-byte echo through one acceptor and one outbound client, each driven
/// by its own poll loop.
#[test]
fn tcp_raw_roundtrip() {
    let mut poll = Poll::new().unwrap();
    let mut tokens = TokenAlloc::default();
    let listener_token = tokens.next();
    let peer_token = tokens.next();
    let mut acceptor =
        TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), poll.registry(), listener_token)
            .unwrap();
    let addr = acceptor.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut events = Events::with_capacity(64);
        let mut peer: Option<TcpClient> = None;
        let mut got = Vec::new();

        while !got.ends_with(b"ping") {
            poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
            for ev in events.iter() {
                if ev.token() == listener_token {
                    peer = acceptor.accept(poll.registry(), peer_token);
                } else if ev.token() == peer_token {
                    let p = peer.as_mut().unwrap();
                    if ev.is_writable() {
                        p.on_writable(poll.registry());
                    }
                    if ev.is_readable() {
                        let mut buf = [0u8; 1024];
                        loop {
                            let n = p.read_data(&mut buf);
                            if n == 0 {
                                break;
                            }
                            got.extend_from_slice(&buf[..n]);
                        }
                    }
                }
            }
        }

        let p = peer.as_mut().unwrap();
        assert!(p.write_data(poll.registry(), b"pong"));

        // hold the socket open until the client has read the reply
        let mut buf = [0u8; 64];
        while p.is_alive() {
            poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
            for ev in events.iter() {
                if ev.token() == peer_token {
                    if ev.is_writable() {
                        p.on_writable(poll.registry());
                    }
                    if ev.is_readable() {
                        p.read_data(&mut buf);
                    }
                }
            }
        }
    });

    let client = thread::spawn(move || {
        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(64);
        let mut tokens = TokenAlloc::default();
        let token = tokens.next();
        let mut conn =
            TcpClient::connect("127.0.0.1", addr.port(), poll.registry(), token).unwrap();

        // the write lands in the backlog until the connect completes
        assert!(conn.write_data(poll.registry(), b"ping"));

        let mut got = Vec::new();
        while !got.ends_with(b"pong") {
            poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
            for ev in events.iter() {
                if ev.token() != token {
                    continue;
                }
                if ev.is_writable() {
                    conn.on_writable(poll.registry());
                }
                if ev.is_readable() {
                    let mut buf = [0u8; 1024];
                    loop {
                        let n = conn.read_data(&mut buf);
                        if n == 0 {
                            break;
                        }
                        got.extend_from_slice(&buf[..n]);
                    }
                }
            }
            assert!(conn.is_alive(), "server hung up early");
        }
        conn.close(poll.registry());
    });

    client.join().unwrap();
    server.join().unwrap();
}

/// EOF on the remote side flips the local endpoint dead instead of raising.
#[test]
fn tcp_eof_marks_disconnected() {
    let mut poll = Poll::new().unwrap();
    let mut tokens = TokenAlloc::default();
    let listener_token = tokens.next();
    let peer_token = tokens.next();
    let mut acceptor =
        TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), poll.registry(), listener_token)
            .unwrap();
    let addr = acceptor.local_addr().unwrap();

    let client = thread::spawn(move || {
        let sock = std::net::TcpStream::connect(addr).unwrap();
        // connect, then immediately hang up
        drop(sock);
    });
    client.join().unwrap();

    let mut events = Events::with_capacity(64);
    let mut peer: Option<TcpClient> = None;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(std::time::Instant::now() < deadline, "no EOF observed");
        poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
        for ev in events.iter() {
            if ev.token() == listener_token {
                peer = acceptor.accept(poll.registry(), peer_token);
            } else if ev.token() == peer_token
                && let Some(p) = peer.as_mut()
            {
                let mut buf = [0u8; 64];
                let n = p.read_data(&mut buf);
                assert_eq!(n, 0);
            }
        }
        if let Some(p) = &peer
            && !p.is_alive()
        {
            break;
        }
    }
}
