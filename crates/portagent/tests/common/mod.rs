// not every test binary uses every helper
#![allow(dead_code)]

use std::{
    io::Read,
    net::{TcpListener, TcpStream},
    sync::{Arc, atomic::AtomicUsize},
};

use portagent::{
    agent::PortAgent,
    config::{InstrumentType, PortAgentConfig},
    connection::ConnectionState,
    packet::Packet,
    publish::ClientRole,
    timing::Nanos,
};

pub const CYCLES: usize = 500;

/// Grabs a currently free localhost port. Racy by nature, fine for tests.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

pub struct Harness {
    pub agent: PortAgent,
    pub instrument_listener: TcpListener,
    pub command_listener: Option<TcpListener>,
    _log_dir: tempfile::TempDir,
}

pub fn base_config(log_dir: &tempfile::TempDir) -> PortAgentConfig {
    let mut cfg = PortAgentConfig::default();
    cfg.instrument_data_host = "127.0.0.1".to_string();
    cfg.data_port = free_port();
    cfg.command_port = free_port();
    cfg.config_port = free_port();
    cfg.log_dir = log_dir.path().to_path_buf();
    cfg
}

/// Agent fronting a mock plain-TCP instrument.
pub fn tcp_harness(mutate: impl FnOnce(&mut PortAgentConfig)) -> Harness {
    let log_dir = tempfile::tempdir().unwrap();
    let instrument_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    instrument_listener.set_nonblocking(true).unwrap();

    let mut cfg = base_config(&log_dir);
    cfg.instrument_data_port = instrument_listener.local_addr().unwrap().port();
    mutate(&mut cfg);

    let agent = PortAgent::new(cfg, None, Arc::new(AtomicUsize::new(0))).unwrap();
    Harness { agent, instrument_listener, command_listener: None, _log_dir: log_dir }
}

/// Agent fronting a mock DIGI (separate data and command listeners).
pub fn rsn_harness() -> Harness {
    let log_dir = tempfile::tempdir().unwrap();
    let instrument_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    instrument_listener.set_nonblocking(true).unwrap();
    let command_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    command_listener.set_nonblocking(true).unwrap();

    let mut cfg = base_config(&log_dir);
    cfg.instrument_type = InstrumentType::Rsn;
    cfg.instrument_data_port = instrument_listener.local_addr().unwrap().port();
    cfg.instrument_command_port = command_listener.local_addr().unwrap().port();

    let agent = PortAgent::new(cfg, None, Arc::new(AtomicUsize::new(0))).unwrap();
    Harness { agent, instrument_listener, command_listener: Some(command_listener), _log_dir: log_dir }
}

/// Cycles the loop until the mock instrument sees the agent connect and the
/// agent reports READY.
pub fn accept_instrument(h: &mut Harness, now: Nanos) -> TcpStream {
    for _ in 0..CYCLES {
        h.agent.run_once(now);
        match h.instrument_listener.accept() {
            Ok((sock, _)) => {
                sock.set_nonblocking(true).unwrap();
                for _ in 0..CYCLES {
                    if h.agent.connection_state() == ConnectionState::Ready {
                        return sock;
                    }
                    h.agent.run_once(now);
                }
                panic!("agent accepted but never became ready");
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("instrument accept: {e}"),
        }
    }
    panic!("agent never connected to the instrument");
}

/// Connects a peer to one of the agent's listeners and waits until the
/// agent has adopted it.
pub fn connect_peer(h: &mut Harness, addr: std::net::SocketAddr, role: ClientRole, now: Nanos) -> TcpStream {
    let sock = TcpStream::connect(addr).unwrap();
    sock.set_nonblocking(true).unwrap();
    for _ in 0..CYCLES {
        if h.agent.has_peer(role) {
            return sock;
        }
        h.agent.run_once(now);
    }
    panic!("agent never accepted the {role:?} peer");
}

/// Drains whatever the peer socket has; true on EOF.
pub fn read_avail(sock: &mut TcpStream, acc: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    loop {
        match sock.read(&mut chunk) {
            Ok(0) => return true,
            Ok(n) => acc.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => panic!("peer read: {e}"),
        }
    }
}

/// Splits complete frames off the front of the accumulator.
pub fn split_frames(acc: &mut Vec<u8>) -> Vec<Packet> {
    let mut out = Vec::new();
    loop {
        if acc.len() < 16 {
            return out;
        }
        let size = u16::from_be_bytes([acc[4], acc[5]]) as usize;
        if acc.len() < size {
            return out;
        }
        let frame: Vec<u8> = acc.drain(..size).collect();
        out.push(Packet::from_wire(&frame).expect("agent emitted a malformed frame"));
    }
}
