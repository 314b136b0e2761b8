mod common;

use std::{io::Write, net::TcpListener};

use common::{
    CYCLES, accept_instrument, connect_peer, free_port, read_avail, split_frames, tcp_harness,
};
use portagent::{
    agent::DEFAULT_FLUSH_TIMEOUT,
    connection::ConnectionState,
    packet::PacketType,
    publish::ClientRole,
    timing::Nanos,
};

// unix time for NTP second 3_800_000_000
const T0_UNIX_SECS: u64 = 3_800_000_000 - 2_208_988_800;

/// Bytes from the instrument come out of the data port as one framed,
/// checksummed, timestamped packet; losing the instrument afterwards fans a
/// fault out to the same sink.
#[test]
fn tcp_round_trip_and_fault_fan_out() {
    let mut h = tcp_harness(|_| {});
    let t0 = Nanos::from_secs(T0_UNIX_SECS);
    let mut instrument = accept_instrument(&mut h, t0);
    let data_addr = h.agent.data_addr().unwrap();
    let mut driver = connect_peer(&mut h, data_addr, ClientRole::DriverData, t0);

    instrument.write_all(&[0x01, 0x02, 0x03]).unwrap();

    let mut acc = Vec::new();
    let mut packets = Vec::new();
    for i in 0..CYCLES {
        // hold virtual time at t0 while the bytes arrive, then step past
        // the flush timeout
        let now = if i < 50 { t0 } else { t0 + DEFAULT_FLUSH_TIMEOUT };
        h.agent.run_once(now);
        read_avail(&mut driver, &mut acc);
        packets.extend(split_frames(&mut acc));
        if packets.iter().any(|p| p.packet_type() == PacketType::DataFromInstrument) {
            break;
        }
    }

    let pkt = packets
        .iter()
        .find(|p| p.packet_type() == PacketType::DataFromInstrument)
        .expect("no data packet reached the driver");
    assert_eq!(pkt.packet_size(), 19);
    assert_eq!(pkt.payload(), &[0x01, 0x02, 0x03]);
    assert_eq!(pkt.timestamp().seconds, 3_800_000_000);
    assert_eq!(pkt.timestamp().fraction, 0);
    assert_eq!(pkt.checksum(), 0x000D);

    // instrument goes away: one fault on the driver data sink
    drop(instrument);
    let t1 = t0 + DEFAULT_FLUSH_TIMEOUT;
    let mut faults = Vec::new();
    for _ in 0..CYCLES {
        h.agent.run_once(t1);
        read_avail(&mut driver, &mut acc);
        faults.extend(
            split_frames(&mut acc)
                .into_iter()
                .filter(|p| p.packet_type() == PacketType::PortAgentFault),
        );
        if !faults.is_empty() {
            break;
        }
    }
    assert_eq!(faults.len(), 1);
    let payload = String::from_utf8_lossy(faults[0].payload()).to_string();
    assert!(payload.contains("instrument disconnected"), "fault payload: {payload}");
}

/// Bytes a driver writes to the command port reach the instrument unframed.
#[test]
fn driver_command_reaches_instrument() {
    let mut h = tcp_harness(|_| {});
    let t0 = Nanos::from_secs(1_700_000_000);
    let mut instrument = accept_instrument(&mut h, t0);
    let cmd_addr = h.agent.command_addr().unwrap();
    let mut driver = connect_peer(&mut h, cmd_addr, ClientRole::DriverCommand, t0);

    driver.write_all(b"RESET\n").unwrap();

    let mut got = Vec::new();
    for i in 0..CYCLES {
        let now = if i < 50 { t0 } else { t0 + DEFAULT_FLUSH_TIMEOUT };
        h.agent.run_once(now);
        read_avail(&mut instrument, &mut got);
        if got == b"RESET\n" {
            break;
        }
    }
    assert_eq!(got, b"RESET\n");
}

/// `data_port` on the config channel closes the old driver socket and
/// rebinds the listener on the new port.
#[test]
fn config_reload_rebinds_data_port() {
    let mut h = tcp_harness(|_| {});
    let t0 = Nanos::from_secs(1_700_000_000);
    let _instrument = accept_instrument(&mut h, t0);
    let data_addr = h.agent.data_addr().unwrap();
    let mut old_driver = connect_peer(&mut h, data_addr, ClientRole::DriverData, t0);
    let config_addr = h.agent.config_addr().unwrap();
    let mut config = connect_peer(&mut h, config_addr, ClientRole::Config, t0);

    let new_port = free_port();
    config.write_all(format!("data_port {new_port}\n").as_bytes()).unwrap();

    let mut scrap = Vec::new();
    let mut eof = false;
    for _ in 0..CYCLES {
        h.agent.run_once(t0);
        eof = read_avail(&mut old_driver, &mut scrap);
        if eof {
            break;
        }
    }
    assert!(eof, "old driver socket should have been closed");
    assert_eq!(h.agent.data_addr().unwrap().port(), new_port);
    assert_eq!(h.agent.config().data_port, new_port);

    // the fresh listener accepts a new driver
    let new_addr = h.agent.data_addr().unwrap();
    let _new_driver = connect_peer(&mut h, new_addr, ClientRole::DriverData, t0);

    // and get reflects the mutation on the same channel
    config.write_all(b"get data_port\n").unwrap();
    let mut reply = Vec::new();
    for _ in 0..CYCLES {
        h.agent.run_once(t0);
        read_avail(&mut config, &mut reply);
        if !reply.is_empty() {
            break;
        }
    }
    let reply = String::from_utf8_lossy(&reply).to_string();
    assert!(reply.contains(&format!("data_port {new_port}")), "reply: {reply}");
}

/// The sniffer tap mirrors the instrument byte stream without framing.
#[test]
fn sniffer_mirrors_raw_bytes() {
    let mut h = tcp_harness(|cfg| cfg.sniffer_port = Some(free_port()));
    let t0 = Nanos::from_secs(1_700_000_000);
    let mut instrument = accept_instrument(&mut h, t0);
    let sniffer_addr = h.agent.sniffer_addr().unwrap();
    let mut sniffer = connect_peer(&mut h, sniffer_addr, ClientRole::Sniffer, t0);

    instrument.write_all(b"raw!").unwrap();

    let mut got = Vec::new();
    for i in 0..CYCLES {
        let now = if i < 50 { t0 } else { t0 + DEFAULT_FLUSH_TIMEOUT };
        h.agent.run_once(now);
        read_avail(&mut sniffer, &mut got);
        if got == b"raw!" {
            break;
        }
    }
    assert_eq!(got, b"raw!");
}

/// Changing the instrument address while connected bounces the attachment
/// and redials the new endpoint.
#[test]
fn instrument_reconfig_bounces_connection() {
    let mut h = tcp_harness(|_| {});
    let t0 = Nanos::from_secs(1_700_000_000);
    let mut old_instrument = accept_instrument(&mut h, t0);
    let config_addr = h.agent.config_addr().unwrap();
    let mut config = connect_peer(&mut h, config_addr, ClientRole::Config, t0);

    let new_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    new_listener.set_nonblocking(true).unwrap();
    let new_port = new_listener.local_addr().unwrap().port();
    config.write_all(format!("instrument_data_port {new_port}\n").as_bytes()).unwrap();

    // the prior socket is closed...
    let mut scrap = Vec::new();
    let mut eof = false;
    for _ in 0..CYCLES {
        h.agent.run_once(t0);
        eof = read_avail(&mut old_instrument, &mut scrap);
        if eof {
            break;
        }
    }
    assert!(eof, "old instrument socket should have been closed");

    // ...and the agent redials the new address
    let mut accepted = None;
    for _ in 0..CYCLES {
        h.agent.run_once(t0);
        if accepted.is_none()
            && let Ok((sock, _)) = new_listener.accept()
        {
            accepted = Some(sock);
        }
        if accepted.is_some() && h.agent.connection_state() == ConnectionState::Ready {
            break;
        }
    }
    assert!(accepted.is_some(), "agent never dialed the new instrument port");
    assert_eq!(h.agent.connection_state(), ConnectionState::Ready);
}

/// Changing the instrument address while the attachment is down is
/// recorded silently; the next retry dials the new endpoint.
#[test]
fn instrument_reconfig_while_down_is_recorded_silently() {
    let dead_port = free_port();
    let mut h = tcp_harness(|cfg| cfg.instrument_data_port = dead_port);
    let t0 = Nanos::from_secs(1_700_000_000);

    let data_addr = h.agent.data_addr().unwrap();
    let mut driver = connect_peer(&mut h, data_addr, ClientRole::DriverData, t0);

    // the first connect is refused and the attachment settles disconnected
    for _ in 0..50 {
        h.agent.run_once(t0);
    }
    assert_ne!(h.agent.connection_state(), ConnectionState::Ready);

    let config_addr = h.agent.config_addr().unwrap();
    let mut config = connect_peer(&mut h, config_addr, ClientRole::Config, t0);
    let live_port = h.instrument_listener.local_addr().unwrap().port();
    config.write_all(format!("instrument_data_port {live_port}\n").as_bytes()).unwrap();
    for _ in 0..20 {
        h.agent.run_once(t0);
    }
    assert_eq!(h.agent.config().instrument_data_port, live_port);

    // past the retry backoff the agent dials the recorded address
    let t1 = t0 + Nanos::from_secs(35);
    let _instrument = accept_instrument(&mut h, t1);
    assert_eq!(h.agent.connection_state(), ConnectionState::Ready);

    // no reconfigure bounce was announced, only the usual connect status
    let mut acc = Vec::new();
    read_avail(&mut driver, &mut acc);
    for pkt in split_frames(&mut acc) {
        if pkt.packet_type() == PacketType::PortAgentStatus {
            let payload = String::from_utf8_lossy(pkt.payload()).to_string();
            assert!(!payload.contains("reconfigured"), "unexpected status: {payload}");
        }
    }
}

/// An invalid config command answers with a fault on the same channel.
#[test]
fn invalid_config_command_faults() {
    let mut h = tcp_harness(|_| {});
    let t0 = Nanos::from_secs(1_700_000_000);
    let _instrument = accept_instrument(&mut h, t0);
    let config_addr = h.agent.config_addr().unwrap();
    let mut config = connect_peer(&mut h, config_addr, ClientRole::Config, t0);

    config.write_all(b"frobnicate 9\n").unwrap();

    let mut reply = Vec::new();
    for _ in 0..CYCLES {
        h.agent.run_once(t0);
        read_avail(&mut config, &mut reply);
        if !reply.is_empty() {
            break;
        }
    }
    let reply = String::from_utf8_lossy(&reply).to_string();
    assert!(reply.contains("PORT_AGENT_FAULT"), "reply: {reply}");
    assert!(reply.contains("unrecognized command"), "reply: {reply}");
}
