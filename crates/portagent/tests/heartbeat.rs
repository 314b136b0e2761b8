mod common;

use common::{accept_instrument, connect_peer, read_avail, split_frames, tcp_harness};
use portagent::{packet::PacketType, publish::ClientRole, timing::Nanos};

/// With a 1 s interval, 3.5 s of virtual time yields exactly three
/// heartbeats on the driver data sink.
#[test]
fn heartbeat_cadence_under_virtual_time() {
    let mut h = tcp_harness(|cfg| cfg.heartbeat_interval = Nanos::from_secs(1));
    let t0 = Nanos::from_secs(1_700_000_000);
    let _instrument = accept_instrument(&mut h, t0);
    let data_addr = h.agent.data_addr().unwrap();
    let mut driver = connect_peer(&mut h, data_addr, ClientRole::DriverData, t0);

    // flush anything emitted while the pipeline settled
    for _ in 0..20 {
        h.agent.run_once(t0);
    }
    let mut acc = Vec::new();
    read_avail(&mut driver, &mut acc);
    split_frames(&mut acc);

    h.agent.start(t0);
    let mut beats = 0usize;
    for step in 1..=7u64 {
        let now = t0 + Nanos::from_millis(500 * step);
        for _ in 0..3 {
            h.agent.run_once(now);
        }
        read_avail(&mut driver, &mut acc);
        beats += split_frames(&mut acc)
            .iter()
            .filter(|p| p.packet_type() == PacketType::PortAgentHeartbeat)
            .count();
    }
    assert_eq!(beats, 3);
}

/// Heartbeats are zero-payload and carry the emission time.
#[test]
fn heartbeat_packet_shape() {
    let mut h = tcp_harness(|cfg| cfg.heartbeat_interval = Nanos::from_secs(1));
    let t0 = Nanos::from_secs(1_700_000_000);
    let _instrument = accept_instrument(&mut h, t0);
    let data_addr = h.agent.data_addr().unwrap();
    let mut driver = connect_peer(&mut h, data_addr, ClientRole::DriverData, t0);

    for _ in 0..20 {
        h.agent.run_once(t0);
    }
    let mut acc = Vec::new();
    read_avail(&mut driver, &mut acc);
    split_frames(&mut acc);

    h.agent.start(t0);
    let t1 = t0 + Nanos::from_secs(1);
    for _ in 0..3 {
        h.agent.run_once(t1);
    }
    read_avail(&mut driver, &mut acc);
    let beats: Vec<_> = split_frames(&mut acc)
        .into_iter()
        .filter(|p| p.packet_type() == PacketType::PortAgentHeartbeat)
        .collect();
    assert_eq!(beats.len(), 1);
    assert!(beats[0].payload().is_empty());
    assert_eq!(beats[0].packet_size(), 16);
    assert_eq!(beats[0].timestamp().seconds as u64, t1.as_secs_u64() + 2_208_988_800);
}
