//! End-to-end protocol scenarios
//!
//! Discovery, a multi-frame transfer, an unresponsive listener, a silent
//! speaker and the speaker handoff, each driven on the simulated medium.

use bytes::Bytes;
use std::time::Duration;
use winenet_protocol::{
    AbortReason, AckStatus, Beacon, DeliveryOutcome, Direction, Packet, PeerId, State,
};
use winenet_tests::{pattern, Record, SimNet};

fn beacons(sent: Vec<(Option<PeerId>, Packet)>) -> Vec<(Option<PeerId>, Beacon)> {
    sent.into_iter()
        .filter_map(|(dest, packet)| match packet {
            Packet::Beacon(beacon) => Some((dest, beacon)),
            Packet::Data(_) => None,
        })
        .collect()
}

fn is_frame_ack(packet: &Packet) -> bool {
    matches!(
        packet,
        Packet::Beacon(Beacon::Ack {
            last_transid: Some(_),
            ..
        })
    )
}

/// Position and time of the first record matching `wanted`
fn first_record(net: &SimNet, wanted: impl Fn(&Record) -> bool) -> (usize, Duration) {
    net.records()
        .iter()
        .enumerate()
        .find(|(_, record)| wanted(*record))
        .map(|(index, record)| (index, record.at()))
        .expect("record not found")
}

#[test]
fn test_discovery_validates_both_sides() {
    let mut net = SimNet::new(1);
    let a = net.add(1);
    let b = net.add(2);
    net.join(a, b);
    net.join(b, a);
    net.start_all();
    net.run_for(Duration::from_millis(20));

    let from_a = beacons(net.sent_by(a));
    let from_b = beacons(net.sent_by(b));
    assert_eq!(from_a[0], (Some(b), Beacon::Ping(Direction::Request)));
    assert_eq!(from_b[0], (Some(a), Beacon::Ping(Direction::Response)));
    assert!(!from_b
        .iter()
        .any(|(_, beacon)| *beacon == Beacon::Ping(Direction::Request)));

    assert!(net.node(a).neighbors().is_valid(b));
    assert!(net.node(b).neighbors().is_valid(a));
    assert_eq!(net.node(a).state(), State::Idle);
    assert_eq!(net.node(b).state(), State::Idle);
}

#[test]
fn test_ten_packet_buffer_in_three_frames() {
    let mut net = SimNet::mesh(2, 2);
    let (a, b) = (PeerId::new(1), PeerId::new(2));
    // Eight bytes per packet
    let buffer = pattern(3, 80);
    let id = net.submit(a, buffer.clone());
    assert!(net.run_until_settled(Duration::from_secs(10)));

    assert_eq!(net.outcome_of(a, id), Some(DeliveryOutcome::Completed));
    assert_eq!(net.deliveries(b), &[(a, buffer)]);

    let data: Vec<(u32, bool)> = net
        .sent_by(a)
        .into_iter()
        .filter_map(|(_, packet)| match packet {
            Packet::Data(data) => Some((data.index(), data.is_last())),
            Packet::Beacon(_) => None,
        })
        .collect();
    assert_eq!(data.len(), 10);
    assert_eq!(data[9], (9, true));
    assert!(data[..9].iter().all(|(_, last)| !last));

    let frame_acks: Vec<Beacon> = beacons(net.sent_by(b))
        .into_iter()
        .map(|(_, beacon)| beacon)
        .filter(|beacon| is_frame_ack(&Packet::Beacon(*beacon)))
        .collect();
    assert_eq!(
        frame_acks,
        vec![
            Beacon::frame_ack(AckStatus::Ok, 3),
            Beacon::frame_ack(AckStatus::Ok, 7),
            Beacon::frame_ack(AckStatus::Ok, 9),
        ]
    );
}

#[test]
fn test_listener_that_never_acks_frames() {
    let mut net = SimNet::mesh(2, 3);
    let (a, b) = (PeerId::new(1), PeerId::new(2));
    net.set_filter(move |from, _, packet| from == b && is_frame_ack(packet));

    let started = net.elapsed();
    let id = net.submit(a, pattern(0, 64));
    assert!(net.run_until_settled(Duration::from_secs(10)));

    assert_eq!(
        net.outcome_of(a, id),
        Some(DeliveryOutcome::Aborted(AbortReason::NoAck))
    );
    assert_eq!(net.node(a).state(), State::Idle);
    assert!(net.deliveries(b).is_empty());

    // Three sends of the first frame: the original and two retries
    let first_packets = net
        .sent_by(a)
        .into_iter()
        .filter(|(_, packet)| matches!(packet, Packet::Data(d) if d.index() == 0))
        .count();
    assert_eq!(first_packets, 3);

    let config = SimNet::test_config(1);
    let bound = config.ack_timeout * u32::from(config.max_retries) + config.listener_timeout;
    assert!(net.elapsed() - started <= bound + Duration::from_millis(20));
}

#[test]
fn test_listener_that_never_answers_the_claim() {
    let mut net = SimNet::mesh(2, 4);
    let (a, b) = (PeerId::new(1), PeerId::new(2));
    net.set_filter(move |from, _, packet| {
        from == b && matches!(packet, Packet::Beacon(Beacon::Ack { .. }))
    });

    let id = net.submit(a, pattern(0, 16));
    assert!(net.run_until_settled(Duration::from_secs(10)));
    assert_eq!(
        net.outcome_of(a, id),
        Some(DeliveryOutcome::Aborted(AbortReason::NoAck))
    );
    assert!(!net
        .sent_by(a)
        .iter()
        .any(|(_, packet)| matches!(packet, Packet::Data(_))));
}

#[test]
fn test_silent_speaker_releases_listener() {
    let mut net = SimNet::mesh(2, 5);
    let (a, b) = (PeerId::new(1), PeerId::new(2));
    // Three frames of 4 packets
    let id = net.submit(a, pattern(0, 96));

    // Claim lands at +1ms, the ACK at +2ms and the first frame at +3ms
    net.run_for(Duration::from_micros(2500));
    assert_eq!(net.node(b).state(), State::Listener);
    assert_eq!(net.node(b).paired_speaker(), Some(a));
    net.cut(a, b);

    net.run_for(SimNet::test_config(2).listener_timeout + Duration::from_millis(10));
    assert_eq!(net.node(b).state(), State::Idle);
    assert_eq!(net.node(b).paired_speaker(), None);
    assert!(net.transitions(b).contains(&(State::Listener, State::Idle)));
    assert!(net.deliveries(b).is_empty());

    assert!(net.run_until_settled(Duration::from_secs(10)));
    assert_eq!(
        net.outcome_of(a, id),
        Some(DeliveryOutcome::Aborted(AbortReason::NoAck))
    );
}

#[test]
fn test_handoff_to_unprocessed_neighbor() {
    let mut net = SimNet::new(6);
    let a = net.add(1);
    let c = net.add(3);
    net.discover_all();
    net.start_all();
    net.run_for(Duration::from_millis(20));

    let first = pattern(1, 20);
    let second = pattern(2, 20);
    let id_a = net.submit(a, first.clone());
    net.run_for(Duration::from_micros(2500));
    assert_eq!(net.node(c).state(), State::Listener);
    // C is bound and has to wait for the token
    let id_c = net.submit(c, second.clone());
    assert_eq!(net.node(c).queued(), 1);

    assert!(net.run_until_settled(Duration::from_secs(10)));
    assert_eq!(net.outcome_of(a, id_a), Some(DeliveryOutcome::Completed));
    assert_eq!(net.outcome_of(c, id_c), Some(DeliveryOutcome::Completed));

    // The grant leaves A before A goes idle, and C speaks only after both
    let grant = first_record(&net, |record| {
        matches!(record, Record::Sent { from, dest, packet: Packet::Beacon(Beacon::GoSpeaker), .. }
            if *from == a && *dest == Some(c))
    });
    let a_idle = first_record(&net, |record| {
        matches!(record, Record::StateChanged { node, from: State::Speaker, to: State::Idle, .. }
            if *node == a)
    });
    let c_speaks = first_record(&net, |record| {
        matches!(record, Record::StateChanged { node, from: State::Listener, to: State::Speaker, .. }
            if *node == c)
    });
    assert!(grant.0 < a_idle.0 && a_idle.0 < c_speaks.0);
    assert!(grant.1 <= a_idle.1);
    assert!(c_speaks.1 >= a_idle.1 + winenet_tests::DEFAULT_LATENCY);
    assert_eq!(net.deliveries(c), &[(a, first)]);
    assert_eq!(net.deliveries(a), &[(c, second)]);
}

#[test]
fn test_handoff_with_nothing_to_send_passes_on() {
    let mut net = SimNet::mesh(3, 7);
    let (a, b) = (PeerId::new(1), PeerId::new(2));
    let id = net.submit(a, Bytes::from_static(b"token"));
    assert!(net.run_until_settled(Duration::from_secs(10)));
    assert_eq!(net.outcome_of(a, id), Some(DeliveryOutcome::Completed));

    // First neighbor of the round gets the token and has no data
    assert!(net
        .sent_by(a)
        .contains(&(Some(b), Packet::Beacon(Beacon::GoSpeaker))));
    let b_transitions = net.transitions(b);
    assert!(b_transitions.contains(&(State::Listener, State::Speaker)));
    assert_eq!(b_transitions.last(), Some(&(State::Speaker, State::Idle)));
    assert!(net.violations().is_empty());
}
