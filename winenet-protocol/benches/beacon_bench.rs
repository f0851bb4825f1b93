use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use winenet_protocol::beacon::{AckStatus, Beacon, NeighborState, SpeakerCause};
use winenet_protocol::packet::{DataPacket, Packet};
use winenet_protocol::peer::PeerId;

fn bench_beacon_encode(c: &mut Criterion) {
    let beacon = Beacon::BroadcastSpeaker {
        cause: SpeakerCause::Claim,
        rand_tiebreak: 0xDEAD_BEEF,
    };

    c.bench_function("beacon_encode", |b| {
        b.iter(|| {
            let bytes = black_box(&beacon).to_bytes();
            black_box(bytes);
        });
    });
}

fn bench_beacon_decode(c: &mut Criterion) {
    let state = NeighborState {
        paired_speaker: Some(PeerId::new(42)),
        in_progress_transid: Some(17),
        has_pending_packet_data: true,
        rand_tiebreak: 99,
    };
    let bytes = Beacon::QueryState(Some(state)).to_bytes();

    c.bench_function("beacon_decode_query_state", |b| {
        b.iter(|| {
            let beacon = Beacon::from_bytes(black_box(&bytes)).unwrap();
            black_box(beacon);
        });
    });

    let ack = Beacon::frame_ack(AckStatus::Ok, 1234).to_bytes();
    c.bench_function("beacon_decode_ack", |b| {
        b.iter(|| {
            let beacon = Beacon::from_bytes(black_box(&ack)).unwrap();
            black_box(beacon);
        });
    });
}

fn bench_data_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_packet");
    let packet = Packet::Data(DataPacket::new(7, false, Bytes::from(vec![0u8; 1024])));
    let bytes = packet.to_bytes();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("serialize", |b| {
        b.iter(|| {
            let bytes = black_box(&packet).to_bytes();
            black_box(bytes);
        });
    });

    group.bench_function("deserialize", |b| {
        b.iter(|| {
            let packet = Packet::from_bytes(black_box(&bytes)).unwrap();
            black_box(packet);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_beacon_encode,
    bench_beacon_decode,
    bench_data_packet
);
criterion_main!(benches);
