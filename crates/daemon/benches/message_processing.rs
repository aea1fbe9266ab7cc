//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths in the daemon:
//! - Line codec encoding/decoding of requests and output events
//! - Output broadcaster fan-out
//! - Channel throughput for output chunks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daemon::session::OutputBroadcaster;
use protocol::{LineCodec, OutputEvent, Request, RequestEnvelope, ServerMessage};

fn output_message(size: usize) -> ServerMessage {
    ServerMessage::Output(OutputEvent {
        session_id: "t1".to_string(),
        data: vec![b'x'; size],
    })
}

/// Benchmark encoding of pushed output events.
fn bench_output_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_encoding");
    let codec = LineCodec::new();

    // Keystroke echo, typical output chunk, full pty read
    for size in [1usize, 4096, 65536] {
        let message = output_message(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| codec.encode(black_box(message)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark decoding on both sides of the socket.
fn bench_line_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_decoding");
    let codec = LineCodec::new();

    let write = codec
        .encode(&RequestEnvelope {
            id: 42,
            request: Request::write("t1", b"ls -la\r".to_vec()),
        })
        .unwrap();
    group.bench_function("write_request", |b| {
        b.iter(|| {
            let envelope: RequestEnvelope = codec.decode(black_box(&write)).unwrap();
            black_box(envelope)
        });
    });

    let list = codec
        .encode(&RequestEnvelope {
            id: 7,
            request: Request::ListSessions,
        })
        .unwrap();
    group.bench_function("list_request", |b| {
        b.iter(|| {
            let envelope: RequestEnvelope = codec.decode(black_box(&list)).unwrap();
            black_box(envelope)
        });
    });

    let output = codec.encode(&output_message(4096)).unwrap();
    group.throughput(Throughput::Bytes(4096));
    group.bench_function("output_4KB", |b| {
        b.iter(|| {
            let message: ServerMessage = codec.decode(black_box(&output)).unwrap();
            black_box(message)
        });
    });

    group.finish();
}

/// Benchmark fan-out of one chunk to N listeners.
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let session_id = "t1".to_string();
    let data = vec![0u8; 4096];

    for listeners in [1usize, 4, 16] {
        let broadcaster = OutputBroadcaster::new();
        let mut receivers = Vec::with_capacity(listeners);
        runtime.block_on(async {
            for _ in 0..listeners {
                receivers.push(broadcaster.register().await.1);
            }
        });

        group.throughput(Throughput::Bytes((data.len() * listeners) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(listeners),
            &listeners,
            |b, _| {
                b.iter(|| {
                    runtime.block_on(async {
                        let delivered = broadcaster.broadcast(&session_id, data.clone()).await;
                        for rx in receivers.iter_mut() {
                            black_box(rx.recv().await);
                        }
                        delivered
                    })
                });
            },
        );
    }

    group.finish();
}

/// Benchmark channel throughput for output chunks.
fn bench_channel_throughput(c: &mut Criterion) {
    use tokio::sync::mpsc;

    let mut group = c.benchmark_group("channel_throughput");
    group.throughput(Throughput::Bytes(4096));

    group.bench_function("unbounded_send_recv", |b| {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let data = vec![0u8; 4096];

        b.iter(|| {
            tx.send(black_box(data.clone())).unwrap();
            let received = rx.try_recv().unwrap();
            black_box(received)
        });
    });

    group.bench_function("bounded_send_recv", |b| {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
        let data = vec![0u8; 4096];

        b.iter(|| {
            tx.try_send(black_box(data.clone())).unwrap();
            let received = rx.try_recv().unwrap();
            black_box(received)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_output_encoding,
    bench_line_decoding,
    bench_broadcast,
    bench_channel_throughput,
);

criterion_main!(benches);
