//! Client-side dispatch benchmarks: decoding buffered traffic and routing it
//! to handlers and pending invocations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hubwire_client::{CallbackManager, HubConnectionBuilder, ProtocolKind, Value};
use hubwire_protocol::{HubProtocol, InvocationMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn bench_handle_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_message");

    for kind in [ProtocolKind::Json, ProtocolKind::MessagePack] {
        let hub = HubConnectionBuilder::new("ws://localhost:5000/hub")
            .with_protocol(kind)
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        hub.on("Tick", move |args| {
            counter.fetch_add(args.len(), Ordering::Relaxed);
        })
        .unwrap();

        for batch in [1, 10, 100] {
            let mut traffic = Vec::new();
            for i in 0..batch {
                let message = InvocationMessage::non_blocking("Tick", vec![Value::from(i), Value::from("payload")]);
                traffic.extend_from_slice(&hub.protocol().write_message(&message.into()).unwrap());
            }

            group.throughput(Throughput::Elements(batch as u64));
            group.bench_with_input(
                BenchmarkId::new(kind.name(), batch),
                &traffic,
                |b, traffic| {
                    b.iter(|| hub.handle_message(black_box(traffic)).unwrap());
                },
            );
        }
    }

    group.finish();
}

fn bench_callbacks(c: &mut Criterion) {
    let mut group = c.benchmark_group("callbacks");
    group.throughput(Throughput::Elements(1));

    let manager = CallbackManager::new();
    group.bench_function("register_invoke", |b| {
        b.iter(|| {
            let id = manager.register(Box::new(|result| {
                black_box(result.ok());
            }));
            black_box(manager.invoke(&id, None, Value::Null, true))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_handle_message, bench_callbacks);

criterion_main!(benches);
