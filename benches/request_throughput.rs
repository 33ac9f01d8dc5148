//! Request round-trip and wire codec benchmarks.
//!
//! Measures the correlated request path against an in-process worker and
//! the stdio frame codec using Criterion.

use std::io::Cursor;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use upm_core::host::LocalSpawner;
use upm_core::ipc::codec::{read_frame, write_frame, WireFrame, PRIMARY_PORT, TAG_SERVICE_MESSAGE};
use upm_core::types::SpawnOptions;
use upm_core::{Config, ServiceHost};

const MAX_FRAME: u32 = 5 * 1024 * 1024;

fn bench_write_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("write_frame");
    for &size in payload_sizes {
        let frame = WireFrame::new(TAG_SERVICE_MESSAGE, PRIMARY_PORT, vec![0xABu8; size]);
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, f| {
            b.iter(|| {
                rt.block_on(async {
                    let mut buf = Vec::with_capacity(size + 9);
                    write_frame(&mut buf, black_box(f), MAX_FRAME).await.unwrap();
                    buf
                })
            });
        });
    }
    group.finish();
}

fn bench_read_frame(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let payload_sizes: &[usize] = &[0, 64, 1024, 4096, 65536];

    let mut group = c.benchmark_group("read_frame");
    for &size in payload_sizes {
        let frame = WireFrame::new(TAG_SERVICE_MESSAGE, 3, vec![0xABu8; size]);
        let wire = rt.block_on(async {
            let mut buf = Vec::new();
            write_frame(&mut buf, &frame, MAX_FRAME).await.unwrap();
            buf
        });

        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, w| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(black_box(w.as_slice()));
                    read_frame(&mut cursor, MAX_FRAME).await.unwrap()
                })
            });
        });
    }
    group.finish();
}

fn bench_request_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let spawner = LocalSpawner::new();
    spawner.register("echo", |dispatcher, _| {
        dispatcher.add_request_handler("echo", |ctx| async move { Ok(Value::Array(ctx.args)) });
        Ok(())
    });
    let host = ServiceHost::new(Arc::new(spawner), Config::default());
    let service = rt
        .block_on(host.create_service("bench".parse().unwrap(), "echo", SpawnOptions::default()))
        .unwrap();
    let client = rt
        .block_on(async { service.create_main_client("bench-client".parse().unwrap()) })
        .unwrap();

    let mut group = c.benchmark_group("request_round_trip");
    group.bench_function("service", |b| {
        b.iter(|| {
            rt.block_on(service.execute_request("echo", vec![black_box(json!("payload"))]))
                .unwrap()
        });
    });
    group.bench_function("channel_client", |b| {
        b.iter(|| {
            rt.block_on(client.execute_request("echo", vec![black_box(json!("payload"))]))
                .unwrap()
        });
    });
    group.finish();

    rt.block_on(host.destroy_all());
}

criterion_group!(benches, bench_write_frame, bench_read_frame, bench_request_round_trip);
criterion_main!(benches);
