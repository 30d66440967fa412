//! Performance benchmarks for memcon
//!
//! Run with: cargo bench --package memcon-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memcon_core::manager::layout_for;
use memcon_core::{
    ClientMemoryManager, LocalMemoryProvider, MemoryLayoutPlanner, MemoryProvider, MemoryTechnology,
    QueueMemoryConfig, ServerConfig, ServerMemoryManager, SlotIndex, SpscConsumer, SpscProducer,
};
use std::sync::Arc;

fn provider() -> Arc<dyn MemoryProvider> {
    Arc::new(LocalMemoryProvider::new())
}

/// Queue ends of the server towards one client, plus the client's ends
fn connected_queues(
    capacity: u32,
) -> (
    (SpscProducer<SlotIndex>, SpscConsumer<SlotIndex>),
    (SpscProducer<SlotIndex>, SpscConsumer<SlotIndex>),
) {
    let config = ServerConfig {
        number_of_slots: capacity,
        max_number_receivers: 1,
        ..ServerConfig::default()
    };
    let server = ServerMemoryManager::new(&config, provider()).unwrap();
    let client = ClientMemoryManager::new(MemoryTechnology::SharedMemory, capacity, provider()).unwrap();
    let server_memory = server.allocate_queue_memory().unwrap();
    let client_memory = client.allocate_queue_memory().unwrap();

    let client_view = server
        .map_client_queue_memory(&client_memory.exchange_handle())
        .unwrap();
    let server_ends = server
        .initialize_queue_ends(0, &server_memory.read_writable(), &client.queue_config(), &client_view)
        .unwrap();
    let server_config: QueueMemoryConfig = server.queue_config(0).unwrap();
    let server_view = client
        .map_server_queue_memory(&server_memory.exchange_handle(), &server_config)
        .unwrap();
    let client_ends = client
        .initialize_queue_ends(&client_memory.read_writable(), &server_config, &server_view)
        .unwrap();
    (server_ends, client_ends)
}

fn bench_produce_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("produce_consume");

    for capacity in [16u32, 256, 4096].iter() {
        group.throughput(Throughput::Elements(*capacity as u64));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
            let ((mut producer, _), (_, mut consumer)) = connected_queues(capacity);
            b.iter(|| {
                for i in 0..capacity {
                    black_box(producer.produce(i).unwrap());
                }
                while let Some(i) = consumer.consume().unwrap() {
                    black_box(i);
                }
            });
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let ((mut to_client, mut from_client), (mut to_server, mut from_server)) = connected_queues(64);

    c.bench_function("slot_round_trip", |b| {
        b.iter(|| {
            to_client.produce(7).unwrap();
            let index = from_server.consume().unwrap().unwrap();
            to_server.produce(index).unwrap();
            black_box(from_client.consume().unwrap());
        });
    });
}

fn bench_fill_level(c: &mut Criterion) {
    let ((mut producer, _), _) = connected_queues(256);
    for i in 0..128 {
        producer.produce(i).unwrap();
    }

    c.bench_function("fill_level", |b| {
        b.iter(|| {
            black_box(producer.fill_level().unwrap());
        });
    });
}

fn bench_layout(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout");

    group.bench_function("planner_1024_objects", |b| {
        b.iter(|| {
            let mut planner = MemoryLayoutPlanner::new(4096);
            for _ in 0..1024 {
                black_box(planner.add_object_aligned::<u32>(64));
            }
            black_box(planner.required_memory_size())
        });
    });

    group.bench_function("slot_layout_256", |b| {
        let layout = layout_for(MemoryTechnology::SharedMemory);
        b.iter(|| black_box(layout.slot_layout(256, 4096, 64)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_produce_consume,
    bench_round_trip,
    bench_fill_level,
    bench_layout
);
criterion_main!(benches);
