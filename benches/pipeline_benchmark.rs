//! Benchmarks for the request pipeline hot paths

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use warden::config::SafetyConfig;
use warden::gateway::fingerprint;
use warden::router::ab_bucket;
use warden::safety::{redact, Direction, SafetyScreener};
use warden::{Message, Request};

fn create_prompt(size: usize) -> String {
    let pattern = "Please summarise the quarterly report and email it to ops@example.com. ";
    pattern.chars().cycle().take(size).collect()
}

fn bench_safety_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("safety_scan");
    let screener = SafetyScreener::new(SafetyConfig::default());

    for size in [256, 4096, 65536].iter() {
        let text = create_prompt(*size);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("input", size), &text, |b, text| {
            b.iter(|| screener.scan(black_box(text), Direction::Input))
        });
        group.bench_with_input(BenchmarkId::new("output", size), &text, |b, text| {
            b.iter(|| screener.scan(black_box(text), Direction::Output))
        });
    }

    group.finish();
}

fn bench_redaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("redaction");
    let screener = SafetyScreener::new(SafetyConfig::default());

    for size in [256, 4096, 65536].iter() {
        let text = create_prompt(*size);
        let findings = screener.scan(&text, Direction::Input);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("size", size), &text, |b, text| {
            b.iter(|| redact(black_box(text), black_box(&findings)))
        });
    }

    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");

    for turns in [1, 8, 32].iter() {
        let messages: Vec<Message> = (0..*turns)
            .map(|i| Message::new(if i % 2 == 0 { "user" } else { "assistant" }, create_prompt(512)))
            .collect();
        let request = Request::new("gpt-4", messages);

        group.bench_with_input(BenchmarkId::new("turns", turns), &request, |b, request| {
            b.iter(|| fingerprint(black_box(request)))
        });
    }

    group.finish();
}

fn bench_ab_bucket(c: &mut Criterion) {
    let now = chrono::Utc::now();
    let hour = std::time::Duration::from_secs(3600);

    c.bench_function("ab_bucket", |b| {
        b.iter(|| ab_bucket(black_box("project:research"), now, hour))
    });
}

criterion_group!(
    benches,
    bench_safety_scan,
    bench_redaction,
    bench_fingerprint,
    bench_ab_bucket,
);
criterion_main!(benches);
