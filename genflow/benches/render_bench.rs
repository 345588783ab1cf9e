//! Benchmarks for template rendering and message ids.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::BTreeMap;
use uuid::Uuid;

use genflow::core::{ServiceSpec, Stage};
use genflow::queue::MessageId;
use genflow::template::{TemplateCatalog, TemplateEngine};

fn render_benchmark(c: &mut Criterion) {
    let catalog = TemplateCatalog::builtin();
    let engine = TemplateEngine::new();
    let values = BTreeMap::new();

    let Ok(manifest) = catalog.get("rest-api") else {
        return;
    };
    let bare = ServiceSpec::new("bench-api", "rest-api", "staging", "team-a");
    let full = bare
        .clone()
        .with_flags(["database", "redis", "swagger", "auth", "docker"]);

    c.bench_function("render_rest_api_bare", |b| {
        b.iter(|| engine.render(black_box(&manifest), black_box(&bare), &values));
    });

    c.bench_function("render_rest_api_all_flags", |b| {
        b.iter(|| engine.render(black_box(&manifest), black_box(&full), &values));
    });
}

fn message_id_benchmark(c: &mut Criterion) {
    let run = Uuid::now_v7();
    c.bench_function("message_id_derive", |b| {
        b.iter(|| MessageId::derive(black_box("bench-api"), run, Stage::Build, black_box(2)));
    });
}

criterion_group!(benches, render_benchmark, message_id_benchmark);
criterion_main!(benches);
