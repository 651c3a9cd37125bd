//! Benchmarks for gantry core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gantry::core::planner::{self, ModuleFilter};
use gantry::core::types::{Action, BackendKind, Module, ModuleOptions};
use gantry::core::{parser, report, resolver};
use indexmap::IndexMap;
use std::path::PathBuf;

fn bench_config_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_fingerprint");
    for size in [256, 4096, 65536] {
        let input: String = "x".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| black_box(report::config_fingerprint(black_box(input))));
        });
    }
    group.finish();
}

fn bench_yaml_parse(c: &mut Criterion) {
    let yaml = r#"
version: "1.0"
name: bench-config
namespace: acme
default_environment: dev
branch_mapping:
  - pattern: "^main$"
    environment: prod
  - pattern: "^release/(?P<env>[a-z]+)$"
environments:
  dev:
    params: { region: us-east-1, size: small }
  prod:
    params: { region: us-west-2, size: large }
params:
  owner: platform
modules:
  - path: network/vpc.cfn
    params: { cidr: 10.0.0.0/16 }
  - path: data/db.tf
    depends_on: [vpc]
    environments:
      prod: { instance_class: db.r6g.large }
  - path: services/api.sls
    depends_on: [db]
  - path: web/site.cdk
    depends_on: [api]
    environments:
      dev: false
"#;
    c.bench_function("parse_config", |b| {
        b.iter(|| {
            let config = parser::parse_config(black_box(yaml)).unwrap();
            black_box(parser::validate_config(&config));
        });
    });
}

/// Layered DAG: each module depends on up to two modules of the previous layer.
fn layered_modules(layers: usize, width: usize) -> Vec<Module> {
    let mut modules = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for slot in 0..width {
            let depends_on = if layer == 0 {
                vec![]
            } else {
                vec![
                    format!("m{}-{}", layer - 1, slot),
                    format!("m{}-{}", layer - 1, (slot + 1) % width),
                ]
            };
            let id = format!("m{}-{}", layer, slot);
            modules.push(Module {
                path: PathBuf::from(&id),
                id,
                backend: BackendKind::Terraform,
                depends_on,
                params: IndexMap::new(),
                env_vars: IndexMap::new(),
                options: ModuleOptions::default(),
                enabled: true,
                declaration_index: modules.len(),
            });
        }
    }
    modules
}

fn bench_graph_and_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_and_plan");
    for (layers, width) in [(5, 4), (10, 10), (20, 25)] {
        let modules = layered_modules(layers, width);
        group.bench_with_input(
            BenchmarkId::from_parameter(modules.len()),
            &modules,
            |b, modules| {
                b.iter(|| {
                    let graph = resolver::build(black_box(modules)).unwrap();
                    let plan = planner::plan(
                        &graph,
                        modules,
                        Action::Deploy,
                        Action::Deploy.direction(),
                        &ModuleFilter::default(),
                    )
                    .unwrap();
                    black_box(plan);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_config_fingerprint,
    bench_yaml_parse,
    bench_graph_and_plan
);
criterion_main!(benches);
