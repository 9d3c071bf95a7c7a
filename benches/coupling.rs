use burn_core::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use rgflow::lattice::Lattice;
use rgflow::{mera_init, Flow, LayerMap, MeraConfig, RealNvpConfig, Tebd};

type B = NdArray<f32>;

fn bench_coupling(c: &mut Criterion) {
    let device = Default::default();
    let mut group = c.benchmark_group("coupling_layer");
    group.sample_size(30);

    for &(batch, dim) in &[(64usize, 1usize), (64, 2), (256, 2)] {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let block = vec![2usize; dim];
        let layer = RealNvpConfig::default().init::<B, _>(&block, &mut rng, &device).unwrap();
        let x = Tensor::<B, 2>::random([batch, block.iter().product()], Distribution::Normal(0.0, 1.0), &device);

        group.bench_with_input(BenchmarkId::new("forward", format!("b{batch}_d{dim}")), &x, |b, x| {
            b.iter(|| layer.forward(x.clone()).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("inverse", format!("b{batch}_d{dim}")), &x, |b, x| {
            b.iter(|| layer.inverse(x.clone()).unwrap())
        });
    }
    group.finish();
}

fn bench_flows(c: &mut Criterion) {
    let device = Default::default();
    let mut group = c.benchmark_group("flow_forward");
    group.sample_size(20);

    for &length in &[8usize, 16] {
        let lattice = Lattice::new(length, 2).unwrap();
        let x = Tensor::<B, 2>::random([64, lattice.nvars()], Distribution::Normal(0.0, 1.0), &device);

        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let tebd = Tebd::<B>::init(lattice, 3, &RealNvpConfig::default(), &mut rng, &device).unwrap();
        group.bench_with_input(BenchmarkId::new("tebd_depth3", format!("L{length}")), &x, |b, x| {
            b.iter(|| tebd.forward(x.clone()).unwrap())
        });

        for (label, map) in [("mera_distinct", LayerMap::Distinct), ("mera_shared", LayerMap::Shared)] {
            let cfg = MeraConfig { length, dim: 2, layer_map: map, ..MeraConfig::default() };
            let mera = mera_init::<B>(&cfg, &device).unwrap();
            group.bench_with_input(BenchmarkId::new(label, format!("L{length}")), &x, |b, x| {
                b.iter(|| mera.forward(x.clone()).unwrap())
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_coupling, bench_flows);
criterion_main!(benches);
