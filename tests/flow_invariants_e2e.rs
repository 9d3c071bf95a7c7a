use burn_core::tensor::{Distribution, Tensor};
use burn_ndarray::NdArray;
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use rgflow::lattice::Lattice;
use rgflow::mlp::MlpConfig;
use rgflow::{mera_init, Error, Flow, Gaussian, LayerMap, Mera, MeraConfig, RealNvpConfig, Tebd};

type B = NdArray<f32>;

fn coupling(scale: f32) -> RealNvpConfig {
    RealNvpConfig {
        nlayers: 2,
        s_net: MlpConfig::scale(vec![16]).with_tanh_scale_init(scale),
        t_net: MlpConfig::translation(vec![16]),
    }
}

fn to_vec<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
    t.into_data().to_vec::<f32>().unwrap()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() <= tol * (1.0 + x.abs()), "{x} vs {y}");
    }
}

/// Forward then inverse reproduces the input and the two log-determinants cancel.
fn check_bijection<F: Flow<B>>(flow: &F, batch: usize) {
    let device = Default::default();
    let x = Tensor::<B, 2>::random([batch, flow.nvars()], Distribution::Normal(0.0, 1.0), &device);
    let (z, ld_f) = flow.forward(x.clone()).unwrap();
    let (x_back, ld_i) = flow.inverse(z.clone()).unwrap();
    assert_close(&to_vec(x.clone()), &to_vec(x_back), 1e-4);
    for (f, i) in to_vec(ld_f.clone()).iter().zip(to_vec(ld_i).iter()) {
        assert!((f + i).abs() <= 1e-3, "logdet {f} + {i}");
    }
    // The flow is not the identity, so the check above is not vacuous.
    assert!(to_vec(ld_f).iter().any(|v| v.abs() > 1e-4));
}

#[test]
fn two_layer_zero_tebd_over_four_sites_is_the_identity() {
    let device = Default::default();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let cfg = RealNvpConfig {
        nlayers: 2,
        s_net: MlpConfig::scale(vec![8]).with_zero_init(true),
        t_net: MlpConfig::translation(vec![8]).with_zero_init(true),
    };
    let flow = Tebd::<B>::init(Lattice::new(4, 1).unwrap(), 1, &cfg, &mut rng, &device).unwrap();
    assert_eq!(flow.layers().len(), 2);

    let x = Tensor::<B, 2>::random([7, 4], Distribution::Normal(0.0, 3.0), &device);
    let (z, ld) = flow.forward(x.clone()).unwrap();
    assert_eq!(to_vec(x), to_vec(z));
    assert!(to_vec(ld).iter().all(|&v| v == 0.0));
}

#[test]
fn tebd_is_a_bijection_in_one_and_two_dimensions() {
    let device = Default::default();
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let flow = Tebd::<B>::init(Lattice::new(8, 1).unwrap(), 3, &coupling(0.5), &mut rng, &device)
        .unwrap();
    check_bijection(&flow, 5);

    let flow = Tebd::<B>::init(Lattice::new(4, 2).unwrap(), 2, &coupling(0.5), &mut rng, &device)
        .unwrap();
    check_bijection(&flow, 3);
}

#[test]
fn mera_l8_builds_and_is_a_bijection() {
    let device = Default::default();
    for nrepeat in [1usize, 2] {
        let cfg = MeraConfig {
            length: 8,
            nrepeat,
            coupling: coupling(0.4),
            seed: nrepeat as u64,
            ..MeraConfig::default()
        };
        let flow = mera_init::<B>(&cfg, &device).unwrap();
        assert_eq!(flow.levels(), 3);
        assert_eq!(flow.step_layers().len(), 2 * 3 * nrepeat);
        check_bijection(&flow, 4);
    }
}

#[test]
fn mera_rejects_l6() {
    let device = Default::default();
    let cfg = MeraConfig { length: 6, ..MeraConfig::default() };
    assert!(matches!(mera_init::<B>(&cfg, &device), Err(Error::Construction(_))));

    // Same rejection through the plain constructor.
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let layers = (0..4)
        .map(|_| coupling(0.0).init::<B, _>(&[2], &mut rng, &device).unwrap())
        .collect();
    let res = Mera::new(
        Lattice::new(6, 1).unwrap(),
        Gaussian::new(vec![6]).unwrap(),
        layers,
        1,
        &LayerMap::Shared,
    );
    assert!(matches!(res, Err(Error::Construction(_))));
}

#[test]
fn shared_mera_in_two_dimensions_is_a_bijection() {
    let device = Default::default();
    let cfg = MeraConfig {
        length: 4,
        dim: 2,
        nrepeat: 2,
        layer_map: LayerMap::Shared,
        coupling: coupling(0.4),
        seed: 3,
        ..MeraConfig::default()
    };
    let flow = mera_init::<B>(&cfg, &device).unwrap();
    assert_eq!(flow.layers().len(), 2);
    check_bijection(&flow, 4);
}

#[test]
fn sample_log_probability_matches_density_evaluation() {
    let device = Default::default();
    let cfg = MeraConfig { length: 8, coupling: coupling(0.5), seed: 5, ..MeraConfig::default() };
    let flow = mera_init::<B>(&cfg, &device).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(21);
    let (x, log_q) = flow.sample(16, &mut rng).unwrap();
    let recomputed = flow.log_probability(x).unwrap();
    assert_close(&to_vec(log_q), &to_vec(recomputed), 1e-3);
}

#[test]
fn wrong_width_is_a_shape_error() {
    let device = Default::default();
    let flow = mera_init::<B>(&MeraConfig::default(), &device).unwrap();
    let x = Tensor::<B, 2>::zeros([2, 7], &device);
    assert!(matches!(flow.forward(x.clone()), Err(Error::Shape(_))));
    assert!(matches!(flow.inverse(x), Err(Error::Shape(_))));
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 12,
        .. ProptestConfig::default()
    })]
    #[test]
    fn prop_mera_layer_maps_preserve_bijectivity(
        seed in any::<u64>(),
        map in prop_oneof![Just(LayerMap::Distinct), Just(LayerMap::PerLevel), Just(LayerMap::Shared)],
        nrepeat in 1usize..3,
    ) {
        let device = Default::default();
        let cfg = MeraConfig {
            length: 4,
            nrepeat,
            layer_map: map,
            coupling: coupling(0.5),
            seed,
            ..MeraConfig::default()
        };
        let flow = mera_init::<B>(&cfg, &device).unwrap();
        let x = Tensor::<B, 2>::random([3, 4], Distribution::Normal(0.0, 1.0), &device);
        let (z, ld_f) = flow.forward(x.clone()).unwrap();
        let (x_back, ld_i) = flow.inverse(z).unwrap();
        for (a, b) in to_vec(x).iter().zip(to_vec(x_back).iter()) {
            prop_assert!((a - b).abs() <= 1e-4 * (1.0 + a.abs()));
        }
        for (f, i) in to_vec(ld_f).iter().zip(to_vec(ld_i).iter()) {
            prop_assert!((f + i).abs() <= 1e-3);
        }
    }
}
