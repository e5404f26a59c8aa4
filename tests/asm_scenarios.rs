//! End-to-end scenarios exercised through the crate's public API only:
//! cold-start fit, warm update, the query facade, persistence, and the
//! parallel fan-out helpers.

use asm_guide::asm::{self, AsmConfiguration};
use asm_guide::config;
use asm_guide::lobe;
use asm_guide::mixture::K_MAX;
use asm_guide::parallel::{fit_regions_parallel, FitJob};
use asm_guide::query::SurfaceSamplingDistribution;
use asm_guide::sample::{DirectionalSample, SampleFlags};
use asm_guide::suffstats::SufficientStatistics;
use asm_guide::tracing_sink::NullTracingSink;

use rand::{Rng, SeedableRng};

fn draw_batch(mu: [f64; 3], kappa: f64, n: usize, seed: u64) -> Vec<DirectionalSample> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let u1: f64 = rng.gen();
            let u2: f64 = rng.gen();
            let dir = lobe::sample(mu, kappa, u1, u2);
            DirectionalSample::new(
                [0.0, 0.0, 0.0],
                [dir[0] as f32, dir[1] as f32, dir[2] as f32],
                1.0,
                1.0,
                3.0,
                SampleFlags::default(),
            )
        })
        .collect()
}

#[test]
fn single_lobe_batch_recovers_mean_direction_and_concentration() {
    let mu = lobe::normalize([0.2, 0.6, 0.77]);
    let samples = draw_batch(mu, 25.0, 12_000, 1000);
    let cfg = AsmConfiguration::default();

    let mut sink = NullTracingSink;
    let (mix, stats, fit_stats) = asm::fit(4, &samples, &cfg, &mut sink).unwrap();

    assert_eq!(mix.num_components(), 1);
    assert!(lobe::dot(mix.lobe(0).mu, mu) > 0.999);
    assert!(mix.lobe(0).kappa > 15.0 && mix.lobe(0).kappa < 35.0);
    assert!(!fit_stats.error);
    assert_eq!(stats.sufficient.num_components(), 1);
}

#[test]
fn bimodal_batch_splits_a_single_seed_component_into_two() {
    let mut samples = draw_batch([1.0, 0.0, 0.0], 40.0, 6000, 1001);
    samples.extend(draw_batch([-1.0, 0.0, 0.0], 40.0, 6000, 1002));
    let cfg = AsmConfiguration::default();

    let mut sink = NullTracingSink;
    let (mix, _stats, fit_stats) = asm::fit(1, &samples, &cfg, &mut sink).unwrap();

    assert_eq!(mix.num_components(), 2);
    assert!(fit_stats.num_splits >= 1);
    let total_weight: f64 = (0..mix.num_components()).map(|k| mix.weight(k)).sum();
    assert!((total_weight - 1.0).abs() < 1e-6);
}

#[test]
fn warm_update_tracks_a_distribution_shift_across_batches() {
    let mu_a = lobe::normalize([0.0, 0.0, 1.0]);
    let samples_a = draw_batch(mu_a, 22.0, 10_000, 1003);
    let cfg = AsmConfiguration::default();
    let mut sink = NullTracingSink;
    let (mut mix, mut stats, _) = asm::fit(1, &samples_a, &cfg, &mut sink).unwrap();
    assert!(lobe::dot(mix.lobe(0).mu, mu_a) > 0.99);

    let mu_b = lobe::normalize([1.0, 0.0, 0.0]);
    for i in 0..6 {
        let samples_b = draw_batch(mu_b, 22.0, 4000, 1100 + i);
        let fit_stats = asm::update(&mut mix, &mut stats, &samples_b, &cfg, &mut sink).unwrap();
        assert!(!fit_stats.error);
    }

    let dominant = (0..mix.num_components())
        .max_by(|&a, &b| mix.weight(a).partial_cmp(&mix.weight(b)).unwrap())
        .unwrap();
    assert!(lobe::dot(mix.lobe(dominant).mu, mu_b) > 0.9);
}

#[test]
fn decay_shrinks_accumulated_mass_monotonically_across_repeated_batches() {
    let mu = lobe::normalize([0.0, 1.0, 0.0]);
    let samples = draw_batch(mu, 20.0, 4000, 1200);
    let cfg = AsmConfiguration::default();
    let mut sink = NullTracingSink;
    let (_mix, mut stats, _) = asm::fit(1, &samples, &cfg, &mut sink).unwrap();

    let mut previous_mass = stats.sufficient.sum_gamma(0);
    for _ in 0..5 {
        stats.sufficient.decay(0.8);
        let mass = stats.sufficient.sum_gamma(0);
        assert!(mass < previous_mass);
        previous_mass = mass;
    }
}

#[test]
fn query_facade_applies_parallax_and_reports_validity_at_a_displaced_query_point() {
    let mu = lobe::normalize([0.0, 0.0, 1.0]);
    let samples = draw_batch(mu, 30.0, 8000, 1300);
    let cfg = AsmConfiguration::default();
    let mut sink = NullTracingSink;
    let (mix, _stats, _) = asm::fit(1, &samples, &cfg, &mut sink).unwrap();

    let (dist_near, ok_near) = SurfaceSamplingDistribution::init(&mix, mix.pivot_position(), 0.0);
    assert!(ok_near);

    let displaced = [mix.pivot_position()[0] + 5.0, mix.pivot_position()[1], mix.pivot_position()[2]];
    let (dist_far, ok_far) = SurfaceSamplingDistribution::init(&mix, displaced, 0.0);
    assert!(ok_far);

    let mut rng = rand::rngs::StdRng::seed_from_u64(1301);
    let u1 = rng.gen();
    let u2 = rng.gen();
    let near_sample = dist_near.sample(u1, u2);
    let far_sample = dist_far.sample(u1, u2);
    assert!((lobe::norm(near_sample) - 1.0).abs() < 1e-9);
    assert!((lobe::norm(far_sample) - 1.0).abs() < 1e-9);
}

#[test]
fn capacity_exceeded_is_reported_without_failing_the_update() {
    let mu = lobe::normalize([0.3, 0.1, 0.9]);
    let seed_samples = draw_batch(mu, 15.0, K_MAX * 200, 1400);
    let mut cfg = AsmConfiguration::default();
    cfg.use_split_and_merge = false;
    let mut sink = NullTracingSink;
    let (mut mix, mut stats, _) = asm::fit(K_MAX, &seed_samples, &cfg, &mut sink).unwrap();
    assert_eq!(mix.num_components(), K_MAX);

    cfg.use_split_and_merge = true;
    cfg.min_samples_for_splitting = 0;
    cfg.min_samples_for_merging = u64::MAX;
    cfg.splitting_threshold = -1.0;

    let mut bimodal = draw_batch([1.0, 0.0, 0.0], 50.0, 3000, 1401);
    bimodal.extend(draw_batch([-1.0, 0.0, 0.0], 50.0, 3000, 1402));
    let fit_stats = asm::update(&mut mix, &mut stats, &bimodal, &cfg, &mut sink).unwrap();

    assert!(fit_stats.capacity_exceeded);
    assert!(!fit_stats.error);
    assert_eq!(mix.num_components(), K_MAX);
    assert!(mix.is_valid());
}

#[test]
fn sufficient_statistics_survive_a_binary_round_trip() {
    let mu = lobe::normalize([0.5, 0.5, 0.7]);
    let samples = draw_batch(mu, 18.0, 5000, 1500);
    let cfg = AsmConfiguration::default();
    let mut sink = NullTracingSink;
    let (_mix, stats, _) = asm::fit(3, &samples, &cfg, &mut sink).unwrap();

    let mut buf = Vec::new();
    stats.sufficient.serialize(&mut buf).unwrap();
    let restored = SufficientStatistics::deserialize(&mut buf.as_slice()).unwrap();

    assert_eq!(restored.num_components(), stats.sufficient.num_components());
    for k in 0..restored.num_components() {
        assert_eq!(restored.sum_gamma(k), stats.sufficient.sum_gamma(k));
    }
}

#[test]
fn json_configuration_round_trips_through_a_temp_file() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("asm_guide_scenario_cfg_{}.json", std::process::id()));
    let mut cfg = AsmConfiguration::default();
    cfg.splitting_threshold = 0.42;
    config::save_asm_configuration(&path, &cfg).unwrap();
    let loaded = config::load_asm_configuration(&path).unwrap();
    assert_eq!(loaded.splitting_threshold, 0.42);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn independent_regions_fit_in_parallel_without_cross_talk() {
    let samples_a = draw_batch([0.0, 0.0, 1.0], 25.0, 3000, 1600);
    let samples_b = draw_batch([0.0, 1.0, 0.0], 25.0, 3000, 1601);
    let samples_c = draw_batch([1.0, 0.0, 0.0], 25.0, 3000, 1602);
    let jobs = vec![
        FitJob { initial_components: 1, samples: &samples_a },
        FitJob { initial_components: 1, samples: &samples_b },
        FitJob { initial_components: 1, samples: &samples_c },
    ];
    let cfg = AsmConfiguration::default();
    let results = fit_regions_parallel(&jobs, &cfg);

    assert_eq!(results.len(), 3);
    let expected = [[0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]];
    for (result, mu) in results.iter().zip(expected.iter()) {
        let (mix, ..) = result.as_ref().unwrap();
        assert!(lobe::dot(mix.lobe(0).mu, *mu) > 0.99);
    }
}
