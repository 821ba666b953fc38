//! Invariants of the heads and the loss that must hold for any input.

use candle_core::{DType, Device, Tensor, D};
use collab_uncertainty_rs::prelude::*;
use collab_uncertainty_rs::{CouplingStructure, WinnerSelection};

fn to_flat(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

fn close(a: f32, b: f32, tol: f32) -> bool {
    (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
}

#[test]
fn scales_never_fall_below_floor() {
    let config = ForecastConfig::test().with_scale_floor(0.05);
    let device = Device::Cpu;
    let model = ForecastModel::new(&config, &device).unwrap();

    for magnitude in [1e-3f64, 1.0, 1e3, 1e6] {
        let emb = (Tensor::randn(0.0f32, 1.0, (3, 4, config.embed_dim), &device).unwrap() * magnitude).unwrap();
        let mask = Tensor::ones((3, 4), DType::F32, &device).unwrap();
        let out = model.forward(&emb, &mask).unwrap();
        let min = out
            .uncertainty
            .scales
            .flatten_all()
            .unwrap()
            .min(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(min >= 0.05, "scale {min} below floor at magnitude {magnitude}");
    }
}

#[test]
fn confidences_form_a_distribution() {
    let config = ForecastConfig::test().with_num_modes(6);
    let device = Device::Cpu;
    let model = ForecastModel::new(&config, &device).unwrap();
    let emb = (Tensor::randn(0.0f32, 1.0, (2, 5, config.embed_dim), &device).unwrap() * 50.0).unwrap();
    let mask = Tensor::ones((2, 5), DType::F32, &device).unwrap();

    let out = model.forward(&emb, &mask).unwrap();
    assert!(to_flat(&out.confidences).iter().all(|p| (0.0..=1.0).contains(p)));
    for s in to_flat(&out.confidences.sum(D::Minus1).unwrap()) {
        assert!((s - 1.0).abs() < 1e-5, "confidences sum to {s}");
    }
}

#[test]
fn winner_selection_is_deterministic_with_low_index_ties() {
    let device = Device::Cpu;
    let costs = Tensor::new(
        &[
            [[2.0f32, 2.0, 2.0], [5.0, 1.0, 1.0]],
            [[0.0, 3.0, 0.0], [4.0, 4.0, 0.5]],
        ],
        &device,
    )
    .unwrap();
    let first: Vec<Vec<u32>> = WinnerSelection::from_costs(&costs).unwrap().indices.to_vec2().unwrap();
    assert_eq!(first, vec![vec![0, 1], vec![0, 2]]);
    for _ in 0..10 {
        let again: Vec<Vec<u32>> = WinnerSelection::from_costs(&costs).unwrap().indices.to_vec2().unwrap();
        assert_eq!(again, first);
    }
}

#[test]
fn coupling_is_symmetric_with_unit_diagonal_for_extreme_outputs() {
    let config = ForecastConfig::test();
    let device = Device::Cpu;
    let model = ForecastModel::new(&config, &device).unwrap();
    let emb = (Tensor::randn(0.0f32, 1.0, (2, 4, config.embed_dim), &device).unwrap() * 1e8).unwrap();
    let mask = Tensor::new(&[[1.0f32, 1.0, 1.0, 0.0], [1.0, 1.0, 0.0, 0.0]], &device).unwrap();

    let out = model.forward(&emb, &mask).unwrap();
    let (factors, gates) = out.uncertainty.coupling.as_ref().unwrap().fold_modes().unwrap();
    let k = config.num_modes;
    let valid = mask
        .unsqueeze(1)
        .unwrap()
        .unsqueeze(3)
        .unwrap()
        .broadcast_as((2, k, 4, config.horizon))
        .unwrap()
        .reshape((2 * k, 4, config.horizon))
        .unwrap();
    let structure = CouplingStructure::build(&factors, &gates, &valid, config.coupling_ridge).unwrap();
    let p = structure.dense().unwrap();

    let asym = (&p - p.transpose(2, 3).unwrap()).unwrap().abs().unwrap();
    assert!(to_flat(&asym).iter().all(|v| *v == 0.0));

    let eye = Tensor::eye(4, DType::F32, &device).unwrap();
    let diag = p.broadcast_mul(&eye).unwrap().sum(3).unwrap();
    assert!(to_flat(&diag).iter().all(|d| (d - 1.0).abs() < 1e-5));

    assert!(to_flat(&structure.lambda).iter().all(|l| *l > 0.0));
    assert!(to_flat(&structure.log_det().unwrap()).iter().all(|v| v.is_finite() && *v <= 1e-5));
}

#[test]
fn single_agent_scene_collaborative_equals_individual() {
    let config = ForecastConfig::test();
    let device = Device::Cpu;
    let model = ForecastModel::new(&config, &device).unwrap();

    // one real agent next to padding
    let emb = Tensor::randn(0.0f32, 1.0, (1, 3, config.embed_dim), &device).unwrap();
    let mask = Tensor::new(&[[0.0f32, 1.0, 0.0]], &device).unwrap();
    let future = Tensor::randn(0.0f32, 2.0, (1, 3, config.horizon, 2), &device).unwrap();
    let gt = GroundTruth::new(future);

    let cu = model.forward(&emb, &mask).unwrap();
    let iu = ForecastOutput {
        uncertainty: cu.uncertainty.as_individual(),
        ..cu.clone()
    };
    let a = model.loss(&cu, &gt, &mask).unwrap().breakdown;
    let b = model.loss(&iu, &gt, &mask).unwrap().breakdown;
    assert!(close(a.total, b.total, 1e-5), "CU {} vs IU {}", a.total, b.total);
    assert!(close(a.regression, b.regression, 1e-5));
}

#[test]
fn appending_masked_agents_with_nan_futures_leaves_loss_unchanged() {
    let config = ForecastConfig::test();
    let device = Device::Cpu;
    let model = ForecastModel::new(&config, &device).unwrap();
    let t = config.horizon;

    let emb = Tensor::randn(0.0f32, 1.0, (1, 3, config.embed_dim), &device).unwrap();
    let future = Tensor::randn(0.0f32, 1.0, (1, 3, t, 2), &device).unwrap();
    let mask = Tensor::ones((1, 3), DType::F32, &device).unwrap();

    let extra_emb = (Tensor::randn(0.0f32, 1.0, (1, 2, config.embed_dim), &device).unwrap() * 100.0).unwrap();
    // padding may carry anything, including NaN
    let extra_future = Tensor::full(f32::NAN, (1, 2, t, 2), &device).unwrap();
    let padded_emb = Tensor::cat(&[&emb, &extra_emb], 1).unwrap();
    let padded_future = Tensor::cat(&[&future, &extra_future], 1).unwrap();
    let padded_mask = Tensor::new(&[[1.0f32, 1.0, 1.0, 0.0, 0.0]], &device).unwrap();

    let base_out = model.forward(&emb, &mask).unwrap();
    let base = model.loss(&base_out, &GroundTruth::new(future), &mask).unwrap();
    let padded_out = model.forward(&padded_emb, &padded_mask).unwrap();
    let padded = model
        .loss(&padded_out, &GroundTruth::new(padded_future), &padded_mask)
        .unwrap();

    assert!(close(base.breakdown.total, padded.breakdown.total, 1e-5));
    assert!(close(base.breakdown.coupling, padded.breakdown.coupling, 1e-5));
    assert_eq!(base.breakdown.valid_agents, padded.breakdown.valid_agents);
}

#[test]
fn appending_masked_agents_leaves_log_det_unchanged() {
    let device = Device::Cpu;
    let (t, r) = (3, 2);
    let factors = Tensor::randn(0.0f32, 1.0, (2, 3, r), &device).unwrap();
    let gates = (Tensor::rand(0.0f32, 0.9, (2, 3, t), &device).unwrap()).contiguous().unwrap();
    let valid = Tensor::ones((2, 3, t), DType::F32, &device).unwrap();
    let base = CouplingStructure::build(&factors, &gates, &valid, 0.05).unwrap();

    let factors = Tensor::cat(&[&factors, &Tensor::randn(0.0f32, 1e3, (2, 1, r), &device).unwrap()], 1).unwrap();
    let gates = Tensor::cat(&[&gates, &Tensor::full(0.9f32, (2, 1, t), &device).unwrap()], 1).unwrap();
    let valid = Tensor::cat(&[&valid, &Tensor::zeros((2, 1, t), DType::F32, &device).unwrap()], 1).unwrap();
    let padded = CouplingStructure::build(&factors, &gates, &valid, 0.05).unwrap();

    for (a, b) in to_flat(&base.log_det().unwrap()).iter().zip(to_flat(&padded.log_det().unwrap())) {
        assert!(close(*a, b, 1e-5), "{a} vs {b}");
    }
    for (a, b) in to_flat(&base.gamma).iter().zip(to_flat(&padded.gamma)) {
        assert!(close(*a, b, 1e-6));
    }
}

#[test]
fn scene_batches_do_not_interact() {
    let config = ForecastConfig::test();
    let device = Device::Cpu;
    let model = ForecastModel::new(&config, &device).unwrap();
    let t = config.horizon;

    let emb = Tensor::randn(0.0f32, 1.0, (2, 3, config.embed_dim), &device).unwrap();
    let future = Tensor::randn(0.0f32, 1.0, (2, 3, t, 2), &device).unwrap();
    let mask = Tensor::ones((2, 3), DType::F32, &device).unwrap();

    let out = model.forward(&emb, &mask).unwrap();
    let both = model.loss(&out, &GroundTruth::new(future.clone()), &mask).unwrap();

    let mut per_scene = Vec::new();
    for s in 0..2 {
        let e = emb.narrow(0, s, 1).unwrap();
        let f = future.narrow(0, s, 1).unwrap();
        let m = mask.narrow(0, s, 1).unwrap();
        let o = model.forward(&e, &m).unwrap();
        per_scene.push(model.loss(&o, &GroundTruth::new(f), &m).unwrap().breakdown.total);
    }
    let mean = (per_scene[0] + per_scene[1]) / 2.0;
    assert!(close(both.breakdown.total, mean, 1e-5), "{} vs {mean}", both.breakdown.total);
}
