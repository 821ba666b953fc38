//! Train IU and CU heads on synthetic scenes with correlated agent motion.
//!
//! Every scene has a shared drift, so agents in the same scene err together;
//! the collaborative head can model that, the individual head cannot.
//!
//! Usage:
//!   cargo run --example synthetic_scenes --release
//!
//! With logging:
//!   RUST_LOG=collab_uncertainty_rs=debug cargo run --example synthetic_scenes

use candle_core::{Device, Tensor, D};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use collab_uncertainty_rs::prelude::*;

const SCENES: usize = 16;
const STEPS: usize = 150;

/// Ragged agents of one synthetic batch.
struct Synthetic {
    embeddings: Tensor,
    scene_ids: Vec<usize>,
    futures: Tensor,
}

fn synthesize(config: &ForecastConfig, projection: &[f32], rng: &mut ChaCha8Rng, device: &Device) -> anyhow::Result<Synthetic> {
    let (d, t) = (config.embed_dim, config.horizon);
    let mut embeddings = Vec::new();
    let mut futures = Vec::new();
    let mut scene_ids = Vec::new();

    for scene in 0..SCENES {
        let drift: (f32, f32) = (rng.gen_range(-0.3..0.3), rng.gen_range(-0.3..0.3));
        for _ in 0..rng.gen_range(1..=6) {
            let v: (f32, f32) = (rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0));
            let features = [v.0, v.1, 1.0, rng.gen_range(-0.1..0.1)];
            for row in 0..d {
                let x: f32 = features.iter().enumerate().map(|(j, f)| f * projection[row * 4 + j]).sum();
                embeddings.push(x);
            }
            for step in 1..=t {
                let s = step as f32;
                futures.push(s * (v.0 + drift.0) + rng.gen_range(-0.05..0.05));
                futures.push(s * (v.1 + drift.1) + rng.gen_range(-0.05..0.05));
            }
            scene_ids.push(scene);
        }
    }

    let agents = scene_ids.len();
    Ok(Synthetic {
        embeddings: Tensor::from_vec(embeddings, (agents, d), device)?,
        scene_ids,
        futures: Tensor::from_vec(futures, (agents, t, 2), device)?,
    })
}

/// Fraction of observed coordinates inside the point-estimate mode's interval.
fn coverage(model: &ForecastModel, batch: &SceneBatch, quantile: f64) -> anyhow::Result<f32> {
    let output = model.forward(&batch.embeddings, &batch.agent_mask)?;
    let calibration = model.calibrate(&output, &batch.agent_mask, quantile)?;
    let best = collab_uncertainty_rs::WinnerSelection::from_scores(&output.confidences)?;
    let width = collab_uncertainty_rs::trajectory::select_mode(&calibration.confidence_region.half_width, &best.one_hot)?;

    let future = &batch.ground_truth.as_ref().ok_or_else(|| anyhow::anyhow!("no ground truth"))?.future;
    let inside = (calibration.point_estimate - future)?.abs()?.le(&width)?.to_dtype(candle_core::DType::F32)?;
    let mask = batch.agent_mask.unsqueeze(2)?.unsqueeze(3)?;
    let hits = inside.broadcast_mul(&mask)?.sum_all()?.to_scalar::<f32>()?;
    let total = mask.sum_all()?.to_scalar::<f32>()? * (inside.dim(2)? * inside.dim(D::Minus1)?) as f32;
    Ok(hits / total)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    #[cfg(feature = "cuda")]
    let device = Device::new_cuda(0)?;
    #[cfg(not(feature = "cuda"))]
    let device = Device::Cpu;

    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let base = ForecastConfig::test().with_num_modes(3).with_horizon(12);
    let projection: Vec<f32> = (0..base.embed_dim * 4).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let train = synthesize(&base, &projection, &mut rng, &device)?;
    let held_out = synthesize(&base, &projection, &mut rng, &device)?;
    let pack = |s: &Synthetic| SceneBatch::pack(&s.embeddings, &s.scene_ids, None, Some(&s.futures), None);
    let train = pack(&train)?;
    let held_out = pack(&held_out)?;

    println!("Scenes: {}, padded agents: {}", train.num_scenes(), train.max_agents());

    for mode in [HeadMode::Individual, HeadMode::Collaborative] {
        let config = base.clone().with_head_mode(mode);
        let model = ForecastModel::new(&config, &device)?;
        let mut trainer = ForecastTrainer::new(model, &TrainerConfig::default().with_learning_rate(3e-3))?;

        let mut last = None;
        for step in 0..STEPS {
            let metrics = trainer.train_step(&train)?;
            if step % 25 == 0 {
                tracing::info!(?mode, step, loss = metrics.loss.total, "training");
            }
            last = Some(metrics);
        }

        let model = trainer.into_model();
        let output = model.forward(&held_out.embeddings, &held_out.agent_mask)?;
        let ground_truth = held_out
            .ground_truth
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("held-out batch without ground truth"))?;
        let held_out_loss = model.loss(&output, ground_truth, &held_out.agent_mask)?;

        println!("{mode:?}:");
        if let Some(metrics) = last {
            println!("  final train loss: {:.4}", metrics.loss.total);
        }
        println!("  held-out loss:    {:.4}", held_out_loss.breakdown.total);
        println!("  90% coverage:     {:.3}", coverage(&model, &held_out, 0.9)?);
    }

    Ok(())
}
