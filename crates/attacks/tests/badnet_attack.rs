use attacks::{BadNet, BadNetConfig, MarkConfig, TrainMode, Watermark};
use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use models::{MlpNet, MlpNetConfig};
use training::TrainConfig;
use trojan_dataset::{generate, SyntheticConfig};

type B = Autodiff<NdArray<f32>>;

fn run(mode: TrainMode) -> anyhow::Result<attacks::AttackReport> {
    let shape = [1, 6, 6];
    let splits = generate(&SyntheticConfig {
        data_shape: shape,
        num_classes: 3,
        train_per_class: 32,
        valid_per_class: 12,
        seed: 2,
        ..Default::default()
    })?;
    let device = Default::default();
    let mark = Watermark::new(
        shape,
        &MarkConfig {
            mark_height: 2,
            mark_width: 2,
            height_offset: 4,
            width_offset: 4,
            ..Default::default()
        },
        &device,
    )?;
    let mut badnet = BadNet::new(
        BadNetConfig {
            target_class: 1,
            poison_percent: 0.1,
            train_mode: mode,
            seed: Some(9),
        },
        mark,
    )?;
    let model = MlpNet::<B>::new(
        MlpNetConfig {
            data_shape: shape,
            num_classes: 3,
            hidden: 32,
        },
        &device,
    );
    let cfg = TrainConfig {
        epochs: 25,
        lr: 1e-2,
        batch_size: 16,
        seed: Some(4),
        validate_interval: 0,
    };
    let (_model, report) = badnet.attack(model, &splits, &cfg, &device)?;
    Ok(report)
}

#[test]
fn batch_poisoning_implants_the_trigger() -> anyhow::Result<()> {
    let report = run(TrainMode::Batch)?;
    assert_eq!(report.clean.count, 36);
    // Target-class samples are excluded from the triggered set.
    assert_eq!(report.triggered.count, 24);
    assert!(report.clean_acc() > 60.0, "clean acc {}", report.clean_acc());
    assert!(
        report.attack_success_rate() > 60.0,
        "attack success {}",
        report.attack_success_rate()
    );
    Ok(())
}

#[test]
fn dataset_poisoning_implants_the_trigger() -> anyhow::Result<()> {
    let report = run(TrainMode::Dataset)?;
    assert!(report.clean_acc() > 60.0, "clean acc {}", report.clean_acc());
    assert!(
        report.attack_success_rate() > 60.0,
        "attack success {}",
        report.attack_success_rate()
    );
    Ok(())
}
