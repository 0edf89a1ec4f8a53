use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn_ndarray::NdArray;
use models::{MlpNet, MlpNetConfig};
use trojan_dataset::{generate, SyntheticConfig};
use training::{evaluate, train_classifier, Identity, TrainConfig};

type B = Autodiff<NdArray<f32>>;

#[test]
fn mlp_learns_synthetic_classes() -> anyhow::Result<()> {
    let splits = generate(&SyntheticConfig {
        data_shape: [1, 4, 4],
        num_classes: 3,
        train_per_class: 32,
        valid_per_class: 8,
        seed: 11,
        ..Default::default()
    })?;
    let device = Default::default();
    let model = MlpNet::<B>::new(
        MlpNetConfig {
            data_shape: [1, 4, 4],
            num_classes: 3,
            hidden: 32,
        },
        &device,
    );
    let cfg = TrainConfig {
        epochs: 30,
        lr: 1e-2,
        batch_size: 16,
        seed: Some(5),
        validate_interval: 0,
    };
    let model = train_classifier(model, &splits, &cfg, &mut Identity, &device)?;
    let res = evaluate(&model.valid(), &splits.valid, 32, &mut Identity, &device)?;
    assert_eq!(res.count, 24);
    // Chance is 33%.
    assert!(res.acc > 60.0, "valid acc {}", res.acc);
    Ok(())
}

#[test]
fn empty_training_split_is_an_error() {
    let splits = trojan_dataset::DatasetSplits {
        train: trojan_dataset::ImageSet::new([1, 2, 2]),
        valid: trojan_dataset::ImageSet::new([1, 2, 2]),
        num_classes: 2,
    };
    let device = Default::default();
    let model = MlpNet::<B>::new(
        MlpNetConfig {
            data_shape: [1, 2, 2],
            num_classes: 2,
            hidden: 4,
        },
        &device,
    );
    assert!(train_classifier(model, &splits, &TrainConfig::default(), &mut Identity, &device).is_err());
}
