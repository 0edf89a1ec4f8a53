use attacks::{BadNet, BadNetConfig, MarkConfig, Watermark};
use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use defenses::{
    DefenseContext, InputFiltering, SpectralConfig, SpectralSignature, Strip, StripConfig,
    Threshold, TrainingFiltering,
};
use models::{MlpNet, MlpNetConfig};
use training::{train_classifier, Identity, TrainConfig};
use trojan_dataset::{generate, DatasetSplits, SyntheticConfig};

type B = Autodiff<NdArray<f32>>;

const SHAPE: [usize; 3] = [1, 6, 6];

fn setup() -> anyhow::Result<(MlpNet<B>, DatasetSplits, BadNet<B>)> {
    let splits = generate(&SyntheticConfig {
        data_shape: SHAPE,
        num_classes: 3,
        train_per_class: 24,
        valid_per_class: 10,
        seed: 3,
        ..Default::default()
    })?;
    let device = Default::default();
    let model = MlpNet::<B>::new(
        MlpNetConfig {
            data_shape: SHAPE,
            num_classes: 3,
            hidden: 16,
        },
        &device,
    );
    let cfg = TrainConfig {
        epochs: 20,
        lr: 1e-2,
        batch_size: 16,
        seed: Some(2),
        validate_interval: 0,
    };
    let model = train_classifier(model, &splits, &cfg, &mut Identity, &device)?;
    let mark = Watermark::new(
        SHAPE,
        &MarkConfig {
            mark_height: 2,
            mark_width: 2,
            height_offset: 4,
            width_offset: 4,
            ..Default::default()
        },
        &device,
    )?;
    let attack = BadNet::new(
        BadNetConfig {
            target_class: 0,
            poison_percent: 0.1,
            seed: Some(6),
            ..Default::default()
        },
        mark,
    )?;
    Ok((model, splits, attack))
}

#[test]
fn strip_detect_labels_half_of_the_inputs() -> anyhow::Result<()> {
    let (model, splits, mut attack) = setup()?;
    let pool = splits.valid.clone();
    let mut ctx = DefenseContext::<B, _, _>::new(&model, &splits, &mut attack, Default::default());
    let strip = Strip::new(
        StripConfig {
            fusion_num: 8,
            seed: Some(4),
            ..Default::default()
        },
        pool,
    )?;
    let mut defense = InputFiltering::new(strip, 12)?;
    let report = defense.detect(&mut ctx)?;

    let n = report.clean_scores.len();
    assert!(n > 0 && n <= 12);
    assert_eq!(report.poison_scores.len(), n);
    assert!(report.clean_scores.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(report.y_pred.len(), 2 * n);
    assert_eq!(report.y_pred.iter().filter(|p| **p).count(), n);
    let m = report.metrics;
    assert_eq!(m.true_positive + m.false_positive + m.true_negative + m.false_negative, 2 * n);
    assert_eq!(report.defense, "strip");
    Ok(())
}

#[test]
fn threshold_policy_can_be_swapped_in() -> anyhow::Result<()> {
    let (model, splits, mut attack) = setup()?;
    let pool = splits.valid.clone();
    let mut ctx = DefenseContext::<B, _, _>::new(&model, &splits, &mut attack, Default::default());
    let strip = Strip::new(
        StripConfig {
            fusion_num: 2,
            seed: Some(1),
            ..Default::default()
        },
        pool,
    )?;
    // Scores are negated entropies, never above zero.
    let mut defense = InputFiltering::new(strip, 6)?.with_policy(Threshold(1.0));
    let report = defense.detect(&mut ctx)?;
    assert!(report.y_pred.iter().all(|p| !p));
    Ok(())
}

#[test]
fn spectral_scores_the_sampled_mix() -> anyhow::Result<()> {
    let (model, splits, mut attack) = setup()?;
    let mut ctx = DefenseContext::<B, _, _>::new(&model, &splits, &mut attack, Default::default());
    let filter = SpectralSignature::new(SpectralConfig {
        seed: Some(8),
        ..Default::default()
    })?;
    let mut defense = TrainingFiltering::new(&mut ctx, filter, Some(40), Some(3))?;
    assert_eq!(defense.poison_set().len(), 4);
    assert_eq!(defense.clean_set().len(), 36);
    assert!(defense.poison_set().labels().iter().all(|l| *l == 0));

    let report = defense.detect(&mut ctx)?;
    assert_eq!(report.y_pred.len(), 40);
    assert_eq!(report.clean_scores.len(), 36);
    assert_eq!(report.poison_scores.len(), 4);
    assert!(report.y_pred.iter().any(|p| *p));
    Ok(())
}

#[test]
fn spectral_full_mix_uses_whole_training_set() -> anyhow::Result<()> {
    let (model, splits, mut attack) = setup()?;
    let train_len = splits.train.len();
    let mut ctx = DefenseContext::<B, _, _>::new(&model, &splits, &mut attack, Default::default());
    let filter = SpectralSignature::new(SpectralConfig::default())?;
    let defense = TrainingFiltering::new(&mut ctx, filter, None, None)?;
    assert_eq!(defense.clean_set().len(), train_len);
    // Batch mode poisons a copy of every training sample.
    assert_eq!(defense.poison_set().len(), train_len);
    Ok(())
}
