use attacks::{BadNet, BadNetConfig, MarkConfig, Watermark};
use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use defenses::{
    DefenseContext, EpochStats, InspectionConfig, InspectionHooks, MarkArchive, ModelInspection,
    NeuralCleanse,
};
use models::{ImageModel, MlpNet, MlpNetConfig};
use trojan_dataset::{generate, DatasetSplits, SyntheticConfig};

type B = Autodiff<NdArray<f32>>;

const SHAPE: [usize; 3] = [1, 4, 4];

#[derive(Default)]
struct Recorder {
    labels: Vec<i64>,
    epochs: Vec<EpochStats>,
    stop_after: Option<usize>,
}

impl InspectionHooks for Recorder {
    fn before_loop_fn(&mut self, label: i64) {
        self.labels.push(label);
    }

    fn after_epoch(&mut self, stats: &EpochStats) {
        self.epochs.push(*stats);
    }

    fn check_early_stop(&mut self, stats: &EpochStats) -> bool {
        self.stop_after.is_some_and(|n| stats.epoch >= n)
    }
}

fn splits(num_classes: usize) -> DatasetSplits {
    generate(&SyntheticConfig {
        data_shape: SHAPE,
        num_classes,
        train_per_class: 12,
        valid_per_class: 4,
        seed: 5,
        ..Default::default()
    })
    .unwrap()
}

fn model(num_classes: usize) -> MlpNet<B> {
    MlpNet::new(
        MlpNetConfig {
            data_shape: SHAPE,
            num_classes,
            hidden: 8,
        },
        &Default::default(),
    )
}

fn badnet() -> BadNet<B> {
    let mark = Watermark::new(
        SHAPE,
        &MarkConfig {
            mark_height: 2,
            mark_width: 2,
            height_offset: 2,
            width_offset: 2,
            ..Default::default()
        },
        &Default::default(),
    )
    .unwrap();
    BadNet::new(
        BadNetConfig {
            target_class: 1,
            seed: Some(0),
            ..Default::default()
        },
        mark,
    )
    .unwrap()
}

fn config(cache_dir: &std::path::Path, remask_epoch: usize) -> InspectionConfig {
    InspectionConfig {
        remask_epoch,
        batch_size: 16,
        cache_dir: cache_dir.to_path_buf(),
        seed: Some(1),
        ..Default::default()
    }
}

fn mask_l1(mask: &[f32]) -> f64 {
    mask.iter().map(|v| f64::from(v.abs())).sum()
}

#[test]
fn best_mask_never_exceeds_first_epoch_mask() {
    let dir = tempfile::tempdir().unwrap();
    let data = splits(2);
    let model = model(2);
    let mut first_l1 = None;
    for epochs in [1, 3, 6] {
        let mut inspection =
            ModelInspection::with_hooks(config(dir.path(), epochs), Recorder::default()).unwrap();
        let (candidate, history) = inspection
            .optimize_mark(&model, 0, &data.train, &data.valid, &Default::default())
            .unwrap();
        assert_eq!(history.len(), epochs);
        assert_eq!(candidate.shape, [2, 4, 4]);
        assert_eq!(candidate.mark.len(), 32);
        assert!(candidate.mark.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(inspection.hooks().epochs.len(), epochs);

        let l1 = mask_l1(candidate.mask());
        assert!((candidate.norm - l1).abs() < 1e-4);
        let first = *first_l1.get_or_insert(l1);
        assert!(l1 <= first + 1e-4, "{epochs} epochs: {l1} > {first}");
    }
}

#[test]
fn early_stop_ends_the_class_loop() {
    let dir = tempfile::tempdir().unwrap();
    let data = splits(2);
    let hooks = Recorder {
        stop_after: Some(2),
        ..Default::default()
    };
    let mut inspection = ModelInspection::with_hooks(config(dir.path(), 10), hooks).unwrap();
    let (_, history) = inspection
        .optimize_mark(&model(2), 1, &data.train, &data.valid, &Default::default())
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(inspection.hooks().labels, vec![1]);
}

#[test]
fn sweep_yields_one_candidate_per_class_and_archives_them() {
    let dir = tempfile::tempdir().unwrap();
    let data = splits(3);
    let model = model(3);
    let mut attack = badnet();
    let mut ctx = DefenseContext::<B, _, _>::new(&model, &data, &mut attack, Default::default())
        .with_batch_size(16);
    assert_eq!(ctx.get_filename(), "badnet_badnet_tar1_alpha1.00_mark(2,2)");
    let mut inspection = ModelInspection::with_hooks(config(dir.path(), 2), NeuralCleanse::default())
        .unwrap();

    let report = inspection.detect(&mut ctx).unwrap();
    assert_eq!(report.defense, "neural_cleanse");
    assert_eq!(report.mask_norms.len(), model.num_classes());
    assert_eq!(report.losses.len(), 3);
    assert_eq!(report.norm_mad.len(), 3);
    assert!((0..3).contains(&report.suspect_class));
    assert!(report.jaccard.is_some_and(|j| (0.0..=1.0).contains(&j)));
    assert!(report
        .archive
        .ends_with("badnet_neural_cleanse_tar1.safetensors"));

    let archive = MarkArchive::load(&report.archive).unwrap();
    assert_eq!(archive.len(), 3);
    assert_eq!(archive.mark_shape, [2, 4, 4]);
    assert_eq!(archive.target_class, 1);
    for (class, norm) in report.mask_norms.iter().enumerate() {
        let mark = archive.mark(class).unwrap();
        assert!((norm - mask_l1(&mark[16..])).abs() < 1e-4);
    }

    let mark = inspection
        .load::<B>(&report.archive, 1, &Default::default())
        .unwrap();
    assert_eq!(mark.mark().dims(), [2, 4, 4]);
    assert_eq!(mark.mark_size(), (4, 4));
    assert!(inspection
        .load::<B>(&report.archive, 7, &Default::default())
        .is_err());
}
