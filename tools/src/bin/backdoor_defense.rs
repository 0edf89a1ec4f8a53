use anyhow::Context;
use attacks::{BackdoorAttack, TrojanNn};
use backdoor_lab_tools::experiment::{
    append_jsonl, artifact_path, build_badnet, ensure_parent, model_name, new_mlp, new_net,
    restore_attack_artifact, save_attack_artifact, Device, TrainOverrides,
};
use backdoor_lab_tools::{init_tracing, ExperimentConfig};
use burn::module::AutodiffModule;
use clap::Parser;
use cli_support::{AttackArgs, AttackKind, DataArgs, DefenseArgs, DefenseKind, MarkArgs};
use defenses::{
    DefenseContext, InputFiltering, ModelInspection, NeuralCleanse, SpectralSignature, Strip,
    TrainingFiltering,
};
use models::{load_checkpoint, save_checkpoint, ImageModel};
use std::path::{Path, PathBuf};
use training::util::ModelKind;
use training::{train_classifier, Identity, ADBackend};
use trojan_dataset::{generate, DatasetSplits};

#[derive(Parser, Debug)]
#[command(
    name = "backdoor_defense",
    about = "Run a backdoor defense against an attacked (or clean) classifier"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = ModelKind::Net)]
    model: ModelKind,
    #[command(flatten)]
    data: DataArgs,
    #[command(flatten)]
    mark: MarkArgs,
    #[command(flatten)]
    attack: AttackArgs,
    #[command(flatten)]
    defense: DefenseArgs,
    #[command(flatten)]
    train: TrainOverrides,
    /// Checkpoint of the model under test; trained and saved there when missing.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Defend a clean model trained without poisoning.
    #[arg(long, default_value_t = false)]
    original: bool,
}

fn defend<M, A>(
    model: &M,
    splits: &DatasetSplits,
    attack: &mut A,
    cli: &Cli,
    cfg: &ExperimentConfig,
) -> anyhow::Result<serde_json::Value>
where
    M: ImageModel<ADBackend>,
    A: BackdoorAttack<ADBackend>,
{
    let seed = Some(cli.data.seed);
    let batch_size = cli.train.batch_size.unwrap_or(cfg.batch_size).max(1);
    let mut ctx = DefenseContext::<ADBackend, M, A>::new(model, splits, attack, Device::default())
        .with_batch_size(batch_size)
        .with_original(cli.original);
    let experiment = ctx.get_filename();
    let report = match cli.defense.defense {
        DefenseKind::Strip => {
            let strip = Strip::new(cli.defense.strip_config(seed), splits.valid.clone())?;
            let mut defense =
                InputFiltering::new(strip, cli.defense.defense_input_num.unwrap_or(100))?;
            serde_json::to_value(defense.detect(&mut ctx)?)?
        }
        DefenseKind::Spectral => {
            let filter = SpectralSignature::new(cli.defense.spectral_config(seed))?;
            let mut defense =
                TrainingFiltering::new(&mut ctx, filter, cli.defense.defense_input_num, seed)?;
            serde_json::to_value(defense.detect(&mut ctx)?)?
        }
        DefenseKind::NeuralCleanse => {
            let inspection_cfg =
                cli.defense
                    .inspection_config(batch_size, cfg.cache_dir.clone(), seed);
            let hooks = NeuralCleanse::new(cli.defense.neural_cleanse_config());
            let mut defense = ModelInspection::with_hooks(inspection_cfg, hooks)?;
            serde_json::to_value(defense.detect(&mut ctx)?)?
        }
    };
    Ok(serde_json::json!({ "experiment": experiment, "detection": report }))
}

/// Load the model under test, or train it (poisoned unless `--original`).
fn prepare_model<M, A>(
    fresh: M,
    attack: &mut A,
    train_attack: impl FnOnce(M, &mut A) -> anyhow::Result<M>,
    ckpt: &Path,
    cli: &Cli,
    cfg: &ExperimentConfig,
    splits: &DatasetSplits,
) -> anyhow::Result<M>
where
    M: ImageModel<ADBackend> + AutodiffModule<ADBackend>,
    A: BackdoorAttack<ADBackend>,
{
    let device = Device::default();
    // The recorder stores weights under the `.bin` extension.
    if ckpt.with_extension("bin").exists() {
        tracing::info!(path = %ckpt.display(), "loading model under test");
        let model = load_checkpoint(fresh, ckpt, &device)
            .with_context(|| format!("loading checkpoint {}", ckpt.display()))?;
        if !restore_attack_artifact(attack, ckpt)? && !cli.original {
            tracing::warn!(
                path = %artifact_path(ckpt).display(),
                "no saved attack mark; defending against the configured mark"
            );
        }
        return Ok(model);
    }
    let model = if cli.original {
        let train_cfg = cli.train.train_config(cfg, cli.data.seed);
        train_classifier(fresh, splits, &train_cfg, &mut Identity, &device)?
    } else {
        train_attack(fresh, attack)?
    };
    ensure_parent(ckpt)?;
    save_checkpoint(model.valid(), ckpt)?;
    save_attack_artifact(attack, ckpt)?;
    tracing::info!(path = %ckpt.display(), "model under test saved");
    Ok(model)
}

fn run<M>(fresh: M, cli: &Cli, cfg: &ExperimentConfig, splits: &DatasetSplits) -> anyhow::Result<()>
where
    M: ImageModel<ADBackend> + AutodiffModule<ADBackend>,
{
    let device = Device::default();
    let train_cfg = cli.train.train_config(cfg, cli.data.seed);
    let badnet = build_badnet(&cli.data, &cli.mark, &cli.attack, &device)?;
    let suffix = if cli.original { "_original" } else { "" };
    let (stem, report) = match cli.attack.attack {
        AttackKind::Badnet => {
            let mut attack = badnet;
            let stem = attack.get_filename();
            let ckpt = cli.checkpoint.clone().unwrap_or_else(|| {
                cfg.checkpoint_path(model_name(cli.model), &format!("{stem}{suffix}"))
            });
            let model = prepare_model(
                fresh,
                &mut attack,
                |m, a| Ok(a.attack(m, splits, &train_cfg, &device)?.0),
                &ckpt,
                cli,
                cfg,
                splits,
            )?;
            (stem, defend(&model, splits, &mut attack, cli, cfg)?)
        }
        AttackKind::Trojannn => {
            let mut attack = TrojanNn::new(cli.attack.trojannn_config(), badnet)?;
            let stem = attack.get_filename();
            let ckpt = cli.checkpoint.clone().unwrap_or_else(|| {
                cfg.checkpoint_path(model_name(cli.model), &format!("{stem}{suffix}"))
            });
            let model = prepare_model(
                fresh,
                &mut attack,
                |m, a| Ok(a.attack(m, splits, &train_cfg, &device)?.0),
                &ckpt,
                cli,
                cfg,
                splits,
            )?;
            (stem, defend(&model, splits, &mut attack, cli, cfg)?)
        }
    };

    append_jsonl(
        &cfg.metrics_path,
        &serde_json::json!({
            "kind": "defense",
            "model": model_name(cli.model),
            "stem": stem,
            "original": cli.original,
            "report": report,
        }),
    )?;
    println!("Appended report to {}", cfg.metrics_path.display());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = ExperimentConfig::load();
    let splits = generate(&cli.data.synthetic_config())?;
    let device = Device::default();
    <ADBackend as burn::tensor::backend::Backend>::seed(cli.data.seed);
    tracing::info!(
        model = model_name(cli.model),
        attack = ?cli.attack.attack,
        defense = ?cli.defense.defense,
        "starting defense"
    );
    match cli.model {
        ModelKind::Net => run(new_net(&cli.data, &device), &cli, &cfg, &splits),
        ModelKind::Mlp => run(new_mlp(&cli.data, &device), &cli, &cfg, &splits),
    }
}
