use anyhow::Context;
use attacks::{BackdoorAttack, TrojanNn};
use backdoor_lab_tools::experiment::{
    append_jsonl, artifact_path, build_badnet, ensure_parent, model_name, new_mlp, new_net, Device,
    TrainOverrides,
};
use backdoor_lab_tools::{init_tracing, ExperimentConfig};
use burn::module::AutodiffModule;
use clap::Parser;
use cli_support::{AttackArgs, AttackKind, DataArgs, MarkArgs};
use models::{save_checkpoint, ImageModel};
use training::util::ModelKind;
use training::ADBackend;
use trojan_dataset::{generate, DatasetSplits};

#[derive(Parser, Debug)]
#[command(
    name = "backdoor_attack",
    about = "Train a backdoored classifier on synthetic data and save it with its mark"
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
    train: TrainOverrides,
}

fn run<M>(model: M, cli: &Cli, cfg: &ExperimentConfig, splits: &DatasetSplits) -> anyhow::Result<()>
where
    M: ImageModel<ADBackend> + AutodiffModule<ADBackend>,
{
    let device = Device::default();
    let train_cfg = cli.train.train_config(cfg, cli.data.seed);
    let badnet = build_badnet(&cli.data, &cli.mark, &cli.attack, &device)?;
    let (model, name, stem, report, artifact, mark) = match cli.attack.attack {
        AttackKind::Badnet => {
            let mut attack = badnet;
            let (model, report) = attack.attack(model, splits, &train_cfg, &device)?;
            let artifact = BackdoorAttack::artifact(&attack);
            (model, attack.name(), attack.get_filename(), report, artifact, attack.into_mark())
        }
        AttackKind::Trojannn => {
            let mut attack = TrojanNn::new(cli.attack.trojannn_config(), badnet)?;
            let (model, report) = attack.attack(model, splits, &train_cfg, &device)?;
            let (name, stem) = (attack.name(), attack.get_filename());
            let artifact = BackdoorAttack::artifact(&attack);
            let mark = attack.into_badnet().into_mark();
            (model, name, stem, report, artifact, mark)
        }
    };

    let ckpt = cfg.checkpoint_path(model_name(cli.model), &stem);
    ensure_parent(&ckpt)?;
    save_checkpoint(model.valid(), &ckpt)
        .with_context(|| format!("saving checkpoint {}", ckpt.display()))?;
    let mark_file = artifact_path(&ckpt);
    artifact
        .save(&mark_file)
        .with_context(|| format!("saving attack artifact {}", mark_file.display()))?;
    let png = cfg.mark_png_path(&stem);
    ensure_parent(&png)?;
    mark.save_png(&png)?;
    println!("Saved checkpoint to {}", ckpt.display());
    println!("Saved mark to {} and {}", mark_file.display(), png.display());

    append_jsonl(
        &cfg.metrics_path,
        &serde_json::json!({
            "kind": "attack",
            "attack": name,
            "model": model_name(cli.model),
            "stem": stem,
            "clean_acc": report.clean_acc(),
            "attack_success_rate": report.attack_success_rate(),
            "checkpoint": ckpt,
        }),
    )?;
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
        train = splits.train.len(),
        valid = splits.valid.len(),
        "starting attack"
    );
    match cli.model {
        ModelKind::Net => run(new_net(&cli.data, &device), &cli, &cfg, &splits),
        ModelKind::Mlp => run(new_mlp(&cli.data, &device), &cli, &cfg, &splits),
    }
}
