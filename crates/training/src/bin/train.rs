use clap::Parser;
use training::util::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    if args.epochs == 0 {
        anyhow::bail!("--epochs must be at least 1");
    }
    run_train(args)
}
