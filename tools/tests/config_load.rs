use std::fs;
use std::path::PathBuf;

use backdoor_lab_tools::ExperimentConfig;

fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("backdoor-lab.toml");
    fs::write(&path, contents).expect("write temp config");
    path
}

#[test]
fn missing_file_is_none() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ExperimentConfig::from_path(&dir.path().join("nope.toml")).is_none());
}

#[test]
fn loads_minimal_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "checkpoints_root = \"ckpt\"\n");
    let cfg = ExperimentConfig::from_path(&path).expect("load config");
    assert_eq!(cfg.checkpoints_root, PathBuf::from("ckpt"));
    assert_eq!(cfg.marks_root, PathBuf::from("results/marks"));
    assert_eq!(cfg.epochs, ExperimentConfig::default().epochs);
}

#[test]
fn results_root_moves_derived_paths() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "results_root = \"out\"\n\n[training]\nepochs = 3\nlr = 0.01\nbatch_size = 8\n",
    );
    let cfg = ExperimentConfig::from_path(&path).expect("load config");
    assert_eq!(cfg.marks_root, PathBuf::from("out/marks"));
    assert_eq!(cfg.cache_dir, PathBuf::from("out/defenses"));
    assert_eq!((cfg.epochs, cfg.batch_size), (3, 8));
    assert!((cfg.lr - 0.01).abs() < 1e-12);
    assert_eq!(
        cfg.checkpoint_path("net", "badnet_tar0"),
        PathBuf::from("checkpoints/net_badnet_tar0.bin")
    );
}

#[test]
fn unparsable_config_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "epochs = [not toml");
    assert!(ExperimentConfig::from_path(&path).is_none());
}
