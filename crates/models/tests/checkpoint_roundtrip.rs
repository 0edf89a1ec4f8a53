use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use models::{load_checkpoint, save_checkpoint, ImageModel, Net, NetConfig};

type B = NdArray<f32>;

#[test]
fn saved_net_reloads_with_identical_logits() {
    let device = Default::default();
    let cfg = NetConfig {
        data_shape: [3, 8, 8],
        num_classes: 3,
        ..Default::default()
    };
    let net = Net::<B>::new(cfg.clone(), &device);
    let input = Tensor::<B, 4>::ones([1, 3, 8, 8], &device);
    let before = net
        .forward(input.clone())
        .into_data()
        .to_vec::<f32>()
        .unwrap();

    let temp = tempfile::tempdir().unwrap();
    let ckpt = temp.path().join("net");
    save_checkpoint(net, &ckpt).expect("save checkpoint");

    let fresh = Net::<B>::new(cfg, &device);
    let loaded = load_checkpoint(fresh, &ckpt, &device).expect("load checkpoint");
    let after = loaded.forward(input).into_data().to_vec::<f32>().unwrap();
    for (a, b) in before.iter().zip(&after) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn missing_checkpoint_is_an_error() {
    let device = Default::default();
    let temp = tempfile::tempdir().unwrap();
    let net = Net::<B>::new(NetConfig::default(), &device);
    assert!(load_checkpoint(net, temp.path().join("absent"), &device).is_err());
}
