use burn::module::Module;
use burn::nn;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::{unknown_layer, ImageModel, LayerOutput, ModelError, ModelResult, NamedWeight};

const LAYERS: [&str; 4] = ["features", "flatten", "classifier.fc1", "classifier.fc"];

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub data_shape: [usize; 3],
    pub num_classes: usize,
    pub conv_channels: [usize; 2],
    pub hidden: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            data_shape: [3, 16, 16],
            num_classes: 10,
            conv_channels: [16, 32],
            hidden: 64,
        }
    }
}

/// Two 3x3 convolutions, global average pooling, two-layer classifier head.
#[derive(Debug, Module)]
pub struct Net<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    fc1: nn::Linear<B>,
    fc: nn::Linear<B>,
    channels: usize,
    height: usize,
    width: usize,
    num_classes: usize,
}

impl<B: Backend> Net<B> {
    pub fn new(cfg: NetConfig, device: &B::Device) -> Self {
        let [c, h, w] = cfg.data_shape;
        let [c1, c2] = cfg.conv_channels;
        let conv1 = Conv2dConfig::new([c, c1], [3, 3])
            .with_padding(nn::PaddingConfig2d::Same)
            .init(device);
        let conv2 = Conv2dConfig::new([c1, c2], [3, 3])
            .with_padding(nn::PaddingConfig2d::Same)
            .init(device);
        let pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let fc1 = nn::LinearConfig::new(c2, cfg.hidden).init(device);
        let fc = nn::LinearConfig::new(cfg.hidden, cfg.num_classes.max(1)).init(device);
        Self {
            conv1,
            conv2,
            pool,
            fc1,
            fc,
            channels: c,
            height: h,
            width: w,
            num_classes: cfg.num_classes.max(1),
        }
    }

    fn features(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv1.forward(input));
        relu(self.conv2.forward(x))
    }

    fn flatten(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        self.pool.forward(features).flatten::<2>(1, 3)
    }
}

impl<B: Backend> ImageModel<B> for Net<B> {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn data_shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.flatten(self.features(input));
        let x = relu(self.fc1.forward(x));
        self.fc.forward(x)
    }

    fn layer_names(&self) -> Vec<&'static str> {
        LAYERS.to_vec()
    }

    fn get_layer(&self, input: Tensor<B, 4>, layer: &str) -> ModelResult<LayerOutput<B>> {
        let features = self.features(input);
        if layer == "features" {
            return Ok(LayerOutput::Spatial(features));
        }
        let flat = self.flatten(features);
        if layer == "flatten" {
            return Ok(LayerOutput::Flat(flat));
        }
        let hidden = relu(self.fc1.forward(flat));
        match layer {
            "classifier.fc1" => Ok(LayerOutput::Flat(hidden)),
            "classifier.fc" => Ok(LayerOutput::Flat(self.fc.forward(hidden))),
            _ => Err(unknown_layer(self, layer)),
        }
    }

    fn named_weight(&self, name: &str) -> ModelResult<NamedWeight<B>> {
        match name {
            "features.0.weight" | "conv1.weight" => Ok(NamedWeight::Conv(self.conv1.weight.val())),
            "features.1.weight" | "conv2.weight" => Ok(NamedWeight::Conv(self.conv2.weight.val())),
            "classifier.fc1.weight" => Ok(NamedWeight::Linear(self.fc1.weight.val())),
            "classifier.fc.weight" => Ok(NamedWeight::Linear(self.fc.weight.val())),
            _ => Err(ModelError::UnknownParameter(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn shapes_follow_config() {
        let device = Default::default();
        let net = Net::<B>::new(
            NetConfig {
                data_shape: [1, 8, 8],
                num_classes: 4,
                conv_channels: [4, 6],
                hidden: 5,
            },
            &device,
        );
        let x = Tensor::<B, 4>::zeros([2, 1, 8, 8], &device);
        assert_eq!(net.forward(x.clone()).dims(), [2, 4]);

        let feats = net.get_layer(x.clone(), "features").unwrap();
        assert_eq!(feats.num_channels(), 6);
        assert_eq!(feats.channel_activation().dims(), [2, 6]);
        assert_eq!(
            net.get_layer(x.clone(), "classifier.fc1")
                .unwrap()
                .channel_activation()
                .dims(),
            [2, 5]
        );
        assert!(matches!(
            net.get_layer(x, "nope"),
            Err(ModelError::UnknownLayer { .. })
        ));
    }

    #[test]
    fn named_weights_reduce_per_input() {
        let device = Default::default();
        let net = Net::<B>::new(NetConfig::default(), &device);
        let w = net.named_weight("classifier.fc1.weight").unwrap();
        assert_eq!(w.abs_mean_per_input().dims(), [32]);
        let w = net.named_weight("conv2.weight").unwrap();
        assert_eq!(w.abs_mean_per_input().dims(), [16]);
        assert!(net.named_weight("fc9.weight").is_err());
    }
}
