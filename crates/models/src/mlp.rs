use burn::module::{Module, Param};
use burn::nn;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::{unknown_layer, ImageModel, LayerOutput, ModelError, ModelResult, NamedWeight};

const LAYERS: [&str; 3] = ["flatten", "features", "classifier.fc"];

#[derive(Debug, Clone)]
pub struct MlpNetConfig {
    pub data_shape: [usize; 3],
    pub num_classes: usize,
    pub hidden: usize,
}

impl Default for MlpNetConfig {
    fn default() -> Self {
        Self {
            data_shape: [3, 16, 16],
            num_classes: 10,
            hidden: 64,
        }
    }
}

#[derive(Debug, Module)]
pub struct MlpNet<B: Backend> {
    features: nn::Linear<B>,
    fc: nn::Linear<B>,
    channels: usize,
    height: usize,
    width: usize,
    num_classes: usize,
}

impl<B: Backend> MlpNet<B> {
    pub fn new(cfg: MlpNetConfig, device: &B::Device) -> Self {
        let [c, h, w] = cfg.data_shape;
        let features = nn::LinearConfig::new(c * h * w, cfg.hidden).init(device);
        let fc = nn::LinearConfig::new(cfg.hidden, cfg.num_classes.max(1)).init(device);
        Self {
            features,
            fc,
            channels: c,
            height: h,
            width: w,
            num_classes: cfg.num_classes.max(1),
        }
    }

    /// Replace the hidden layer with a fixed `[C*H*W, hidden]` weight and zero bias.
    pub fn with_features_weight(mut self, weight: Tensor<B, 2>) -> Self {
        let [_, hidden] = weight.dims();
        let device = weight.device();
        self.features.weight = Param::from_tensor(weight);
        self.features.bias = Some(Param::from_tensor(Tensor::zeros([hidden], &device)));
        self
    }

    fn flatten(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        input.flatten::<2>(1, 3)
    }
}

impl<B: Backend> ImageModel<B> for MlpNet<B> {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn data_shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.features.forward(self.flatten(input)));
        self.fc.forward(x)
    }

    fn layer_names(&self) -> Vec<&'static str> {
        LAYERS.to_vec()
    }

    fn get_layer(&self, input: Tensor<B, 4>, layer: &str) -> ModelResult<LayerOutput<B>> {
        let flat = self.flatten(input);
        match layer {
            "flatten" => Ok(LayerOutput::Flat(flat)),
            "features" => Ok(LayerOutput::Flat(relu(self.features.forward(flat)))),
            "classifier.fc" => Ok(LayerOutput::Flat(self.forward_flat(flat))),
            _ => Err(unknown_layer(self, layer)),
        }
    }

    fn named_weight(&self, name: &str) -> ModelResult<NamedWeight<B>> {
        match name {
            "features.weight" => Ok(NamedWeight::Linear(self.features.weight.val())),
            "classifier.fc.weight" => Ok(NamedWeight::Linear(self.fc.weight.val())),
            _ => Err(ModelError::UnknownParameter(name.to_string())),
        }
    }
}

impl<B: Backend> MlpNet<B> {
    fn forward_flat(&self, flat: Tensor<B, 2>) -> Tensor<B, 2> {
        self.fc.forward(relu(self.features.forward(flat)))
    }
}
