//! Trigger mark state and blending.
//!
//! A mark is a `(C + 1, mark_height, mark_width)` tensor: `C` pattern
//! channels followed by one alpha channel. Blending pads the mark to the
//! input frame at the current offset and computes
//! `x + mask * alpha * (pattern - x)`, which stays differentiable in both
//! the input and the mark.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::imageops::FilterType;
use image::{GrayAlphaImage, LumaA, Rgba, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

use crate::error::{config_err, AttackError, AttackResult};

/// `(tanh(x) + 1) / 2` elementwise, mapping any real tensor into `[0, 1]`.
pub fn tanh_func<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.tanh().add_scalar(1.0).mul_scalar(0.5)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkConfig {
    pub mark_height: usize,
    pub mark_width: usize,
    pub height_offset: usize,
    pub width_offset: usize,
    /// Draw a fresh offset on every `add_mark` call.
    pub random_pos: bool,
    /// Start from uniform random pixels instead of white.
    pub random_init: bool,
    /// Opacity multiplier applied to the alpha channel when blending.
    pub mark_alpha: f32,
    pub seed: Option<u64>,
}

impl Default for MarkConfig {
    fn default() -> Self {
        Self {
            mark_height: 3,
            mark_width: 3,
            height_offset: 0,
            width_offset: 0,
            random_pos: false,
            random_init: false,
            mark_alpha: 1.0,
            seed: None,
        }
    }
}

impl MarkConfig {
    fn validate(&self, data_shape: [usize; 3]) -> AttackResult<()> {
        let [_, h, w] = data_shape;
        if self.mark_height == 0 || self.mark_width == 0 {
            return Err(config_err("mark size must be positive"));
        }
        if self.mark_height > h || self.mark_width > w {
            return Err(config_err(format!(
                "mark ({}, {}) larger than input ({h}, {w})",
                self.mark_height, self.mark_width
            )));
        }
        if !self.random_pos
            && (self.height_offset + self.mark_height > h || self.width_offset + self.mark_width > w)
        {
            return Err(config_err(format!(
                "mark at offset ({}, {}) falls outside the ({h}, {w}) input",
                self.height_offset, self.width_offset
            )));
        }
        if !(0.0..=1.0).contains(&self.mark_alpha) {
            return Err(config_err(format!(
                "mark_alpha must lie in [0, 1], got {}",
                self.mark_alpha
            )));
        }
        Ok(())
    }
}

/// The trigger owned by an attack. Defenses read it through `&Watermark`.
#[derive(Debug, Clone)]
pub struct Watermark<B: Backend> {
    mark: Tensor<B, 3>,
    data_shape: [usize; 3],
    mark_height: usize,
    mark_width: usize,
    height_offset: usize,
    width_offset: usize,
    random_pos: bool,
    random_init: bool,
    mark_alpha: f32,
    rng: StdRng,
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

impl<B: Backend> Watermark<B> {
    pub fn new(data_shape: [usize; 3], cfg: &MarkConfig, device: &B::Device) -> AttackResult<Self> {
        cfg.validate(data_shape)?;
        let c = data_shape[0];
        let area = cfg.mark_height * cfg.mark_width;
        let mut rng = seeded(cfg.seed);
        let mut values: Vec<f32> = if cfg.random_init {
            (0..c * area).map(|_| rng.random::<f32>()).collect()
        } else {
            vec![1.0; c * area]
        };
        values.extend(std::iter::repeat(1.0).take(area));
        let mark = Tensor::from_data(
            TensorData::new(values, [c + 1, cfg.mark_height, cfg.mark_width]),
            device,
        );
        Ok(Self {
            mark,
            data_shape,
            mark_height: cfg.mark_height,
            mark_width: cfg.mark_width,
            height_offset: cfg.height_offset,
            width_offset: cfg.width_offset,
            random_pos: cfg.random_pos,
            random_init: cfg.random_init,
            mark_alpha: cfg.mark_alpha,
            rng,
        })
    }

    /// Zero mark covering the whole input at a fixed position.
    pub fn full_frame(data_shape: [usize; 3], device: &B::Device) -> Self {
        let [c, h, w] = data_shape;
        Self {
            mark: Tensor::zeros([c + 1, h, w], device),
            data_shape,
            mark_height: h,
            mark_width: w,
            height_offset: 0,
            width_offset: 0,
            random_pos: false,
            random_init: false,
            mark_alpha: 1.0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Load a mark from an image file, resized to the configured mark size.
    ///
    /// Alpha comes from the image alpha channel; pixels equal to `background`
    /// are made fully transparent.
    pub fn from_image(
        path: &Path,
        data_shape: [usize; 3],
        cfg: &MarkConfig,
        background: Option<[u8; 3]>,
        device: &B::Device,
    ) -> AttackResult<Self> {
        let c = data_shape[0];
        if c != 1 && c != 3 {
            return Err(config_err(format!(
                "image marks support 1 or 3 channels, got {c}"
            )));
        }
        let mut watermark = Self::new(data_shape, cfg, device)?;
        let img = image::open(path).map_err(|source| AttackError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        let (mh, mw) = (cfg.mark_height, cfg.mark_width);
        let rgba = img
            .resize_exact(mw as u32, mh as u32, FilterType::Triangle)
            .to_rgba8();
        let area = mh * mw;
        let mut values = vec![0.0f32; (c + 1) * area];
        for (i, px) in rgba.pixels().enumerate() {
            let [r, g, b, a] = px.0;
            if c == 3 {
                values[i] = r as f32 / 255.0;
                values[area + i] = g as f32 / 255.0;
                values[2 * area + i] = b as f32 / 255.0;
            } else {
                values[i] = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) / 255.0;
            }
            let transparent = background.is_some_and(|bg| bg == [r, g, b]);
            values[c * area + i] = if transparent { 0.0 } else { a as f32 / 255.0 };
        }
        watermark.mark = Tensor::from_data(TensorData::new(values, [c + 1, mh, mw]), device);
        Ok(watermark)
    }

    pub fn mark(&self) -> &Tensor<B, 3> {
        &self.mark
    }

    pub fn data_shape(&self) -> [usize; 3] {
        self.data_shape
    }

    pub fn channels(&self) -> usize {
        self.data_shape[0]
    }

    pub fn mark_size(&self) -> (usize, usize) {
        (self.mark_height, self.mark_width)
    }

    pub fn offsets(&self) -> (usize, usize) {
        (self.height_offset, self.width_offset)
    }

    pub fn random_pos(&self) -> bool {
        self.random_pos
    }

    pub fn random_init(&self) -> bool {
        self.random_init
    }

    pub fn mark_alpha(&self) -> f32 {
        self.mark_alpha
    }

    /// Replace the whole `(C + 1, mh, mw)` mark.
    pub fn set_mark(&mut self, mark: Tensor<B, 3>) -> AttackResult<()> {
        let expected = [self.channels() + 1, self.mark_height, self.mark_width];
        if mark.dims() != expected {
            return Err(AttackError::MarkShape {
                got: mark.dims().to_vec(),
                expected: expected.to_vec(),
            });
        }
        self.mark = mark;
        Ok(())
    }

    /// Replace the pattern channels, keeping the alpha channel.
    pub fn set_pattern(&mut self, pattern: Tensor<B, 3>) -> AttackResult<()> {
        let expected = [self.channels(), self.mark_height, self.mark_width];
        if pattern.dims() != expected {
            return Err(AttackError::MarkShape {
                got: pattern.dims().to_vec(),
                expected: expected.to_vec(),
            });
        }
        self.mark = Tensor::cat(vec![pattern, self.alpha_channel()], 0);
        Ok(())
    }

    /// The `(1, mh, mw)` alpha channel.
    pub fn alpha_channel(&self) -> Tensor<B, 3> {
        let c = self.channels();
        self.mark
            .clone()
            .slice([c..c + 1, 0..self.mark_height, 0..self.mark_width])
    }

    fn next_offset(&mut self) -> (usize, usize) {
        if !self.random_pos {
            return (self.height_offset, self.width_offset);
        }
        let [_, h, w] = self.data_shape;
        (
            self.rng.random_range(0..=h - self.mark_height),
            self.rng.random_range(0..=w - self.mark_width),
        )
    }

    /// Blend the mark into `input` (`[N, C, H, W]`).
    ///
    /// `alpha` overrides the configured opacity for this call only.
    pub fn add_mark(&mut self, input: Tensor<B, 4>, alpha: Option<f32>) -> Tensor<B, 4> {
        let offset = self.next_offset();
        blend_mark(
            input,
            self.mark.clone(),
            offset,
            alpha.unwrap_or(self.mark_alpha),
        )
    }

    /// Full-frame `(H, W)` alpha mask at the configured offset.
    pub fn get_mask(&self) -> Tensor<B, 2> {
        let [_, h, w] = self.data_shape;
        let (ho, wo) = (self.height_offset, self.width_offset);
        let alpha = self
            .alpha_channel()
            .reshape([self.mark_height, self.mark_width]);
        Tensor::zeros([h, w], &self.mark.device()).slice_assign(
            [ho..ho + self.mark_height, wo..wo + self.mark_width],
            alpha,
        )
    }

    /// L1 norm of the alpha channel.
    pub fn mask_l1(&self) -> f32 {
        training::scalar(self.alpha_channel().abs().sum())
    }

    /// Host copy of the mark, channel-major.
    pub fn pixels(&self) -> Vec<f32> {
        self.mark.clone().into_data().iter::<f32>().collect()
    }

    /// Write the mark as an RGBA (3 channels) or gray+alpha (1 channel) PNG.
    pub fn save_png(&self, path: &Path) -> AttackResult<()> {
        let (mh, mw) = (self.mark_height, self.mark_width);
        let area = mh * mw;
        let px = self.pixels();
        let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        let result = match self.channels() {
            3 => RgbaImage::from_fn(mw as u32, mh as u32, |x, y| {
                let i = y as usize * mw + x as usize;
                Rgba([
                    to_u8(px[i]),
                    to_u8(px[area + i]),
                    to_u8(px[2 * area + i]),
                    to_u8(px[3 * area + i]),
                ])
            })
            .save(path),
            1 => GrayAlphaImage::from_fn(mw as u32, mh as u32, |x, y| {
                let i = y as usize * mw + x as usize;
                LumaA([to_u8(px[i]), to_u8(px[area + i])])
            })
            .save(path),
            c => return Err(config_err(format!("cannot save a {c}-channel mark as PNG"))),
        };
        result.map_err(|source| AttackError::Image {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Pad `mark` to the input frame at `offset` and blend it into `input`.
pub fn blend_mark<B: Backend>(
    input: Tensor<B, 4>,
    mark: Tensor<B, 3>,
    offset: (usize, usize),
    alpha: f32,
) -> Tensor<B, 4> {
    let [_, c, h, w] = input.dims();
    let [_, mh, mw] = mark.dims();
    let (ho, wo) = offset;
    let full = if (mh, mw) == (h, w) {
        mark
    } else {
        Tensor::zeros([c + 1, h, w], &input.device())
            .slice_assign([0..c + 1, ho..ho + mh, wo..wo + mw], mark)
    };
    let pattern: Tensor<B, 4> = full.clone().slice([0..c, 0..h, 0..w]).unsqueeze();
    let mask: Tensor<B, 4> = full
        .slice([c..c + 1, 0..h, 0..w])
        .unsqueeze::<4>()
        .mul_scalar(alpha);
    input.clone() + mask * (pattern - input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn values<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().iter::<f32>().collect()
    }

    #[test]
    fn tanh_func_saturates_inside_unit_interval() {
        let device = Default::default();
        let x = Tensor::<B, 1>::from_floats([-1e6f32, -20.0, 0.0, 20.0, 1e6], &device);
        let y = values(tanh_func(x));
        assert!(y.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(y[2], 0.5);
    }

    #[test]
    fn white_mark_overwrites_its_patch_only() {
        let device = Default::default();
        let cfg = MarkConfig {
            mark_height: 2,
            mark_width: 2,
            height_offset: 1,
            width_offset: 2,
            ..Default::default()
        };
        let mut mark = Watermark::<B>::new([1, 4, 4], &cfg, &device).unwrap();
        let x = Tensor::<B, 4>::zeros([2, 1, 4, 4], &device);
        let out = values(mark.add_mark(x, None));
        for n in 0..2 {
            for i in 0..4 {
                for j in 0..4 {
                    let inside = (1..3).contains(&i) && (2..4).contains(&j);
                    let v = out[n * 16 + i * 4 + j];
                    assert_eq!(v, if inside { 1.0 } else { 0.0 }, "({n},{i},{j})");
                }
            }
        }
        assert_eq!(mark.mask_l1(), 4.0);
        let mask = values(mark.get_mask());
        assert_eq!(mask.iter().sum::<f32>(), 4.0);
        assert_eq!(mask[4 + 2], 1.0);
    }

    #[test]
    fn alpha_override_blends_halfway() {
        let device = Default::default();
        let mut mark = Watermark::<B>::new([1, 2, 2], &MarkConfig {
            mark_height: 2,
            mark_width: 2,
            ..Default::default()
        }, &device)
        .unwrap();
        let x = Tensor::<B, 4>::zeros([1, 1, 2, 2], &device);
        let out = values(mark.add_mark(x, Some(0.5)));
        assert_eq!(out, vec![0.5; 4]);
    }

    #[test]
    fn invalid_placement_is_rejected() {
        let device = Default::default();
        let cfg = MarkConfig {
            mark_height: 3,
            mark_width: 3,
            height_offset: 2,
            ..Default::default()
        };
        assert!(matches!(
            Watermark::<B>::new([3, 4, 4], &cfg, &device),
            Err(AttackError::Config(_))
        ));
        let cfg = MarkConfig {
            mark_alpha: 1.5,
            ..Default::default()
        };
        assert!(Watermark::<B>::new([3, 4, 4], &cfg, &device).is_err());
    }

    #[test]
    fn set_pattern_keeps_alpha() {
        let device = Default::default();
        let mut mark = Watermark::<B>::new([3, 8, 8], &MarkConfig::default(), &device).unwrap();
        mark.set_pattern(Tensor::zeros([3, 3, 3], &device)).unwrap();
        assert_eq!(mark.mask_l1(), 9.0);
        assert!(mark.set_pattern(Tensor::zeros([3, 2, 3], &device)).is_err());
        assert!(mark.set_mark(Tensor::zeros([3, 3, 3], &device)).is_err());
    }

    #[test]
    fn png_roundtrip_restores_pixels() {
        let device = Default::default();
        let cfg = MarkConfig {
            random_init: true,
            seed: Some(3),
            ..Default::default()
        };
        let mark = Watermark::<B>::new([3, 8, 8], &cfg, &device).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mark.png");
        mark.save_png(&path).unwrap();
        let loaded = Watermark::<B>::from_image(&path, [3, 8, 8], &cfg, None, &device).unwrap();
        for (a, b) in mark.pixels().iter().zip(loaded.pixels()) {
            assert!((a - b).abs() < 1.0 / 255.0 + 1e-6);
        }
    }
}
