//! Tensor encoding: canonical RGB pixels -> backbone-normalized f32 tensors.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array3, Array4, Axis};

use crate::engine::InferenceError;

/// Memory layout of a single encoded image (and of the batch built from it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[batch, height, width, channels]`, as exported from Keras.
    Nhwc,
    /// `[batch, channels, height, width]`, as exported from PyTorch.
    Nchw,
}

impl TensorLayout {
    /// Expected 4-D shape for `n` square images of side `size`.
    pub fn batch_shape(self, n: usize, size: usize) -> [usize; 4] {
        match self {
            Self::Nhwc => [n, size, size, 3],
            Self::Nchw => [n, 3, size, size],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nhwc => "nhwc",
            Self::Nchw => "nchw",
        }
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nhwc" => Ok(Self::Nhwc),
            "nchw" => Ok(Self::Nchw),
            other => Err(format!("unknown tensor layout '{other}' (expected nhwc or nchw)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Per-channel normalization the backbone was trained with.
///
/// Output channel `c` is `(px[src] * scale - mean[c]) / std[c]`, where `src`
/// is `c` for RGB order and `2 - c` for BGR order. `mean` and `std` are
/// indexed by output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BackboneNormalization {
    pub order: ChannelOrder,
    pub scale: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl BackboneNormalization {
    /// ResNet50 "caffe" mode: BGR, zero-centered on ImageNet means, no scaling.
    pub fn resnet50_caffe() -> Self {
        Self {
            order: ChannelOrder::Bgr,
            scale: 1.0,
            mean: [103.939, 116.779, 123.68],
            std: [1.0, 1.0, 1.0],
        }
    }

    /// Torch-style ImageNet normalization on `[0, 1]` RGB.
    pub fn imagenet() -> Self {
        Self {
            order: ChannelOrder::Rgb,
            scale: 1.0 / 255.0,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    #[inline]
    fn source_channel(&self, c: usize) -> usize {
        match self.order {
            ChannelOrder::Rgb => c,
            ChannelOrder::Bgr => 2 - c,
        }
    }

    #[inline]
    fn apply(&self, c: usize, px: &[u8]) -> f32 {
        (px[self.source_channel(c)] as f32 * self.scale - self.mean[c]) / self.std[c]
    }
}

/// Anything that can be encoded: interleaved 8-bit samples of known geometry.
pub trait ModelInput {
    fn dimensions(&self) -> (u32, u32);
    fn channel_count(&self) -> usize;
    fn samples(&self) -> &[u8];
}

/// One encoded image. The array is `[h, w, 3]` for NHWC, `[3, h, w]` for NCHW.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTensor {
    data: Array3<f32>,
    layout: TensorLayout,
}

impl EncodedTensor {
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

/// Encode a 3-channel image into a normalized tensor.
///
/// The channel count is re-checked here. Anything other than 3 is an engine
/// invariant violation, not a client error.
pub fn encode(
    input: &impl ModelInput,
    norm: &BackboneNormalization,
    layout: TensorLayout,
) -> Result<EncodedTensor, InferenceError> {
    let channels = input.channel_count();
    if channels != 3 {
        return Err(InferenceError::ChannelInvariant(channels));
    }

    let (w, h) = input.dimensions();
    let (w, h) = (w as usize, h as usize);
    let samples = input.samples();
    let expected = w * h * 3;
    if samples.len() != expected {
        return Err(InferenceError::BufferSize {
            expected,
            actual: samples.len(),
        });
    }

    let pixel = |y: usize, x: usize| {
        let i = (y * w + x) * 3;
        &samples[i..i + 3]
    };

    let data = match layout {
        TensorLayout::Nhwc => Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
            norm.apply(c, pixel(y, x))
        }),
        TensorLayout::Nchw => Array3::from_shape_fn((3, h, w), |(c, y, x)| {
            norm.apply(c, pixel(y, x))
        }),
    };

    Ok(EncodedTensor { data, layout })
}

/// Stack encoded tensors into one `[N, ...]` batch.
pub fn stack_batch(items: &[EncodedTensor]) -> Result<Array4<f32>, InferenceError> {
    let first = items
        .first()
        .ok_or_else(|| InferenceError::Tensor("cannot stack an empty batch".into()))?;
    if items.iter().any(|t| t.layout != first.layout) {
        return Err(InferenceError::Tensor("mixed tensor layouts in batch".into()));
    }
    let views: Vec<_> = items.iter().map(|t| t.data.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|e| InferenceError::Tensor(e.to_string()))
}
