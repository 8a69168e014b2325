use std::f64::consts::SQRT_2;

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::Backend;
use burn::tensor::Tensor;

use poscls_core::settings::WeightInitialization;
use poscls_core::shape::FeatureShape;
use poscls_core::summary::{ActivationKind, LayerKind, SummaryBuilder};

pub(crate) fn initializer(initialization: WeightInitialization) -> Initializer {
    match initialization {
        WeightInitialization::GlorotUniform => Initializer::XavierUniform { gain: 1.0 },
        WeightInitialization::GlorotNormal => Initializer::XavierNormal { gain: 1.0 },
        WeightInitialization::HeUniform => Initializer::KaimingUniform {
            gain: SQRT_2,
            fan_out_only: false,
        },
        WeightInitialization::HeNormal => Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: false,
        },
    }
}

/// Padding that keeps `ceil(size / stride)` pixels along each spatial axis.
fn same_padding(kernel_size: usize, stride: usize) -> PaddingConfig2d {
    match stride {
        1 => PaddingConfig2d::Same,
        _ => PaddingConfig2d::Explicit(kernel_size / 2, kernel_size / 2),
    }
}

pub(crate) fn same_conv<B: Backend>(
    channels: [usize; 2],
    kernel_size: usize,
    stride: usize,
    initialization: WeightInitialization,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [kernel_size, kernel_size])
        .with_stride([stride, stride])
        .with_padding(same_padding(kernel_size, stride))
        .with_initializer(initializer(initialization))
        .init(device)
}

/// Batch normalization with a running average that keeps 99% of its history.
pub(crate) fn batch_norm<B: Backend>(channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels)
        .with_momentum(0.01)
        .with_epsilon(1.0e-3)
        .init(device)
}

/// Sum of the squared kernel entries, the L2 term scaled by the weight decay.
pub(crate) fn kernel_penalty<B: Backend, const D: usize>(kernel: Tensor<B, D>) -> Tensor<B, 1> {
    kernel.powf_scalar(2.0).sum()
}

fn conv_filters<B: Backend>(conv: &Conv2d<B>) -> [usize; 2] {
    let [out_channels, in_channels, _, _] = conv.weight.val().dims();
    [in_channels, out_channels]
}

/// Convolution followed by batch normalization and a ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Relu,
    stride: usize,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        channels: [usize; 2],
        kernel_size: usize,
        stride: usize,
        initialization: WeightInitialization,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: same_conv(channels, kernel_size, stride, initialization, device),
            norm: batch_norm(channels[1], device),
            activation: Relu::new(),
            stride,
        }
    }

    /// Input and output channels of the convolution.
    pub fn channels(&self) -> [usize; 2] {
        conv_filters(&self.conv)
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);

        self.activation.forward(x)
    }

    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        kernel_penalty(self.conv.weight.val())
    }

    pub fn describe(&self, builder: &mut SummaryBuilder, input: FeatureShape) -> FeatureShape {
        let [_, filters] = self.channels();
        let output = input.convolved(filters, self.stride);
        builder.push(LayerKind::Conv2d, output.dims(), self.conv.num_params());
        builder.push(LayerKind::BatchNorm, output.dims(), self.norm.num_params());
        builder.push(
            LayerKind::Activation(ActivationKind::Relu),
            output.dims(),
            0,
        );
        output
    }
}

/// Two stacked 3x3 convolutions added onto a shortcut path. The shortcut projects through
/// a convolution whenever the block changes the number of channels.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    first: ConvBlock<B>,
    second: Conv2d<B>,
    second_norm: BatchNorm<B, 2>,
    shortcut: Option<Conv2d<B>>,
    activation: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(
        channels: [usize; 2],
        kernel_size: usize,
        initialization: WeightInitialization,
        device: &B::Device,
    ) -> Self {
        let [in_channels, out_channels] = channels;
        let shortcut = (in_channels != out_channels)
            .then(|| same_conv(channels, kernel_size, 1, initialization, device));

        Self {
            first: ConvBlock::new(channels, kernel_size, 1, initialization, device),
            second: same_conv(
                [out_channels, out_channels],
                kernel_size,
                1,
                initialization,
                device,
            ),
            second_norm: batch_norm(out_channels, device),
            shortcut,
            activation: Relu::new(),
        }
    }

    pub fn channels(&self) -> [usize; 2] {
        self.first.channels()
    }

    pub fn has_projection(&self) -> bool {
        self.shortcut.is_some()
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut = match &self.shortcut {
            Some(projection) => projection.forward(input.clone()),
            None => input.clone(),
        };

        let x = self.first.forward(input);
        let x = self.second.forward(x);
        let x = self.second_norm.forward(x);

        self.activation.forward(x + shortcut)
    }

    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        let penalty = self.first.l2_penalty() + kernel_penalty(self.second.weight.val());
        match &self.shortcut {
            Some(projection) => penalty + kernel_penalty(projection.weight.val()),
            None => penalty,
        }
    }

    pub fn describe(&self, builder: &mut SummaryBuilder, input: FeatureShape) -> FeatureShape {
        let block_input = builder.head();
        let output = self.first.describe(builder, input);
        builder.push(LayerKind::Conv2d, output.dims(), self.second.num_params());
        let branch = builder.push(
            LayerKind::BatchNorm,
            output.dims(),
            self.second_norm.num_params(),
        );

        let shortcut = match &self.shortcut {
            Some(projection) => builder.push_from(
                LayerKind::Conv2d,
                output.dims(),
                projection.num_params(),
                vec![block_input],
            ),
            None => block_input,
        };

        builder.push_from(LayerKind::Add, output.dims(), 0, vec![branch, shortcut]);
        builder.push(
            LayerKind::Activation(ActivationKind::Relu),
            output.dims(),
            0,
        );
        output
    }
}

/// Dense layer mapping the flattened features to class scores.
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    dense: Linear<B>,
}

impl<B: Backend> ClassificationHead<B> {
    pub const NAME: &'static str = "output_class";

    pub fn new(
        features: usize,
        num_classes: usize,
        initialization: WeightInitialization,
        device: &B::Device,
    ) -> Self {
        let dense = LinearConfig::new(features, num_classes)
            .with_initializer(initializer(initialization))
            .init(device);
        Self { dense }
    }

    /// Unnormalized class scores, softmax is applied by the classifier.
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.dense.forward(features)
    }

    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        kernel_penalty(self.dense.weight.val())
    }

    pub fn describe(&self, builder: &mut SummaryBuilder, input: FeatureShape) {
        let [_, num_classes] = self.dense.weight.val().dims();
        builder.push(LayerKind::Flatten, vec![input.flattened()], 0);
        builder.push_named(
            Self::NAME,
            LayerKind::Dense(ActivationKind::Softmax),
            vec![num_classes],
            self.dense.num_params(),
        );
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn conv_block_keeps_spatial_size_with_stride_one() {
        let device = Default::default();
        let block =
            ConvBlock::<TestBackend>::new([3, 8], 3, 1, WeightInitialization::default(), &device);
        let input = Tensor::<TestBackend, 4>::random([2, 3, 9, 9], Distribution::Default, &device);
        assert_eq!(block.forward(input).dims(), [2, 8, 9, 9]);
        assert_eq!(block.channels(), [3, 8]);
    }

    #[test]
    fn strided_conv_block_rounds_up() {
        let device = Default::default();
        let block =
            ConvBlock::<TestBackend>::new([3, 4], 7, 2, WeightInitialization::HeNormal, &device);
        let input = Tensor::<TestBackend, 4>::random([1, 3, 9, 10], Distribution::Default, &device);
        assert_eq!(block.forward(input).dims(), [1, 4, 5, 5]);

        let mut builder = SummaryBuilder::new("block", FeatureShape::new(3, 9, 10));
        let output = block.describe(&mut builder, FeatureShape::new(3, 9, 10));
        assert_eq!(output, FeatureShape::new(4, 5, 5));
    }

    #[test]
    fn shortcut_projects_only_when_channels_change() {
        let device = Default::default();
        let identity =
            ResidualBlock::<TestBackend>::new([8, 8], 3, WeightInitialization::default(), &device);
        let projected =
            ResidualBlock::<TestBackend>::new([8, 16], 3, WeightInitialization::default(), &device);
        assert!(!identity.has_projection());
        assert!(projected.has_projection());

        let input = Tensor::<TestBackend, 4>::random([1, 8, 6, 6], Distribution::Default, &device);
        assert_eq!(identity.forward(input.clone()).dims(), [1, 8, 6, 6]);
        assert_eq!(projected.forward(input).dims(), [1, 16, 6, 6]);
    }

    #[test]
    fn residual_summary_wires_the_shortcut_into_the_add() {
        let device = Default::default();
        let input = FeatureShape::new(8, 6, 6);
        let block =
            ResidualBlock::<TestBackend>::new([8, 16], 3, WeightInitialization::default(), &device);
        let mut builder = SummaryBuilder::new("block", input);
        block.describe(&mut builder, input);
        let summary = builder.build();

        let add = summary
            .layers_of(LayerKind::Add)
            .next()
            .expect("residual block must add its paths");
        assert_eq!(add.inputs, vec!["batch_normalization_2", "conv2d_3"]);
        let projection = summary.layer("conv2d_3").expect("projection is recorded");
        assert_eq!(projection.inputs, vec!["input_1"]);
        assert_eq!(projection.params, 8 * 16 * 9 + 16);
    }

    #[test]
    fn penalty_is_positive_for_initialized_kernels() {
        let device = Default::default();
        let identity =
            ResidualBlock::<TestBackend>::new([4, 4], 3, WeightInitialization::default(), &device);
        let penalty = identity.l2_penalty().into_scalar();
        assert!(penalty > 0.0);
    }
}
