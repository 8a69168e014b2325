use burn::config::Config;
use burn::module::Module;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::prelude::Backend;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use burn::train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep};

use poscls_core::error::ArchitectureError;
use poscls_core::settings::{DataShape, TrainingSettings, WeightInitialization};
use poscls_core::shape::FeatureShape;
use poscls_core::summary::{LayerKind, SummaryBuilder};

use crate::batch::ImageBatch;
use crate::blocks::{ClassificationHead, ConvBlock};
use crate::classifier::Classifier;
use crate::configuration::TrainingConfiguration;

/// Filters and number of convolution blocks of every stage.
pub const VGG4_STAGES: [(usize, usize); 5] = [(32, 2), (64, 2), (128, 3), (256, 3), (512, 3)];

const KERNEL_SIZE: usize = 3;
const POOL_SIZE: usize = 2;

#[derive(Config, Debug)]
pub struct Vgg4NetworkConfig {
    input_channels: usize,
    input_height: usize,
    input_width: usize,
    num_classes: usize,
    #[config(default = 1.0e-4)]
    weight_decay: f64,
    #[config(default = "WeightInitialization::GlorotUniform")]
    initialization: WeightInitialization,
}

impl Vgg4NetworkConfig {
    /// Shape of the feature map reaching the classification head.
    pub fn feature_shape(&self) -> Result<FeatureShape, ArchitectureError> {
        let mut shape = FeatureShape::new(self.input_channels, self.input_height, self.input_width);
        for (stage, (filters, _)) in VGG4_STAGES.iter().enumerate() {
            shape = shape.convolved(*filters, 1).pooled(POOL_SIZE);
            if shape.is_collapsed() {
                return Err(ArchitectureError::FeatureMapCollapsed {
                    layer: format!("pooling after stage {}", stage + 1),
                    shape,
                });
            }
        }
        Ok(shape)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Vgg4Network<B>, ArchitectureError> {
        let features = self.feature_shape()?;

        let mut in_channels = self.input_channels;
        let mut stages = Vec::with_capacity(VGG4_STAGES.len());
        for (filters, blocks) in VGG4_STAGES {
            let mut stage = Vec::with_capacity(blocks);
            for _ in 0..blocks {
                stage.push(ConvBlock::new(
                    [in_channels, filters],
                    KERNEL_SIZE,
                    1,
                    self.initialization,
                    device,
                ));
                in_channels = filters;
            }
            stages.push(VggStage { blocks: stage });
        }

        Ok(Vgg4Network {
            stages,
            max_pool: MaxPool2dConfig::new([POOL_SIZE, POOL_SIZE])
                .with_strides([POOL_SIZE, POOL_SIZE])
                .init(),
            avg_pool: AvgPool2dConfig::new([POOL_SIZE, POOL_SIZE])
                .with_strides([POOL_SIZE, POOL_SIZE])
                .init(),
            head: ClassificationHead::new(
                features.flattened(),
                self.num_classes,
                self.initialization,
                device,
            ),
            weight_decay: self.weight_decay,
        })
    }
}

#[derive(Module, Debug)]
pub struct VggStage<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
}

impl<B: Backend> VggStage<B> {
    pub fn blocks(&self) -> &[ConvBlock<B>] {
        &self.blocks
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |x, block| block.forward(x))
    }
}

/// Plain stacked convolutions, max pooled between stages and average pooled at the end.
#[derive(Module, Debug)]
pub struct Vgg4Network<B: Backend> {
    stages: Vec<VggStage<B>>,
    max_pool: MaxPool2d,
    avg_pool: AvgPool2d,
    head: ClassificationHead<B>,
    weight_decay: f64,
}

impl<B: Backend> Vgg4Network<B> {
    pub fn stages(&self) -> &[VggStage<B>] {
        &self.stages
    }
}

impl<B: Backend> Classifier<B> for Vgg4Network<B> {
    fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let last = self.stages.len() - 1;
        let mut x = images;
        for (index, stage) in self.stages.iter().enumerate() {
            x = stage.forward(x);
            x = if index == last {
                self.avg_pool.forward(x)
            } else {
                self.max_pool.forward(x)
            };
        }

        let x = x.flatten::<2>(1, 3);
        self.head.forward(x)
    }

    fn l2_penalty(&self) -> Tensor<B, 1> {
        self.stages
            .iter()
            .flat_map(|stage| stage.blocks.iter())
            .fold(self.head.l2_penalty(), |penalty, block| {
                penalty + block.l2_penalty()
            })
    }

    fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    fn describe(&self, builder: &mut SummaryBuilder, input: FeatureShape) {
        let last = self.stages.len() - 1;
        let mut shape = input;
        for (index, stage) in self.stages.iter().enumerate() {
            for block in stage.blocks.iter() {
                shape = block.describe(builder, shape);
            }
            shape = shape.pooled(POOL_SIZE);
            let pooling = if index == last {
                LayerKind::AvgPool2d
            } else {
                LayerKind::MaxPool2d
            };
            builder.push(pooling, shape.dims(), 0);
        }
        self.head.describe(builder, shape);
    }
}

impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for Vgg4Network<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for Vgg4Network<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch)
    }
}

/// The VGG style network with four pooled stages and a final averaged stage.
#[derive(Clone, Debug)]
pub struct Vgg4Configuration {
    settings: TrainingSettings,
}

impl Vgg4Configuration {
    pub fn new(width: usize, height: usize, number_of_classes: usize) -> Self {
        let settings = TrainingSettings::builder()
            .data_shape(DataShape::rgb(width, height))
            .number_of_classes(number_of_classes)
            .build();
        Self { settings }
    }

    pub fn with_settings(settings: TrainingSettings) -> Self {
        Self { settings }
    }

    pub fn network_config(&self) -> Vgg4NetworkConfig {
        let data_shape = self.settings.data_shape;
        Vgg4NetworkConfig::new(
            data_shape.channels,
            data_shape.height,
            data_shape.width,
            self.settings.number_of_classes,
        )
        .with_weight_decay(self.settings.weight_decay)
        .with_initialization(self.settings.initialization)
    }
}

impl TrainingConfiguration for Vgg4Configuration {
    type Network<B: Backend> = Vgg4Network<B>;

    fn name(&self) -> &'static str {
        "vgg4"
    }

    fn performs_localization(&self) -> bool {
        false
    }

    fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    fn network<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<Self::Network<B>, ArchitectureError> {
        self.network_config().init(device)
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::{Distribution, Int};

    use poscls_core::summary::ActivationKind;

    use super::*;
    use crate::tests::{TestAutodiffBackend, TestBackend};

    #[test]
    fn name_and_localization_are_fixed() {
        let configuration = Vgg4Configuration::new(96, 96, 32);
        assert_eq!(configuration.name(), "vgg4");
        assert!(!configuration.performs_localization());
    }

    #[test]
    fn output_layer_is_a_softmax_over_the_classes() {
        let device = Default::default();
        let configuration = Vgg4Configuration::new(32, 32, 7);
        let classifier = configuration
            .classifier::<TestBackend>(&device)
            .expect("32x32 input is large enough");

        let output = classifier
            .summary()
            .output_layer()
            .expect("summary has layers");
        assert_eq!(output.name, "output_class");
        assert_eq!(output.kind, LayerKind::Dense(ActivationKind::Softmax));
        assert_eq!(output.output_shape, vec![7]);

        let images = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);
        let probabilities = classifier.predict(images);
        assert_eq!(probabilities.dims(), [2, 7]);
        let row_sums: Vec<f32> = probabilities
            .sum_dim(1)
            .into_data()
            .to_vec()
            .expect("float output");
        for sum in row_sums {
            assert!((sum - 1.0).abs() < 1.0e-4);
        }
    }

    #[test]
    fn summary_follows_the_stage_layout() {
        let device = Default::default();
        let classifier = Vgg4Configuration::new(64, 48, 10)
            .classifier::<TestBackend>(&device)
            .expect("input is large enough");
        let summary = classifier.summary();

        assert_eq!(summary.layers_of(LayerKind::Conv2d).count(), 13);
        assert_eq!(summary.layers_of(LayerKind::BatchNorm).count(), 13);
        assert_eq!(summary.layers_of(LayerKind::MaxPool2d).count(), 4);
        assert_eq!(summary.layers_of(LayerKind::AvgPool2d).count(), 1);
        // input, 13 conv blocks of three layers, five poolings, flatten and the head
        assert_eq!(summary.layer_count(), 1 + 13 * 3 + 5 + 2);

        let first_conv = summary.layer("conv2d_1").expect("first convolution");
        assert_eq!(first_conv.output_shape, vec![32, 48, 64]);
        assert_eq!(first_conv.params, 3 * 32 * 9 + 32);

        // 48x64 pixels are pooled down to 1x2 after five stages
        let flatten = summary.layer("flatten_1").expect("flatten layer");
        assert_eq!(flatten.output_shape, vec![512 * 2]);
        assert_eq!(summary.total_params(), classifier.network().num_params());
    }

    #[test]
    fn rebuilding_yields_the_same_architecture() {
        let device = Default::default();
        let configuration = Vgg4Configuration::new(32, 32, 4);
        let first = configuration
            .classifier::<TestBackend>(&device)
            .expect("valid input");
        let second = configuration
            .classifier::<TestBackend>(&device)
            .expect("valid input");
        assert_eq!(first.summary(), second.summary());
    }

    #[test]
    fn too_small_inputs_are_rejected() {
        let device = Default::default();
        let result = Vgg4Configuration::new(16, 16, 4).classifier::<TestBackend>(&device);
        assert!(matches!(
            result,
            Err(ArchitectureError::FeatureMapCollapsed { ref layer, .. }) if layer == "pooling after stage 5"
        ));
    }

    #[test]
    fn train_step_includes_the_weight_penalty() {
        let device = Default::default();
        let network = Vgg4Configuration::new(32, 32, 3)
            .network::<TestAutodiffBackend>(&device)
            .expect("valid input");
        let batch = ImageBatch {
            images: Tensor::random([2, 3, 32, 32], Distribution::Default, &device),
            targets: Tensor::<TestAutodiffBackend, 1, Int>::from_ints([0, 2], &device),
        };

        let penalty = network.l2_penalty().into_scalar() as f64 * network.weight_decay();
        let output = TrainStep::step(&network, batch);
        let loss = output.item.loss.into_scalar() as f64;
        assert!(loss.is_finite());
        assert!(loss > penalty);
    }
}
