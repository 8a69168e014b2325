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
use crate::blocks::{ClassificationHead, ConvBlock, ResidualBlock};
use crate::classifier::Classifier;
use crate::configuration::TrainingConfiguration;

/// Filters and number of residual blocks of every stage.
pub const RES_NET_4_STAGES: [(usize, usize); 5] = [(32, 1), (64, 2), (128, 3), (256, 3), (512, 3)];

const STEM_FILTERS: usize = 64;
const STEM_KERNEL_SIZE: usize = 7;
const STEM_STRIDE: usize = 2;
const ENTRY_FILTERS: usize = 32;
const KERNEL_SIZE: usize = 3;
const POOL_SIZE: usize = 2;

#[derive(Config, Debug)]
pub struct ResNet4NetworkConfig {
    input_channels: usize,
    input_height: usize,
    input_width: usize,
    num_classes: usize,
    #[config(default = 1.0e-4)]
    weight_decay: f64,
    #[config(default = "WeightInitialization::GlorotUniform")]
    initialization: WeightInitialization,
}

impl ResNet4NetworkConfig {
    /// Shape of the feature map reaching the classification head.
    pub fn feature_shape(&self) -> Result<FeatureShape, ArchitectureError> {
        let mut shape = FeatureShape::new(self.input_channels, self.input_height, self.input_width)
            .convolved(STEM_FILTERS, STEM_STRIDE)
            .convolved(ENTRY_FILTERS, 1);
        for (stage, (filters, _)) in RES_NET_4_STAGES.iter().enumerate() {
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

    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<ResNet4Network<B>, ArchitectureError> {
        let features = self.feature_shape()?;

        let stem = ConvBlock::new(
            [self.input_channels, STEM_FILTERS],
            STEM_KERNEL_SIZE,
            STEM_STRIDE,
            self.initialization,
            device,
        );
        let entry = ConvBlock::new(
            [STEM_FILTERS, ENTRY_FILTERS],
            KERNEL_SIZE,
            1,
            self.initialization,
            device,
        );

        let mut in_channels = ENTRY_FILTERS;
        let mut stages = Vec::with_capacity(RES_NET_4_STAGES.len());
        for (filters, blocks) in RES_NET_4_STAGES {
            let mut stage = Vec::with_capacity(blocks);
            for _ in 0..blocks {
                stage.push(ResidualBlock::new(
                    [in_channels, filters],
                    KERNEL_SIZE,
                    self.initialization,
                    device,
                ));
                in_channels = filters;
            }
            stages.push(ResidualStage { blocks: stage });
        }

        Ok(ResNet4Network {
            stem,
            entry,
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
pub struct ResidualStage<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> ResidualStage<B> {
    pub fn blocks(&self) -> &[ResidualBlock<B>] {
        &self.blocks
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |x, block| block.forward(x))
    }
}

/// A strided stem followed by residual stages. Stages only change the width, the spatial
/// size is reduced by the pooling layers between them.
#[derive(Module, Debug)]
pub struct ResNet4Network<B: Backend> {
    stem: ConvBlock<B>,
    entry: ConvBlock<B>,
    stages: Vec<ResidualStage<B>>,
    max_pool: MaxPool2d,
    avg_pool: AvgPool2d,
    head: ClassificationHead<B>,
    weight_decay: f64,
}

impl<B: Backend> ResNet4Network<B> {
    pub fn stages(&self) -> &[ResidualStage<B>] {
        &self.stages
    }

    pub fn residual_blocks(&self) -> impl Iterator<Item = &ResidualBlock<B>> {
        self.stages.iter().flat_map(|stage| stage.blocks.iter())
    }
}

impl<B: Backend> Classifier<B> for ResNet4Network<B> {
    fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(images);
        let mut x = self.entry.forward(x);

        let last = self.stages.len() - 1;
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
        let penalty = self.stem.l2_penalty() + self.entry.l2_penalty() + self.head.l2_penalty();
        self.residual_blocks()
            .fold(penalty, |penalty, block| penalty + block.l2_penalty())
    }

    fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    fn describe(&self, builder: &mut SummaryBuilder, input: FeatureShape) {
        let shape = self.stem.describe(builder, input);
        let mut shape = self.entry.describe(builder, shape);

        let last = self.stages.len() - 1;
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

impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for ResNet4Network<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for ResNet4Network<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch)
    }
}

/// The residual network with projection shortcuts on every widening stage.
#[derive(Clone, Debug)]
pub struct ResNet4Configuration {
    settings: TrainingSettings,
}

impl ResNet4Configuration {
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

    pub fn network_config(&self) -> ResNet4NetworkConfig {
        let data_shape = self.settings.data_shape;
        ResNet4NetworkConfig::new(
            data_shape.channels,
            data_shape.height,
            data_shape.width,
            self.settings.number_of_classes,
        )
        .with_weight_decay(self.settings.weight_decay)
        .with_initialization(self.settings.initialization)
    }
}

impl TrainingConfiguration for ResNet4Configuration {
    type Network<B: Backend> = ResNet4Network<B>;

    fn name(&self) -> &'static str {
        "res_net_4"
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
    use burn::tensor::Distribution;

    use poscls_core::settings::OptimizerKind;
    use poscls_core::summary::ActivationKind;

    use super::*;
    use crate::tests::TestBackend;

    #[test]
    fn name_and_localization_are_fixed() {
        let configuration = ResNet4Configuration::new(96, 96, 32);
        assert_eq!(configuration.name(), "res_net_4");
        assert!(!configuration.performs_localization());
    }

    #[test]
    fn output_shape_matches_the_class_count() {
        let device = Default::default();
        let classifier = ResNet4Configuration::new(64, 64, 5)
            .classifier::<TestBackend>(&device)
            .expect("64x64 input is large enough");

        let images = Tensor::<TestBackend, 4>::random([1, 3, 64, 64], Distribution::Default, &device);
        let [_, classes] = classifier.predict(images).dims();
        assert_eq!(classes, 5);

        let output = classifier.summary().output_layer().expect("summary has layers");
        assert_eq!(output.output_shape, vec![5]);
        assert_eq!(output.kind, LayerKind::Dense(ActivationKind::Softmax));
    }

    #[test]
    fn shortcuts_project_exactly_when_width_changes() {
        let device = Default::default();
        let network = ResNet4Configuration::new(64, 64, 3)
            .network::<TestBackend>(&device)
            .expect("valid input");

        for block in network.residual_blocks() {
            let [in_channels, out_channels] = block.channels();
            assert_eq!(block.has_projection(), in_channels != out_channels);
        }

        let projections: Vec<bool> = network
            .stages()
            .iter()
            .map(|stage| stage.blocks()[0].has_projection())
            .collect();
        assert_eq!(projections, vec![false, true, true, true, true]);
        assert_eq!(network.residual_blocks().filter(|b| b.has_projection()).count(), 4);
    }

    #[test]
    fn summary_records_every_residual_addition() {
        let device = Default::default();
        let classifier = ResNet4Configuration::new(96, 96, 32)
            .classifier::<TestBackend>(&device)
            .expect("valid input");
        let summary = classifier.summary();

        assert_eq!(summary.layers_of(LayerKind::Add).count(), 12);
        assert_eq!(summary.layers_of(LayerKind::MaxPool2d).count(), 4);
        assert_eq!(summary.layers_of(LayerKind::AvgPool2d).count(), 1);
        // stem and entry, two per block and one per projection
        assert_eq!(summary.layers_of(LayerKind::Conv2d).count(), 2 + 12 * 2 + 4);

        let stem = summary.layer("conv2d_1").expect("stem convolution");
        assert_eq!(stem.output_shape, vec![64, 48, 48]);
        // 96 -> 48 -> 24, 12, 6, 3 -> 1
        let flatten = summary.layer("flatten_1").expect("flatten layer");
        assert_eq!(flatten.output_shape, vec![512]);
        assert_eq!(summary.total_params(), classifier.network().num_params());
    }

    #[test]
    fn rebuilding_yields_the_same_architecture() {
        let device = Default::default();
        let configuration = ResNet4Configuration::new(64, 64, 4);
        let first = configuration
            .classifier::<TestBackend>(&device)
            .expect("valid input");
        let second = configuration
            .classifier::<TestBackend>(&device)
            .expect("valid input");
        assert_eq!(first.summary(), second.summary());
        assert_eq!(
            first.network().num_params(),
            second.network().num_params()
        );
    }

    #[test]
    fn inputs_pooled_away_are_rejected() {
        let device = Default::default();
        let result = ResNet4Configuration::new(48, 48, 4).classifier::<TestBackend>(&device);
        assert!(matches!(
            result,
            Err(ArchitectureError::FeatureMapCollapsed { .. })
        ));
    }

    #[test]
    fn invalid_settings_are_reported_before_building() {
        let device = Default::default();
        let settings = TrainingSettings::builder()
            .data_shape(DataShape::rgb(64, 64))
            .number_of_classes(0)
            .optimizer(OptimizerKind::Adam)
            .build();
        let result = ResNet4Configuration::with_settings(settings).classifier::<TestBackend>(&device);
        assert!(matches!(result, Err(ArchitectureError::Settings(_))));
    }

    #[test]
    fn configuration_summary_names_the_network() {
        let summary = ResNet4Configuration::new(96, 96, 32).summary();
        assert!(summary.starts_with("Configuration: res_net_4"));
        assert!(summary.contains("SGD"));
        assert!(summary.contains("(96, 96, 3)"));
    }
}
