use std::fmt::Display;
use std::sync::Arc;

use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{
    AdaGradConfig, AdamConfig, AdamWConfig, Optimizer, RmsPropConfig, SgdConfig,
};
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::train::metric::store::{Aggregate, Direction, Split};
use burn::train::metric::{AccuracyMetric, LossMetric};
use burn::train::renderer::{MetricState, MetricsRenderer, TrainingProgress};
use burn::train::{
    ClassificationOutput, LearnerBuilder, MetricEarlyStoppingStrategy, StoppingCondition,
    TrainStep, ValidStep,
};
use log::{debug, info};

use poscls_core::settings::{OptimizerKind, TrainingSettings};

use crate::batch::{ImageBatch, ImageBatcher, ImageItem};
use crate::classifier::{Classifier, CompiledClassifier};

/// Optimizer settings resolved from the identifier of a training configuration.
#[derive(Clone)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    Adam(AdamConfig),
    AdamW(AdamWConfig),
    RmsProp(RmsPropConfig),
    AdaGrad(AdaGradConfig),
}

impl OptimizerConfig {
    pub fn kind(&self) -> OptimizerKind {
        match self {
            OptimizerConfig::Sgd(_) => OptimizerKind::Sgd,
            OptimizerConfig::Adam(_) => OptimizerKind::Adam,
            OptimizerConfig::AdamW(_) => OptimizerKind::AdamW,
            OptimizerConfig::RmsProp(_) => OptimizerKind::RmsProp,
            OptimizerConfig::AdaGrad(_) => OptimizerKind::AdaGrad,
        }
    }
}

impl From<OptimizerKind> for OptimizerConfig {
    fn from(kind: OptimizerKind) -> Self {
        match kind {
            OptimizerKind::Sgd => OptimizerConfig::Sgd(
                SgdConfig::new().with_momentum(Some(
                    MomentumConfig::new()
                        .with_momentum(0.9)
                        .with_dampening(0.0)
                        .with_nesterov(true),
                )),
            ),
            OptimizerKind::Adam => OptimizerConfig::Adam(AdamConfig::new().with_epsilon(1.0e-7)),
            OptimizerKind::AdamW => {
                OptimizerConfig::AdamW(AdamWConfig::new().with_epsilon(1.0e-7))
            }
            OptimizerKind::RmsProp => OptimizerConfig::RmsProp(
                RmsPropConfig::new().with_alpha(0.9).with_epsilon(1.0e-7),
            ),
            OptimizerKind::AdaGrad => {
                OptimizerConfig::AdaGrad(AdaGradConfig::new().with_epsilon(1.0e-7))
            }
        }
    }
}

/// Reports training progress through the log instead of a terminal dashboard.
pub(crate) struct LogRenderer {
    name: String,
}

impl MetricsRenderer for LogRenderer {
    fn update_train(&mut self, _state: MetricState) {}

    fn update_valid(&mut self, _state: MetricState) {}

    fn render_train(&mut self, item: TrainingProgress) {
        debug!(
            "{}: training epoch {}/{}, iteration {}",
            self.name, item.epoch, item.epoch_total, item.iteration
        );
    }

    fn render_valid(&mut self, item: TrainingProgress) {
        debug!(
            "{}: validating epoch {}/{}, iteration {}",
            self.name, item.epoch, item.epoch_total, item.iteration
        );
    }
}

pub type TrainLoader<B> = Arc<dyn DataLoader<ImageBatch<B>>>;
pub type ValidLoader<B> = Arc<dyn DataLoader<ImageBatch<<B as AutodiffBackend>::InnerBackend>>>;

const SHUFFLE_SEED: u64 = 42;

impl<B: AutodiffBackend, M: Classifier<B>> CompiledClassifier<B, M> {
    /// Shuffled loaders yielding minibatches of the configured size.
    pub fn data_loaders<T, V>(&self, train: T, valid: V) -> (TrainLoader<B>, ValidLoader<B>)
    where
        T: Dataset<ImageItem> + 'static,
        V: Dataset<ImageItem> + 'static,
    {
        let batch_size = self.settings.training_minibatch_size;
        let data_shape = self.settings.data_shape;
        let batcher_train = ImageBatcher::<B>::new(self.device.clone(), data_shape);
        let batcher_valid = ImageBatcher::<B::InnerBackend>::new(self.device.clone(), data_shape);

        let train_loader = DataLoaderBuilder::new(batcher_train)
            .batch_size(batch_size)
            .shuffle(SHUFFLE_SEED)
            .build(train);
        let valid_loader = DataLoaderBuilder::new(batcher_valid)
            .batch_size(batch_size)
            .shuffle(SHUFFLE_SEED)
            .build(valid);

        debug!(
            "{}: {} training and {} validation items in batches of {}",
            self.name,
            train_loader.num_items(),
            valid_loader.num_items(),
            batch_size
        );
        (train_loader, valid_loader)
    }
}

impl<B, M> CompiledClassifier<B, M>
where
    B: AutodiffBackend,
    M: Classifier<B>
        + AutodiffModule<B>
        + TrainStep<ImageBatch<B>, ClassificationOutput<B>>
        + Display
        + 'static,
    M::InnerModule: ValidStep<ImageBatch<B::InnerBackend>, ClassificationOutput<B::InnerBackend>>,
{
    /// Trains the network with the configured optimizer, stopping early once the validation
    /// loss stops improving. Checkpoints and metric logs are written to `artifact_dir`.
    pub fn fit(
        self,
        artifact_dir: &str,
        train_loader: TrainLoader<B>,
        valid_loader: ValidLoader<B>,
    ) -> Self {
        let optimizer = OptimizerConfig::from(self.settings.optimizer);
        info!(
            "Training {} for at most {} epochs with {} on {} training items",
            self.name,
            self.settings.number_of_epochs,
            optimizer.kind(),
            train_loader.num_items()
        );

        let network = match optimizer {
            OptimizerConfig::Sgd(config) => {
                self.fit_with(artifact_dir, config.init::<B, M>(), train_loader, valid_loader)
            }
            OptimizerConfig::Adam(config) => {
                self.fit_with(artifact_dir, config.init::<B, M>(), train_loader, valid_loader)
            }
            OptimizerConfig::AdamW(config) => {
                self.fit_with(artifact_dir, config.init::<B, M>(), train_loader, valid_loader)
            }
            OptimizerConfig::RmsProp(config) => {
                self.fit_with(artifact_dir, config.init::<B, M>(), train_loader, valid_loader)
            }
            OptimizerConfig::AdaGrad(config) => {
                self.fit_with(artifact_dir, config.init::<B, M>(), train_loader, valid_loader)
            }
        };

        Self { network, ..self }
    }

    fn fit_with<O>(
        &self,
        artifact_dir: &str,
        optimizer: O,
        train_loader: TrainLoader<B>,
        valid_loader: ValidLoader<B>,
    ) -> M
    where
        O: Optimizer<M, B> + 'static,
    {
        let settings: &TrainingSettings = &self.settings;
        let learner = LearnerBuilder::new(artifact_dir)
            .metric_train_numeric(AccuracyMetric::new())
            .metric_valid_numeric(AccuracyMetric::new())
            .metric_train_numeric(LossMetric::new())
            .metric_valid_numeric(LossMetric::new())
            .with_file_checkpointer(CompactRecorder::new())
            .early_stopping(MetricEarlyStoppingStrategy::new::<LossMetric<B>>(
                Aggregate::Mean,
                Direction::Lowest,
                Split::Valid,
                StoppingCondition::NoImprovementSince {
                    n_epochs: settings.number_of_epochs_before_early_stopping,
                },
            ))
            .devices(vec![self.device.clone()])
            .num_epochs(settings.number_of_epochs)
            .renderer(LogRenderer {
                name: self.name.to_string(),
            })
            .build(self.network.clone(), optimizer, settings.learning_rate);

        learner.fit(train_loader, valid_loader)
    }
}
