use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::Backend;
use burn::record::{CompactRecorder, RecorderError};
use burn::tensor::activation::softmax;
use burn::tensor::Tensor;
use burn::train::ClassificationOutput;
use log::debug;

use poscls_core::settings::TrainingSettings;
use poscls_core::shape::FeatureShape;
use poscls_core::summary::{ModelSummary, SummaryBuilder};

use crate::batch::ImageBatch;

/// A network that maps a batch of images to class scores.
pub trait Classifier<B: Backend>: Module<B> {
    /// Class scores before the softmax of the classification head.
    fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Sum of the squared kernels of every regularized layer.
    fn l2_penalty(&self) -> Tensor<B, 1>;

    fn weight_decay(&self) -> f64;

    /// Records every layer of the network, starting from an input of the given shape.
    fn describe(&self, builder: &mut SummaryBuilder, input: FeatureShape);

    /// Class probabilities, each row sums to one.
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward_logits(images), 1)
    }

    /// Categorical cross entropy plus the weight decay penalty of the kernels.
    fn forward_classification(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        let targets = batch.targets;
        let output = self.forward_logits(batch.images);
        let cross_entropy = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());
        let loss = cross_entropy + self.l2_penalty().mul_scalar(self.weight_decay());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// A network bound to the settings it was built with, ready to be trained, queried or saved.
pub struct CompiledClassifier<B: Backend, M: Classifier<B>> {
    pub(crate) name: &'static str,
    pub(crate) network: M,
    pub(crate) settings: TrainingSettings,
    pub(crate) summary: ModelSummary,
    pub(crate) device: B::Device,
}

impl<B: Backend, M: Classifier<B>> CompiledClassifier<B, M> {
    pub fn new(
        name: &'static str,
        network: M,
        settings: TrainingSettings,
        device: B::Device,
    ) -> Self {
        let input = settings.data_shape.as_feature_shape();
        let mut builder = SummaryBuilder::new(name, input);
        network.describe(&mut builder, input);
        let summary = builder.build();
        debug!(
            "Compiled {} with {} layers and {} parameters",
            name,
            summary.layer_count(),
            summary.total_params()
        );

        Self {
            name,
            network,
            settings,
            summary,
            device,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn network(&self) -> &M {
        &self.network
    }

    pub fn into_network(self) -> M {
        self.network
    }

    pub fn settings(&self) -> &TrainingSettings {
        &self.settings
    }

    pub fn summary(&self) -> &ModelSummary {
        &self.summary
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.network.forward(images)
    }

    pub fn evaluate(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.network.forward_classification(batch)
    }

    /// Writes the weights to `path` with the compact recorder, which appends its own extension.
    pub fn save(&self, path: &Path) -> Result<(), RecorderError> {
        debug!("Saving {} weights to {}", self.name, path.display());
        self.network
            .clone()
            .save_file(PathBuf::from(path), &CompactRecorder::new())
    }

    pub fn load(self, path: &Path) -> Result<Self, RecorderError> {
        debug!("Loading {} weights from {}", self.name, path.display());
        let network = self.network.load_file(
            PathBuf::from(path),
            &CompactRecorder::new(),
            &self.device,
        )?;
        Ok(Self { network, ..self })
    }
}

#[cfg(test)]
mod tests {
    use burn::tensor::Distribution;

    use super::*;
    use crate::configuration::TrainingConfiguration;
    use crate::tests::TestBackend;
    use crate::vgg4::Vgg4Configuration;

    #[test]
    fn saved_weights_restore_the_predictions() {
        let dir = tempfile::tempdir().expect("temporary directory");
        let path = dir.path().join("vgg4");
        let device = Default::default();
        let configuration = Vgg4Configuration::new(32, 32, 5);

        let trained = configuration
            .classifier::<TestBackend>(&device)
            .expect("valid input");
        trained.save(&path).expect("weights are written");

        let restored = configuration
            .classifier::<TestBackend>(&device)
            .expect("valid input")
            .load(&path)
            .expect("weights are read");

        let images = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);
        trained
            .predict(images.clone())
            .into_data()
            .assert_approx_eq(&restored.predict(images).into_data(), 4);
    }

    #[test]
    fn loading_a_missing_file_fails() {
        let dir = tempfile::tempdir().expect("temporary directory");
        let device = Default::default();
        let classifier = Vgg4Configuration::new(32, 32, 5)
            .classifier::<TestBackend>(&device)
            .expect("valid input");
        assert!(classifier.load(&dir.path().join("missing")).is_err());
    }
}
