use burn::prelude::Backend;
use log::info;

use poscls_core::error::ArchitectureError;
use poscls_core::settings::TrainingSettings;

use crate::classifier::{Classifier, CompiledClassifier};

/// Shared behaviour of every network configuration. A configuration knows its name, the
/// settings used to train it and how to assemble its network for a backend.
pub trait TrainingConfiguration {
    type Network<B: Backend>: Classifier<B>;

    /// Identifier used for reports and output files.
    fn name(&self) -> &'static str;

    /// Whether the network regresses bounding boxes in addition to classifying.
    fn performs_localization(&self) -> bool;

    fn settings(&self) -> &TrainingSettings;

    fn network<B: Backend>(&self, device: &B::Device)
        -> Result<Self::Network<B>, ArchitectureError>;

    fn summary(&self) -> String {
        format!("Configuration: {}\n{}", self.name(), self.settings().summary())
    }

    /// Assembles the network and binds it to its loss, metrics and optimizer settings.
    fn classifier<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<CompiledClassifier<B, Self::Network<B>>, ArchitectureError> {
        self.settings().validate()?;
        let network = self.network::<B>(device)?;
        let classifier =
            CompiledClassifier::new(self.name(), network, self.settings().clone(), device.clone());
        info!(
            "Built the {} classifier with {} parameters for {} classes",
            self.name(),
            classifier.summary().total_params(),
            self.settings().number_of_classes
        );
        Ok(classifier)
    }
}
