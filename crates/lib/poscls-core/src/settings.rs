use std::fmt::{Display, Formatter};
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::SettingsError;
use crate::shape::FeatureShape;

/// Shape of the input images, stored as height, width and colour channels.
#[derive(Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl DataShape {
    pub fn rgb(width: usize, height: usize) -> Self {
        Self {
            height,
            width,
            channels: 3,
        }
    }

    pub fn as_feature_shape(&self) -> FeatureShape {
        FeatureShape::new(self.channels, self.height, self.width)
    }

    /// Number of bytes of one image with interleaved channels.
    pub fn num_values(&self) -> usize {
        self.height * self.width * self.channels
    }
}

impl Display for DataShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.height, self.width, self.channels)
    }
}

/// Optimizers a configuration can be compiled with.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    /// Stochastic gradient descent with Nesterov momentum of 0.9.
    #[default]
    Sgd,
    Adam,
    AdamW,
    RmsProp,
    AdaGrad,
}

impl FromStr for OptimizerKind {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            "adagrad" => Ok(OptimizerKind::AdaGrad),
            _ => Err(SettingsError::UnknownOptimizer(s.to_string())),
        }
    }
}

impl TryFrom<String> for OptimizerKind {
    type Error = SettingsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OptimizerKind> for String {
    fn from(value: OptimizerKind) -> Self {
        value.to_string()
    }
}

impl Display for OptimizerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "SGD"),
            OptimizerKind::Adam => write!(f, "Adam"),
            OptimizerKind::AdamW => write!(f, "AdamW"),
            OptimizerKind::RmsProp => write!(f, "RMSProp"),
            OptimizerKind::AdaGrad => write!(f, "Adagrad"),
        }
    }
}

/// Initialization scheme for convolution and dense kernels.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum WeightInitialization {
    #[default]
    GlorotUniform,
    GlorotNormal,
    HeUniform,
    HeNormal,
}

impl FromStr for WeightInitialization {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "glorot_uniform" => Ok(WeightInitialization::GlorotUniform),
            "glorot_normal" => Ok(WeightInitialization::GlorotNormal),
            "he_uniform" => Ok(WeightInitialization::HeUniform),
            "he_normal" => Ok(WeightInitialization::HeNormal),
            _ => Err(SettingsError::UnknownInitialization(s.to_string())),
        }
    }
}

impl TryFrom<String> for WeightInitialization {
    type Error = SettingsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WeightInitialization> for String {
    fn from(value: WeightInitialization) -> Self {
        value.to_string()
    }
}

impl Display for WeightInitialization {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightInitialization::GlorotUniform => write!(f, "glorot_uniform"),
            WeightInitialization::GlorotNormal => write!(f, "glorot_normal"),
            WeightInitialization::HeUniform => write!(f, "he_uniform"),
            WeightInitialization::HeNormal => write!(f, "he_normal"),
        }
    }
}

/// Everything a network configuration needs to assemble and train its classifier.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct TrainingSettings {
    pub data_shape: DataShape,
    pub number_of_classes: usize,
    #[builder(default = 200)]
    pub number_of_epochs: usize,
    #[builder(default = 20)]
    pub number_of_epochs_before_early_stopping: usize,
    #[builder(default = 8)]
    pub number_of_epochs_before_reducing_learning_rate: usize,
    #[builder(default = 64)]
    pub training_minibatch_size: usize,
    #[builder(default)]
    pub initialization: WeightInitialization,
    #[builder(default = 0.01)]
    pub learning_rate: f64,
    #[builder(default = 0.5)]
    pub learning_rate_reduction_factor: f64,
    #[builder(default = 1.0e-5)]
    pub minimum_learning_rate: f64,
    #[builder(default = 1.0e-4)]
    pub weight_decay: f64,
    #[builder(default)]
    pub optimizer: OptimizerKind,
}

impl TrainingSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.number_of_classes == 0 {
            return Err(SettingsError::NoClasses);
        }
        if self.data_shape.height == 0 || self.data_shape.width == 0 {
            return Err(SettingsError::EmptyInput {
                height: self.data_shape.height,
                width: self.data_shape.width,
            });
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(SettingsError::InvalidWeightDecay(self.weight_decay));
        }
        Ok(())
    }

    /// Human readable description of the training parameters.
    pub fn summary(&self) -> String {
        format!(
            "Training for {} epochs with {} at an initial learning rate of {} and weight decay of {}.\n\
             Initialization: {}, minibatch size: {}, early stopping after {} epochs without improvement.\n\
             Data shape: {}, learning rate reduced by a factor of {} after {} epochs without improvement, \
             down to at least {}.",
            self.number_of_epochs,
            self.optimizer,
            self.learning_rate,
            self.weight_decay,
            self.initialization,
            self.training_minibatch_size,
            self.number_of_epochs_before_early_stopping,
            self.data_shape,
            self.learning_rate_reduction_factor,
            self.number_of_epochs_before_reducing_learning_rate,
            self.minimum_learning_rate,
        )
    }
}

/// Optional overrides read from a configuration file. Every field left out keeps the
/// default of [`TrainingSettings`].
#[derive(Deserialize, Clone, Debug, Default)]
pub struct TrainingOverrides {
    pub number_of_epochs: Option<usize>,
    pub number_of_epochs_before_early_stopping: Option<usize>,
    pub number_of_epochs_before_reducing_learning_rate: Option<usize>,
    pub training_minibatch_size: Option<usize>,
    pub initialization: Option<WeightInitialization>,
    pub learning_rate: Option<f64>,
    pub learning_rate_reduction_factor: Option<f64>,
    pub minimum_learning_rate: Option<f64>,
    pub weight_decay: Option<f64>,
    pub optimizer: Option<OptimizerKind>,
}

impl TrainingOverrides {
    pub fn apply(&self, mut settings: TrainingSettings) -> TrainingSettings {
        if let Some(number_of_epochs) = self.number_of_epochs {
            settings.number_of_epochs = number_of_epochs;
        }
        if let Some(patience) = self.number_of_epochs_before_early_stopping {
            settings.number_of_epochs_before_early_stopping = patience;
        }
        if let Some(patience) = self.number_of_epochs_before_reducing_learning_rate {
            settings.number_of_epochs_before_reducing_learning_rate = patience;
        }
        if let Some(batch_size) = self.training_minibatch_size {
            settings.training_minibatch_size = batch_size;
        }
        if let Some(initialization) = self.initialization {
            settings.initialization = initialization;
        }
        if let Some(learning_rate) = self.learning_rate {
            settings.learning_rate = learning_rate;
        }
        if let Some(factor) = self.learning_rate_reduction_factor {
            settings.learning_rate_reduction_factor = factor;
        }
        if let Some(minimum) = self.minimum_learning_rate {
            settings.minimum_learning_rate = minimum;
        }
        if let Some(weight_decay) = self.weight_decay {
            settings.weight_decay = weight_decay;
        }
        if let Some(optimizer) = self.optimizer {
            settings.optimizer = optimizer;
        }
        debug!("Training settings after overrides: {:?}", settings);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_settings() -> TrainingSettings {
        TrainingSettings::builder()
            .data_shape(DataShape::rgb(96, 64))
            .number_of_classes(32)
            .build()
    }

    #[test]
    fn defaults_follow_the_base_configuration() {
        let settings = default_settings();
        assert_eq!(settings.data_shape.height, 64);
        assert_eq!(settings.data_shape.width, 96);
        assert_eq!(settings.data_shape.channels, 3);
        assert_eq!(settings.data_shape.num_values(), 64 * 96 * 3);
        assert_eq!(settings.optimizer, OptimizerKind::Sgd);
        assert_eq!(settings.weight_decay, 1.0e-4);
        assert_eq!(settings.training_minibatch_size, 64);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn optimizer_names_are_case_insensitive() {
        assert_eq!("SGD".parse::<OptimizerKind>(), Ok(OptimizerKind::Sgd));
        assert_eq!("adam".parse::<OptimizerKind>(), Ok(OptimizerKind::Adam));
        assert_eq!("RMSProp".parse::<OptimizerKind>(), Ok(OptimizerKind::RmsProp));
        assert_eq!(
            "Adadelta".parse::<OptimizerKind>(),
            Err(SettingsError::UnknownOptimizer("Adadelta".to_string()))
        );
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let overrides: TrainingOverrides = toml::from_str(
            r#"
            optimizer = "Adam"
            weight_decay = 0.0005
            initialization = "he_normal"
            "#,
        )
        .expect("overrides should parse");
        let settings = overrides.apply(default_settings());
        assert_eq!(settings.optimizer, OptimizerKind::Adam);
        assert_eq!(settings.weight_decay, 0.0005);
        assert_eq!(settings.initialization, WeightInitialization::HeNormal);
        assert_eq!(settings.number_of_epochs, 200);
    }

    #[test]
    fn unknown_optimizer_fails_to_deserialize() {
        let overrides = toml::from_str::<TrainingOverrides>(r#"optimizer = "Adadelta""#);
        assert!(overrides.is_err());
    }

    #[test]
    fn validation_rejects_degenerate_settings() {
        let mut settings = default_settings();
        settings.number_of_classes = 0;
        assert_eq!(settings.validate(), Err(SettingsError::NoClasses));

        let mut settings = default_settings();
        settings.data_shape = DataShape::rgb(0, 10);
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::EmptyInput { .. })
        ));

        let mut settings = default_settings();
        settings.weight_decay = -1.0;
        assert!(settings.validate().is_err());
    }
}
