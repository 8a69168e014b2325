use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use poscls_core::settings::{DataShape, TrainingOverrides, TrainingSettings};
use poscls_output::logger::LogSettings;

#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum NetworkKind {
    #[serde(rename = "vgg4")]
    Vgg4,
    #[serde(rename = "res_net_4")]
    ResNet4,
}

impl Display for NetworkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkKind::Vgg4 => write!(f, "vgg4"),
            NetworkKind::ResNet4 => write!(f, "res_net_4"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClassifierSettings {
    pub configuration: NetworkKind,
    pub width: usize,
    pub height: usize,
    pub number_of_classes: usize,
    pub training: Option<TrainingOverrides>,
}

impl ClassifierSettings {
    pub fn training_settings(&self) -> TrainingSettings {
        let settings = TrainingSettings::builder()
            .data_shape(DataShape::rgb(self.width, self.height))
            .number_of_classes(self.number_of_classes)
            .build();
        match &self.training {
            Some(overrides) => overrides.apply(settings),
            None => settings,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct OutputSettings {
    pub output_path: String,
    /// Font for the diagram labels, a system font is used when left out.
    pub diagram_font: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct BaseConfig {
    pub(crate) log_settings: LogSettings,
    pub(crate) output_settings: OutputSettings,
    pub(crate) classifiers: Vec<ClassifierSettings>,
}

pub struct BaseConfigReader {
    file_path: PathBuf,
}

impl BaseConfigReader {
    pub fn new(file_path: &Path) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
        }
    }

    pub(crate) fn parse(&self) -> anyhow::Result<BaseConfig> {
        let content = std::fs::read_to_string(&self.file_path)
            .with_context(|| format!("failed to read {}", self.file_path.display()))?;
        let config: BaseConfig = toml::from_str(&content)
            .with_context(|| format!("invalid configuration in {}", self.file_path.display()))?;
        Ok(config)
    }
}
