use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::Wgpu;
use burn::prelude::Backend;
use log::info;

use poscls_models::configuration::TrainingConfiguration;
use poscls_models::res_net_4::ResNet4Configuration;
use poscls_models::vgg4::Vgg4Configuration;
use poscls_output::diagram::{render_diagram, DiagramStyle};
use poscls_output::logger::initiate_logger;

use crate::config::{BaseConfig, BaseConfigReader, ClassifierSettings, NetworkKind};

pub type PosBackend = Wgpu<f32, i32>;

pub struct ClassifierBuilder {
    base_config: BaseConfig,
    config_path: PathBuf,
    default_device: WgpuDevice,
}

impl ClassifierBuilder {
    pub(crate) fn new(base_config_file: &str) -> anyhow::Result<Self> {
        let config_file = Path::new(base_config_file);
        let config_path = config_file
            .parent()
            .with_context(|| format!("invalid directory for {}", config_file.display()))?
            .to_path_buf();
        let base_config = BaseConfigReader::new(config_file).parse()?;
        Ok(Self {
            base_config,
            config_path,
            default_device: WgpuDevice::BestAvailable,
        })
    }

    /// Builds every configured classifier and returns the paths of the written diagrams.
    pub(crate) fn build(&self) -> anyhow::Result<Vec<PathBuf>> {
        let log_file = initiate_logger(&self.config_path, &self.base_config.log_settings)?;
        info!("Logging to {}", log_file.display());

        let output_path = self
            .config_path
            .join(&self.base_config.output_settings.output_path);
        info!(
            "Building {} classifiers into {}",
            self.base_config.classifiers.len(),
            output_path.display()
        );

        let style = self.diagram_style()?;
        self.base_config
            .classifiers
            .iter()
            .map(|classifier| self.build_classifier(classifier, &style, &output_path))
            .collect()
    }

    fn diagram_style(&self) -> anyhow::Result<DiagramStyle> {
        match &self.base_config.output_settings.diagram_font {
            Some(font) => Ok(DiagramStyle::with_font_path(&self.config_path.join(font))?),
            None => Ok(DiagramStyle::with_system_font()),
        }
    }

    fn build_classifier(
        &self,
        classifier: &ClassifierSettings,
        style: &DiagramStyle,
        output_path: &Path,
    ) -> anyhow::Result<PathBuf> {
        let settings = classifier.training_settings();
        match classifier.configuration {
            NetworkKind::Vgg4 => describe_classifier::<PosBackend, _>(
                &Vgg4Configuration::with_settings(settings),
                &self.default_device,
                style,
                output_path,
            ),
            NetworkKind::ResNet4 => describe_classifier::<PosBackend, _>(
                &ResNet4Configuration::with_settings(settings),
                &self.default_device,
                style,
                output_path,
            ),
        }
        .with_context(|| format!("failed to build the {} classifier", classifier.configuration))
    }
}

/// Compiles the classifier of a configuration, prints its summaries and draws its diagram
/// into `<output_path>/<name>.png`.
pub(crate) fn describe_classifier<B: Backend, C: TrainingConfiguration>(
    configuration: &C,
    device: &B::Device,
    style: &DiagramStyle,
    output_path: &Path,
) -> anyhow::Result<PathBuf> {
    let classifier = configuration.classifier::<B>(device)?;
    println!("{}", classifier.summary());
    println!("{}", configuration.summary());

    let diagram_file = output_path.join(format!("{}.png", configuration.name()));
    render_diagram(classifier.summary(), style, &diagram_file)?;
    Ok(diagram_file)
}
