use std::fmt::{Display, Formatter};

use hashbrown::HashMap;
use itertools::Itertools;

use crate::shape::FeatureShape;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    Linear,
    Relu,
    Softmax,
}

impl Display for ActivationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivationKind::Linear => write!(f, "linear"),
            ActivationKind::Relu => write!(f, "relu"),
            ActivationKind::Softmax => write!(f, "softmax"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Input,
    Conv2d,
    BatchNorm,
    Activation(ActivationKind),
    MaxPool2d,
    AvgPool2d,
    Add,
    Flatten,
    Dense(ActivationKind),
}

impl LayerKind {
    /// Prefix used to generate layer names, `conv2d_3` for the third convolution.
    pub fn prefix(&self) -> &'static str {
        match self {
            LayerKind::Input => "input",
            LayerKind::Conv2d => "conv2d",
            LayerKind::BatchNorm => "batch_normalization",
            LayerKind::Activation(_) => "activation",
            LayerKind::MaxPool2d => "max_pooling2d",
            LayerKind::AvgPool2d => "average_pooling2d",
            LayerKind::Add => "add",
            LayerKind::Flatten => "flatten",
            LayerKind::Dense(_) => "dense",
        }
    }
}

impl Display for LayerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerKind::Input => write!(f, "InputLayer"),
            LayerKind::Conv2d => write!(f, "Conv2D"),
            LayerKind::BatchNorm => write!(f, "BatchNormalization"),
            LayerKind::Activation(activation) => write!(f, "Activation[{}]", activation),
            LayerKind::MaxPool2d => write!(f, "MaxPooling2D"),
            LayerKind::AvgPool2d => write!(f, "AveragePooling2D"),
            LayerKind::Add => write!(f, "Add"),
            LayerKind::Flatten => write!(f, "Flatten"),
            LayerKind::Dense(activation) => write!(f, "Dense[{}]", activation),
        }
    }
}

/// One node of the layer graph as reported to users.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerSummary {
    pub name: String,
    pub kind: LayerKind,
    /// Output shape without the batch dimension.
    pub output_shape: Vec<usize>,
    pub params: usize,
    /// Names of the layers feeding this one.
    pub inputs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSummary {
    pub model_name: String,
    pub layers: Vec<LayerSummary>,
}

impl ModelSummary {
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn total_params(&self) -> usize {
        self.layers.iter().map(|layer| layer.params).sum()
    }

    pub fn output_layer(&self) -> Option<&LayerSummary> {
        self.layers.last()
    }

    pub fn layer(&self, name: &str) -> Option<&LayerSummary> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    pub fn layers_of(&self, kind: LayerKind) -> impl Iterator<Item = &LayerSummary> {
        self.layers.iter().filter(move |layer| layer.kind == kind)
    }
}

impl Display for ModelSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let rule = "=".repeat(112);
        writeln!(f, "Model: \"{}\"", self.model_name)?;
        writeln!(f, "{}", rule)?;
        writeln!(
            f,
            "{:<40}{:<24}{:>12}    {}",
            "Layer (type)", "Output Shape", "Param #", "Connected to"
        )?;
        writeln!(f, "{}", rule)?;
        for layer in self.layers.iter() {
            let name = format!("{} ({})", layer.name, layer.kind);
            let shape = format!("(-, {})", layer.output_shape.iter().join(", "));
            writeln!(
                f,
                "{:<40}{:<24}{:>12}    {}",
                name,
                shape,
                layer.params,
                layer.inputs.iter().join(", ")
            )?;
        }
        writeln!(f, "{}", rule)?;
        write!(f, "Total params: {}", self.total_params())
    }
}

/// Records layers in graph order while a network describes itself. Every pushed layer
/// becomes the input of the next one unless the inputs are given explicitly.
pub struct SummaryBuilder {
    model_name: String,
    layers: Vec<LayerSummary>,
    counters: HashMap<&'static str, usize>,
}

impl SummaryBuilder {
    pub fn new(model_name: &str, input: FeatureShape) -> Self {
        let mut builder = Self {
            model_name: model_name.to_string(),
            layers: Vec::new(),
            counters: HashMap::new(),
        };
        builder.push_from(LayerKind::Input, input.dims(), 0, Vec::new());
        builder
    }

    /// Name of the most recently recorded layer.
    pub fn head(&self) -> String {
        self.layers
            .last()
            .map(|layer| layer.name.clone())
            .unwrap_or_default()
    }

    pub fn push(&mut self, kind: LayerKind, output_shape: Vec<usize>, params: usize) -> String {
        let inputs = vec![self.head()];
        self.push_from(kind, output_shape, params, inputs)
    }

    pub fn push_from(
        &mut self,
        kind: LayerKind,
        output_shape: Vec<usize>,
        params: usize,
        inputs: Vec<String>,
    ) -> String {
        let counter = self.counters.entry(kind.prefix()).or_insert(0);
        *counter += 1;
        let name = format!("{}_{}", kind.prefix(), counter);
        self.record(name, kind, output_shape, params, inputs)
    }

    pub fn push_named(
        &mut self,
        name: &str,
        kind: LayerKind,
        output_shape: Vec<usize>,
        params: usize,
    ) -> String {
        let inputs = vec![self.head()];
        self.record(name.to_string(), kind, output_shape, params, inputs)
    }

    fn record(
        &mut self,
        name: String,
        kind: LayerKind,
        output_shape: Vec<usize>,
        params: usize,
        inputs: Vec<String>,
    ) -> String {
        self.layers.push(LayerSummary {
            name: name.clone(),
            kind,
            output_shape,
            params,
            inputs,
        });
        name
    }

    pub fn build(self) -> ModelSummary {
        ModelSummary {
            model_name: self.model_name,
            layers: self.layers,
        }
    }
}
