use burn::data::dataloader::batcher::Batcher;
use burn::prelude::Backend;
use burn::tensor::{ElementConversion, Int, Shape, Tensor, TensorData};
use typed_builder::TypedBuilder;

use poscls_core::error::SettingsError;
use poscls_core::settings::DataShape;

/// An image stored row by row with interleaved channels, as decoded from disk.
#[derive(Clone, Debug)]
pub struct ImageItem {
    pixels: Vec<u8>,
    label: usize,
}

impl ImageItem {
    /// Checks that the pixels fill an image of `data_shape` exactly.
    pub fn new(pixels: Vec<u8>, label: usize, data_shape: &DataShape) -> Result<Self, SettingsError> {
        let expected = data_shape.num_values();
        if pixels.len() != expected {
            return Err(SettingsError::PixelCountMismatch {
                shape: *data_shape,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self { pixels, label })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn label(&self) -> usize {
        self.label
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// Stacks image items into channel-first tensors scaled to `[0, 1]`.
#[derive(Clone, TypedBuilder)]
pub struct ImageBatcher<B: Backend> {
    device: B::Device,
    data_shape: DataShape,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, data_shape: DataShape) -> Self {
        Self { device, data_shape }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let DataShape {
            height,
            width,
            channels,
        } = self.data_shape;

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    TensorData::from([(item.label as i64).elem::<B::IntElem>()]),
                    &self.device,
                )
            })
            .collect();

        let images = items
            .into_iter()
            .map(|item| TensorData::new(item.pixels, Shape::new([height, width, channels])))
            .map(|data| {
                Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), &self.device)
                    .permute([2, 0, 1])
            })
            .map(|tensor| tensor / 255)
            .collect();

        let images = Tensor::stack(images, 0);
        let targets = Tensor::cat(targets, 0);

        ImageBatch { images, targets }
    }
}
