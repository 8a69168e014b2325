use std::fmt::{Display, Formatter};

/// Shape of a feature map flowing through a convolutional network, in channel-first order.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FeatureShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Display for FeatureShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

impl FeatureShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Shape after a same-padded convolution with the given number of filters.
    pub fn convolved(self, filters: usize, stride: usize) -> Self {
        Self {
            channels: filters,
            height: self.height.div_ceil(stride),
            width: self.width.div_ceil(stride),
        }
    }

    /// Shape after a valid pooling window where the stride equals the window.
    pub fn pooled(self, window: usize) -> Self {
        Self {
            channels: self.channels,
            height: self.height / window,
            width: self.width / window,
        }
    }

    pub fn flattened(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_collapsed(&self) -> bool {
        self.height == 0 || self.width == 0
    }

    pub fn dims(&self) -> Vec<usize> {
        vec![self.channels, self.height, self.width]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_rounds_up_on_stride() {
        let shape = FeatureShape::new(3, 95, 96).convolved(64, 2);
        assert_eq!(shape, FeatureShape::new(64, 48, 48));
        assert_eq!(shape.convolved(32, 1), FeatureShape::new(32, 48, 48));
    }

    #[test]
    fn pooling_floors_and_can_collapse() {
        let shape = FeatureShape::new(512, 3, 3).pooled(2);
        assert_eq!(shape, FeatureShape::new(512, 1, 1));
        assert_eq!(shape.flattened(), 512);
        assert!(shape.pooled(2).is_collapsed());
    }
}
