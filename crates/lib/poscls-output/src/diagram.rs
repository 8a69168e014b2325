use std::fs;
use std::path::Path;

use ab_glyph::FontVec;
use hashbrown::HashMap;
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut,
};
use imageproc::rect::Rect;
use log::{debug, info};

use poscls_core::summary::{LayerKind, ModelSummary};

use crate::error::OutputError;

const MARGIN: u32 = 16;
const ROW_HEIGHT: u32 = 18;
const ROW_GAP: u32 = 6;
const MIN_BAR_WIDTH: u32 = 24;
const MAX_BAR_WIDTH: u32 = 320;
const PIXELS_PER_OCTAVE: f64 = 20.0;
const LANE_OFFSET: u32 = 8;
const LANE_WIDTH: u32 = 10;
const LANES: u32 = 2;
const LABEL_OFFSET: u32 = 12;
const LABEL_WIDTH: u32 = 360;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const CONNECTION: Rgb<u8> = Rgb([90, 90, 90]);
const TEXT: Rgb<u8> = Rgb([0, 0, 0]);

const SYSTEM_FONTS: [&str; 3] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

pub fn layer_colour(kind: LayerKind) -> Rgb<u8> {
    match kind {
        LayerKind::Input => Rgb([160, 160, 160]),
        LayerKind::Conv2d => Rgb([66, 133, 244]),
        LayerKind::BatchNorm => Rgb([251, 188, 5]),
        LayerKind::Activation(_) => Rgb([52, 168, 83]),
        LayerKind::MaxPool2d => Rgb([234, 67, 53]),
        LayerKind::AvgPool2d => Rgb([171, 71, 188]),
        LayerKind::Add => Rgb([0, 172, 193]),
        LayerKind::Flatten => Rgb([120, 144, 156]),
        LayerKind::Dense(_) => Rgb([255, 112, 67]),
    }
}

fn darker(colour: Rgb<u8>) -> Rgb<u8> {
    let Rgb([r, g, b]) = colour;
    Rgb([r / 2, g / 2, b / 2])
}

/// Bars grow with the logarithm of the channel count so that both the image and the
/// flattened features fit on one page.
fn bar_width(output_shape: &[usize]) -> u32 {
    let channels = output_shape.first().copied().unwrap_or(1).max(1) as f64;
    let width = MIN_BAR_WIDTH as f64 + channels.log2() * PIXELS_PER_OCTAVE;
    (width.round() as u32).min(MAX_BAR_WIDTH)
}

/// Font used for the layer labels. Without a font only the bars and connections are drawn.
pub struct DiagramStyle {
    pub font: Option<FontVec>,
    pub font_scale: f32,
}

impl Default for DiagramStyle {
    fn default() -> Self {
        Self {
            font: None,
            font_scale: 14.0,
        }
    }
}

impl DiagramStyle {
    pub fn with_font_path(font_path: &Path) -> Result<Self, OutputError> {
        let font_data = fs::read(font_path).map_err(|source| OutputError::Io {
            path: font_path.to_path_buf(),
            source,
        })?;
        let font = FontVec::try_from_vec(font_data)
            .map_err(|_| OutputError::Font(font_path.to_path_buf()))?;
        Ok(Self {
            font: Some(font),
            ..Self::default()
        })
    }

    /// Loads the first font found in the usual system locations.
    pub fn with_system_font() -> Self {
        for path in SYSTEM_FONTS {
            if let Ok(style) = Self::with_font_path(Path::new(path)) {
                info!("Labelling diagrams with {}", path);
                return style;
            }
        }
        debug!("No system font found, diagrams are drawn without labels");
        Self::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerBox {
    pub name: String,
    pub kind: LayerKind,
    pub x: u32,
    pub y: u32,
    pub width: u32,
}

impl LayerBox {
    fn centre_y(&self) -> u32 {
        self.y + ROW_HEIGHT / 2
    }

    fn right(&self) -> u32 {
        self.x + self.width
    }

    fn rect(&self) -> Rect {
        Rect::at(self.x as i32, self.y as i32).of_size(self.width, ROW_HEIGHT)
    }

    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.kind)
    }
}

/// A connection between two layers that are not adjacent in graph order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SkipConnection {
    pub from: usize,
    pub to: usize,
    pub lane: u32,
}

/// Layout of a model drawn top to bottom, one labelled bar per layer.
#[derive(Clone, Debug)]
pub struct Diagram {
    width: u32,
    height: u32,
    boxes: Vec<LayerBox>,
    skips: Vec<SkipConnection>,
}

impl Diagram {
    pub fn from_summary(summary: &ModelSummary) -> Result<Self, OutputError> {
        if summary.layers.is_empty() {
            return Err(OutputError::EmptyModel(summary.model_name.clone()));
        }

        let boxes: Vec<LayerBox> = summary
            .layers
            .iter()
            .enumerate()
            .map(|(row, layer)| {
                let width = bar_width(&layer.output_shape);
                LayerBox {
                    name: layer.name.clone(),
                    kind: layer.kind,
                    x: MARGIN + (MAX_BAR_WIDTH - width) / 2,
                    y: MARGIN + row as u32 * (ROW_HEIGHT + ROW_GAP),
                    width,
                }
            })
            .collect();

        let rows: HashMap<&str, usize> = summary
            .layers
            .iter()
            .enumerate()
            .map(|(row, layer)| (layer.name.as_str(), row))
            .collect();

        let mut skips = Vec::new();
        for (to, layer) in summary.layers.iter().enumerate() {
            for input in layer.inputs.iter() {
                match rows.get(input.as_str()) {
                    Some(&from) if from + 1 != to => skips.push(SkipConnection {
                        from,
                        to,
                        lane: skips.len() as u32 % LANES,
                    }),
                    Some(_) => {}
                    None => debug!("Layer {} reads from unknown layer {}", layer.name, input),
                }
            }
        }

        let rows = boxes.len() as u32;
        Ok(Self {
            width: Self::label_x() + LABEL_WIDTH + MARGIN,
            height: 2 * MARGIN + rows * ROW_HEIGHT + (rows - 1) * ROW_GAP,
            boxes,
            skips,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn boxes(&self) -> &[LayerBox] {
        &self.boxes
    }

    pub fn skips(&self) -> &[SkipConnection] {
        &self.skips
    }

    fn lane_x(lane: u32) -> u32 {
        MARGIN + MAX_BAR_WIDTH + LANE_OFFSET + lane * LANE_WIDTH + LANE_WIDTH / 2
    }

    fn label_x() -> u32 {
        MARGIN + MAX_BAR_WIDTH + LANE_OFFSET + LANES * LANE_WIDTH + LABEL_OFFSET
    }

    pub fn render(&self, style: &DiagramStyle) -> RgbImage {
        let mut image = RgbImage::from_pixel(self.width, self.height, BACKGROUND);

        let spine = (MARGIN + MAX_BAR_WIDTH / 2) as f32;
        for pair in self.boxes.windows(2) {
            draw_line_segment_mut(
                &mut image,
                (spine, pair[0].centre_y() as f32),
                (spine, pair[1].centre_y() as f32),
                CONNECTION,
            );
        }

        for skip in self.skips.iter() {
            let from = &self.boxes[skip.from];
            let to = &self.boxes[skip.to];
            let lane = Self::lane_x(skip.lane) as f32;
            let (from_y, to_y) = (from.centre_y() as f32, to.centre_y() as f32);
            draw_line_segment_mut(&mut image, (from.right() as f32, from_y), (lane, from_y), CONNECTION);
            draw_line_segment_mut(&mut image, (lane, from_y), (lane, to_y), CONNECTION);
            draw_line_segment_mut(&mut image, (lane, to_y), (to.right() as f32, to_y), CONNECTION);
        }

        let text_y_offset = (ROW_HEIGHT as f32 - style.font_scale).max(0.0) as i32 / 2;
        for layer in self.boxes.iter() {
            let colour = layer_colour(layer.kind);
            draw_filled_rect_mut(&mut image, layer.rect(), colour);
            draw_hollow_rect_mut(&mut image, layer.rect(), darker(colour));

            if let Some(font) = &style.font {
                draw_text_mut(
                    &mut image,
                    TEXT,
                    Self::label_x() as i32,
                    layer.y as i32 + text_y_offset,
                    style.font_scale,
                    font,
                    &layer.label(),
                );
            }
        }
        image
    }

    pub fn save(&self, style: &DiagramStyle, path: &Path) -> Result<(), OutputError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| OutputError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        self.render(style).save(path)?;
        Ok(())
    }
}

/// Draws the layer graph of a model into a PNG file.
pub fn render_diagram(
    summary: &ModelSummary,
    style: &DiagramStyle,
    path: &Path,
) -> Result<Diagram, OutputError> {
    let diagram = Diagram::from_summary(summary)?;
    diagram.save(style, path)?;
    info!(
        "Wrote the diagram of {} with {} layers to {}",
        summary.model_name,
        diagram.boxes().len(),
        path.display()
    );
    Ok(diagram)
}
