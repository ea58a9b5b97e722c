//! Text overlay for saved images.
//!
//! Text is laid out line by line onto a single-channel mask the size of the
//! image, the mask is optionally rotated, and a solid color is composited
//! through it onto the background. Glyph rendering itself is provided by a
//! [`GlyphRasterizer`]; fonts are found through an [`AssetLocator`].

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Resolves named assets (fonts) to open file handles.
pub trait AssetLocator {
    fn open(&self, name: &str) -> Result<File>;
}

/// Looks assets up in a fixed directory.
#[derive(Debug, Clone)]
pub struct AssetDir {
    root: PathBuf,
}

impl AssetDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetLocator for AssetDir {
    fn open(&self, name: &str) -> Result<File> {
        let path = self.root.join(name);
        File::open(&path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("cannot open asset {}: {e}", path.display()),
            ))
        })
    }
}

/// Font metrics and glyph drawing at a fixed size.
pub trait GlyphRasterizer {
    /// Width and height of the rendered line's bounding box.
    fn measure(&self, line: &str) -> (u32, u32);

    /// Draw `line` with its top-left at `(x, y)`, writing `value` into the mask.
    fn draw(&self, mask: &mut GrayImage, x: f32, y: f32, line: &str, value: u8);
}

/// Turns a font file into a rasterizer.
pub trait FontProvider {
    fn load(&self, font: File, size: f32) -> Result<Box<dyn GlyphRasterizer>>;
}

/// Resolve a font through the locator and load it.
pub fn load_font(
    locator: &dyn AssetLocator,
    provider: &dyn FontProvider,
    name: &str,
    size: f32,
) -> Result<Box<dyn GlyphRasterizer>> {
    provider.load(locator.open(name)?, size)
}

/// Horizontal placement of each line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Justify {
    Left,
    Center,
    Right,
}

/// Vertical placement of the text block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Center,
    Top,
    Bottom,
}

/// Point the mask is rotated about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPivot {
    TextCenter,
    ImageCenter,
}

impl FromStr for Justify {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "left" => Ok(Self::Left),
            "center" => Ok(Self::Center),
            "right" => Ok(Self::Right),
            other => Err(Error::format(format!("unknown justification '{other}'"))),
        }
    }
}

impl FromStr for Align {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "center" => Ok(Self::Center),
            "top" => Ok(Self::Top),
            "bottom" => Ok(Self::Bottom),
            other => Err(Error::format(format!("unknown alignment '{other}'"))),
        }
    }
}

impl FromStr for RotationPivot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text center" => Ok(Self::TextCenter),
            "image center" => Ok(Self::ImageCenter),
            other => Err(Error::format(format!("unknown rotation pivot '{other}'"))),
        }
    }
}

/// Placement parameters for [`draw_masked_text`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextLayout {
    pub margins: f32,
    pub line_spacing: f32,
    pub position_x: f32,
    pub position_y: f32,
    pub align: Align,
    pub justify: Justify,
    /// Degrees, counter-clockwise.
    pub rotation_angle: f32,
    pub pivot: RotationPivot,
}

impl Default for TextLayout {
    fn default() -> Self {
        Self {
            margins: 0.0,
            line_spacing: 0.0,
            position_x: 0.0,
            position_y: 0.0,
            align: Align::Center,
            justify: Justify::Center,
            rotation_angle: 0.0,
            pivot: RotationPivot::TextCenter,
        }
    }
}

fn align_y(align: Align, image_height: f32, text_height: f32, y: f32, margins: f32) -> f32 {
    match align {
        Align::Center => image_height / 2.0 - text_height / 2.0 + y,
        Align::Top => y + margins,
        Align::Bottom => image_height - text_height + y - margins,
    }
}

fn justify_x(justify: Justify, image_width: f32, line_width: f32, margins: f32) -> f32 {
    match justify {
        Justify::Left => margins,
        Justify::Right => image_width - line_width - margins,
        Justify::Center => image_width / 2.0 - line_width / 2.0,
    }
}

/// Lay `text` out onto `mask` (value 255) and return the rotated mask.
///
/// Every line advances by the tallest line's height plus `line_spacing`.
pub fn draw_masked_text(
    mut mask: GrayImage,
    text: &str,
    font: &dyn GlyphRasterizer,
    layout: &TextLayout,
) -> GrayImage {
    let lines: Vec<&str> = text.split('\n').collect();

    let mut max_width = 0.0f32;
    let mut max_height = 0.0f32;
    for line in &lines {
        let (w, h) = font.measure(line);
        max_width = max_width.max(w as f32);
        max_height = max_height.max(h as f32 + layout.line_spacing);
    }

    let image_width = mask.width() as f32;
    let image_height = mask.height() as f32;
    let text_height = max_height * lines.len() as f32;

    let mut line_y = layout.position_y;
    let mut sum_y = 0.0f32;
    let mut last_x = 0.0f32;
    for line in &lines {
        let (w, _) = font.measure(line);
        let x = layout.position_x + justify_x(layout.justify, image_width, w as f32, layout.margins);
        let y = align_y(layout.align, image_height, text_height, line_y, layout.margins);
        font.draw(&mut mask, x, y, line, 255);

        line_y += max_height;
        sum_y += y;
        last_x = x;
    }

    let pivot = match layout.pivot {
        RotationPivot::TextCenter => (last_x + max_width / 2.0, sum_y / lines.len() as f32),
        RotationPivot::ImageCenter => (image_width / 2.0, image_height / 2.0),
    };
    rotate_about(&mask, layout.rotation_angle, pivot)
}

/// Rotate counter-clockwise about `center`, nearest-neighbor, same canvas size.
pub fn rotate_about(mask: &GrayImage, angle_degrees: f32, center: (f32, f32)) -> GrayImage {
    if angle_degrees % 360.0 == 0.0 {
        return mask.clone();
    }
    let (sin, cos) = (-angle_degrees.to_radians()).sin_cos();
    let (cx, cy) = center;
    let (w, h) = mask.dimensions();

    let mut out = GrayImage::new(w, h);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - cx;
        let dy = y as f32 + 0.5 - cy;
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;
        if sx >= 0.0 && sy >= 0.0 && sx < w as f32 && sy < h as f32 {
            *px = *mask.get_pixel(sx as u32, sy as u32);
        }
    }
    out
}

/// Blend `color` over `background` weighted by `mask`.
pub fn composite(background: &RgbImage, color: Rgb<u8>, mask: &GrayImage) -> RgbImage {
    let mut out = background.clone();
    for (x, y, px) in out.enumerate_pixels_mut() {
        let Luma([m]) = *mask.get_pixel(x, y);
        let m = u32::from(m);
        for (dst, src) in px.0.iter_mut().zip(color.0) {
            *dst = ((u32::from(src) * m + u32::from(*dst) * (255 - m) + 127) / 255) as u8;
        }
    }
    out
}

/// Draw `text` onto `image` in `color`. The result is RGB.
pub fn overlay_text(
    image: &DynamicImage,
    text: &str,
    font: &dyn GlyphRasterizer,
    layout: &TextLayout,
    color: Rgb<u8>,
) -> DynamicImage {
    let background = image.to_rgb8();
    let mask = GrayImage::new(background.width(), background.height());
    let mask = draw_masked_text(mask, text, font, layout);
    DynamicImage::ImageRgb8(composite(&background, color, &mask))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    const GLYPH_W: u32 = 6;
    const GLYPH_H: u32 = 10;

    /// Fixed-size block glyphs: each character is a filled 6×10 cell.
    pub(crate) struct BlockFont;

    impl GlyphRasterizer for BlockFont {
        fn measure(&self, line: &str) -> (u32, u32) {
            let n = line.chars().count() as u32;
            if n == 0 { (0, 0) } else { (n * GLYPH_W, GLYPH_H) }
        }

        fn draw(&self, mask: &mut GrayImage, x: f32, y: f32, line: &str, value: u8) {
            let (w, h) = self.measure(line);
            let (x0, y0) = (x.round() as i64, y.round() as i64);
            for py in y0..y0 + h as i64 {
                for px in x0..x0 + w as i64 {
                    if px >= 0 && py >= 0 && (px as u32) < mask.width() && (py as u32) < mask.height() {
                        mask.put_pixel(px as u32, py as u32, Luma([value]));
                    }
                }
            }
        }
    }

    pub(crate) struct BlockFontProvider;

    impl FontProvider for BlockFontProvider {
        fn load(&self, _font: File, _size: f32) -> Result<Box<dyn GlyphRasterizer>> {
            Ok(Box::new(BlockFont))
        }
    }

    fn lit(mask: &GrayImage, x: u32, y: u32) -> bool {
        mask.get_pixel(x, y).0[0] == 255
    }

    // ── placement ────────────────────────────────────────────────────

    #[test]
    fn justify_positions() {
        assert_eq!(justify_x(Justify::Left, 100.0, 20.0, 5.0), 5.0);
        assert_eq!(justify_x(Justify::Right, 100.0, 20.0, 5.0), 75.0);
        assert_eq!(justify_x(Justify::Center, 100.0, 20.0, 5.0), 40.0);
    }

    #[test]
    fn align_positions() {
        assert_eq!(align_y(Align::Top, 50.0, 10.0, 2.0, 3.0), 5.0);
        assert_eq!(align_y(Align::Bottom, 50.0, 10.0, 2.0, 3.0), 39.0);
        assert_eq!(align_y(Align::Center, 50.0, 10.0, 2.0, 3.0), 22.0);
    }

    #[test]
    fn parse_layout_options() {
        assert_eq!("right".parse::<Justify>().unwrap(), Justify::Right);
        assert_eq!("bottom".parse::<Align>().unwrap(), Align::Bottom);
        assert_eq!("image center".parse::<RotationPivot>().unwrap(), RotationPivot::ImageCenter);
        assert!("middle".parse::<Align>().is_err());
    }

    // ── draw_masked_text ─────────────────────────────────────────────

    #[test]
    fn single_line_is_centered() {
        let mask = draw_masked_text(GrayImage::new(100, 50), "abcd", &BlockFont, &TextLayout::default());
        // 24×10 block centered at (50, 25).
        assert!(lit(&mask, 38, 20));
        assert!(lit(&mask, 61, 29));
        assert!(!lit(&mask, 37, 20));
        assert!(!lit(&mask, 62, 29));
        assert!(!lit(&mask, 38, 30));
    }

    #[test]
    fn lines_stack_with_spacing() {
        let layout = TextLayout {
            margins: 3.0,
            line_spacing: 2.0,
            align: Align::Top,
            justify: Justify::Left,
            ..TextLayout::default()
        };
        let mask = draw_masked_text(GrayImage::new(60, 40), "ab\nabcd", &BlockFont, &layout);
        // Line pitch is 10 + 2; first line at y=3, second at y=15.
        assert!(lit(&mask, 3, 3));
        assert!(!lit(&mask, 15, 3));
        assert!(!lit(&mask, 3, 13));
        assert!(lit(&mask, 3, 15));
        assert!(lit(&mask, 26, 24));
    }

    #[test]
    fn position_offsets_the_block() {
        let layout = TextLayout {
            position_x: 10.0,
            position_y: -5.0,
            ..TextLayout::default()
        };
        let mask = draw_masked_text(GrayImage::new(100, 50), "abcd", &BlockFont, &layout);
        assert!(lit(&mask, 48, 15));
        assert!(!lit(&mask, 47, 15));
    }

    // ── rotation ─────────────────────────────────────────────────────

    #[test]
    fn rotate_quarter_turn_counter_clockwise() {
        let mut mask = GrayImage::new(5, 5);
        mask.put_pixel(2, 4, Luma([255]));
        let rotated = rotate_about(&mask, 90.0, (2.5, 2.5));
        assert!(lit(&rotated, 4, 2));
        assert!(!lit(&rotated, 2, 4));
    }

    #[test]
    fn zero_rotation_is_identity() {
        let mut mask = GrayImage::new(4, 4);
        mask.put_pixel(1, 3, Luma([200]));
        assert_eq!(rotate_about(&mask, 0.0, (0.0, 0.0)), mask);
        assert_eq!(rotate_about(&mask, 360.0, (0.0, 0.0)), mask);
    }

    // ── composite ────────────────────────────────────────────────────

    #[test]
    fn composite_blends_through_mask() {
        let bg = RgbImage::from_pixel(3, 1, Rgb([0, 100, 200]));
        let mut mask = GrayImage::new(3, 1);
        mask.put_pixel(1, 0, Luma([255]));
        mask.put_pixel(2, 0, Luma([128]));
        let out = composite(&bg, Rgb([255, 255, 255]), &mask);
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 100, 200]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([255, 255, 255]));
        assert_eq!(out.get_pixel(2, 0), &Rgb([128, 178, 228]));
    }

    #[test]
    fn overlay_returns_rgb() {
        let img = DynamicImage::new_rgba8(40, 20);
        let out = overlay_text(&img, "hi", &BlockFont, &TextLayout::default(), Rgb([255, 0, 0]));
        let rgb = out.as_rgb8().unwrap();
        assert_eq!(rgb.get_pixel(20, 10), &Rgb([255, 0, 0]));
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    // ── assets ───────────────────────────────────────────────────────

    #[test]
    fn asset_dir_resolves_fonts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Roboto-Regular.ttf"), b"font").unwrap();
        let locator = AssetDir::new(dir.path());
        assert!(load_font(&locator, &BlockFontProvider, "Roboto-Regular.ttf", 30.0).is_ok());
        let err = load_font(&locator, &BlockFontProvider, "Missing.ttf", 30.0).err().unwrap();
        assert!(err.to_string().contains("Missing.ttf"));
    }
}
