//! Prevalent-color summaries of decoded images and their output rows.
//!
//! [`summarize`] counts every RGB value in an image (alpha is ignored) and
//! keeps the three most frequent. Ties go to the color seen first when the
//! image is scanned column by column. Images with fewer than three distinct
//! colors are padded with [`Color::PLACEHOLDER`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageError, ImageReader};
use serde::{Deserialize, Serialize};

/// An opaque 8-bit RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Fills summary slots the image could not provide a color for.
    pub const PLACEHOLDER: Color = Color { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Lowercase `#rrggbb` form.
    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// The three most prevalent colors of an image, most frequent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary(pub [Color; 3]);

impl Summary {
    pub fn colors(&self) -> &[Color; 3] {
        &self.0
    }

    pub fn hex(&self) -> [String; 3] {
        self.0.map(|c| c.hex())
    }
}

/// Compute the prevalent-color summary of a decoded image.
pub fn summarize(image: &DynamicImage) -> Summary {
    let (width, height) = image.dimensions();
    // color -> (count, first seen)
    let mut counts: HashMap<Color, (u64, usize)> = HashMap::new();
    let mut seen = 0usize;

    for x in 0..width {
        for y in 0..height {
            let [r, g, b, _] = image.get_pixel(x, y).0;
            let entry = counts.entry(Color::new(r, g, b)).or_insert((0, seen));
            entry.0 += 1;
            seen += 1;
        }
    }

    let mut ranked: Vec<(Color, u64, usize)> = counts
        .into_iter()
        .map(|(color, (count, first))| (color, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    let mut colors = [Color::PLACEHOLDER; 3];
    for (slot, (color, _, _)) in colors.iter_mut().zip(ranked) {
        *slot = color;
    }
    Summary(colors)
}

/// Decode the image at `path` and summarize it.
///
/// The format is sniffed from the file content, so temp files without a
/// meaningful extension decode fine.
pub fn summarize_file(path: &Path) -> Result<Summary, ImageError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(summarize(&image))
}

/// Serialize one output row: `subject,#rrggbb,#rrggbb,#rrggbb\n`.
pub fn serialize_row(subject: &str, summary: &Summary) -> String {
    let [first, second, third] = summary.hex();
    format!("{},{first},{second},{third}\n", quote_field(subject))
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
