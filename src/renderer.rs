//! Per-page image transforms run inside the worker pool.
//!
//! The processor only relies on the [`PageRenderer`] contract: `render` is a function of one
//! source image and the shared options, writes its output pages next to the source and
//! reports failure through the returned `Result`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::error::{Error, Result};
use crate::types::{Direction, ImageFormat, PageFlags, PageRecord, ProcessingOptions};

/// Marker appended to every rendered file stem.
pub const RENDERED_MARKER: &str = "-kcc";

/// Luma below which a border pixel counts as black.
const BLACK_LUMA_THRESHOLD: u8 = 40;
/// Share of black border pixels that makes a page "black background".
const BLACK_BORDER_RATIO: f64 = 0.5;

/// Transforms one source image into one or more output pages.
pub trait PageRenderer: Send + Sync {
    /// Cheap integrity check used by the pre-pass.
    fn verify(&self, path: &Path) -> Result<()>;

    /// Renders `source` and returns the written pages. Must not touch any other file.
    fn render(&self, source: &Path, options: &ProcessingOptions) -> Result<Vec<PageRecord>>;
}

/// Default renderer built on the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageRenderer;

impl ImageRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Cuts a landscape spread into its two halves, in reading order.
    fn split_spread(img: &DynamicImage, direction: Direction) -> [DynamicImage; 2] {
        let (width, height) = img.dimensions();
        let half = width / 2;
        let left = img.crop_imm(0, 0, half, height);
        let right = img.crop_imm(half, 0, width - half, height);
        match direction {
            Direction::Ltr => [left, right],
            Direction::Rtl => [right, left],
        }
    }

    /// Scales down (never up) to fit the profile screen, keeping the aspect ratio.
    fn fit(img: DynamicImage, options: &ProcessingOptions) -> DynamicImage {
        let (width, height) = img.dimensions();
        let (max_w, max_h) = (options.profile.width, options.profile.height);
        if options.webtoon || (width <= max_w && height <= max_h) {
            return img;
        }
        img.resize(max_w, max_h, FilterType::Lanczos3)
    }

    fn write_page(img: &DynamicImage, target: &Path, options: &ProcessingOptions) -> Result<()> {
        match options.image_format {
            ImageFormat::Png => img.save_with_format(target, image::ImageFormat::Png)?,
            ImageFormat::Jpeg => {
                let writer = BufWriter::new(File::create(target)?);
                let encoder = JpegEncoder::new_with_quality(writer, options.jpeg_quality);
                // JPEG has no alpha channel.
                let flattened = if options.grayscale {
                    DynamicImage::ImageLuma8(img.to_luma8())
                } else {
                    DynamicImage::ImageRgb8(img.to_rgb8())
                };
                flattened.write_with_encoder(encoder)?;
            }
        }
        Ok(())
    }
}

/// Output file name for one rendered page of `source`.
pub fn rendered_path(source: &Path, suffix: &str, format: ImageFormat) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "page".to_string());
    source.with_file_name(format!(
        "{stem}{RENDERED_MARKER}{suffix}.{}",
        format.extension()
    ))
}

/// `true` when more than half of the border pixels are close to black.
pub fn has_black_border(img: &DynamicImage) -> bool {
    let luma = img.to_luma8();
    let (width, height) = luma.dimensions();
    if width == 0 || height == 0 {
        return false;
    }

    let mut total = 0usize;
    let mut dark = 0usize;
    let mut sample = |x: u32, y: u32| {
        total += 1;
        if luma.get_pixel(x, y).0[0] < BLACK_LUMA_THRESHOLD {
            dark += 1;
        }
    };
    for x in 0..width {
        sample(x, 0);
        sample(x, height - 1);
    }
    for y in 0..height {
        sample(0, y);
        sample(width - 1, y);
    }

    dark as f64 / total as f64 > BLACK_BORDER_RATIO
}

impl PageRenderer for ImageRenderer {
    fn verify(&self, path: &Path) -> Result<()> {
        let size = std::fs::metadata(path)?.len();
        if size == 0 {
            return Err(Error::CorruptedImage(
                path.to_path_buf(),
                "file is empty".to_string(),
            ));
        }
        image::open(path)
            .map(|_| ())
            .map_err(|e| Error::CorruptedImage(path.to_path_buf(), e.to_string()))
    }

    fn render(&self, source: &Path, options: &ProcessingOptions) -> Result<Vec<PageRecord>> {
        let img = image::open(source)?;
        let (width, height) = img.dimensions();
        let landscape = width > height && !options.webtoon;

        let pages: Vec<(DynamicImage, &str, bool)> = if landscape && options.rotate_spreads {
            vec![(img.rotate90(), "", true)]
        } else if landscape && options.split_spreads {
            let [first, second] = Self::split_spread(&img, options.direction);
            vec![(first, "-a", false), (second, "-b", false)]
        } else {
            vec![(img, "", false)]
        };

        let mut records = Vec::with_capacity(pages.len());
        for (page, suffix, rotated) in pages {
            let black_background = has_black_border(&page);
            let page = Self::fit(page, options);
            let page = if options.grayscale {
                page.grayscale()
            } else {
                page
            };

            let target = rendered_path(source, suffix, options.image_format);
            Self::write_page(&page, &target, options)?;
            records.push(PageRecord {
                filename: target,
                flags: PageFlags {
                    rotated,
                    black_background,
                },
            });
        }
        Ok(records)
    }
}
