//! CIFAR-10 binary-format reader and downloader.
//!
//! Reads the `cifar-10-batches-bin` layout: each batch file is a sequence of
//! 3073-byte records, one label byte followed by 1024 red, 1024 green and 1024
//! blue pixel bytes in row-major order.

use std::io::Write;
use std::path::{Path, PathBuf};

use burn::data::dataset::Dataset;
use flate2::read::GzDecoder;

use image::{Rgb, Rgb32FImage};

/// Source archive of the binary distribution.
pub const CIFAR10_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
/// Directory created by unpacking [`CIFAR10_URL`].
pub const BATCHES_DIR: &str = "cifar-10-batches-bin";

pub const IMAGE_SIZE: usize = 32;
pub const CHANNELS: usize = 3;
const PIXELS: usize = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;
const RECORD_LEN: usize = 1 + PIXELS;

/// Errors raised while locating or parsing dataset files.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// A batch file is missing from the dataset directory.
    #[error("dataset file not found: {}", .0.display())]
    Missing(PathBuf),

    /// A batch file's size is not a whole number of records.
    #[error("malformed batch file {}: {len} bytes is not a multiple of 3073", .path.display())]
    Malformed { path: PathBuf, len: usize },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn file_names(self) -> Vec<String> {
        match self {
            Self::Train => (1..=5).map(|i| format!("data_batch_{i}.bin")).collect(),
            Self::Test => vec!["test_batch.bin".to_string()],
        }
    }
}

/// A single labelled 32x32 RGB image, stored as raw CHW bytes.
#[derive(Clone, Debug)]
pub struct CifarImage {
    pub pixels: Vec<u8>,
    pub label: u8,
}

impl CifarImage {
    /// Pixel values scaled to `[0, 1]`, CHW layout.
    pub fn to_unit_floats(&self) -> Vec<f32> {
        self.pixels.iter().map(|&p| p as f32 / 255.0).collect()
    }

    /// Decode into an `[0, 1]` RGB image for augmentation.
    pub fn to_image(&self) -> Rgb32FImage {
        let plane = IMAGE_SIZE * IMAGE_SIZE;
        let side = IMAGE_SIZE as u32;
        Rgb32FImage::from_fn(side, side, |x, y| {
            let i = (y * side + x) as usize;
            Rgb([0, 1, 2].map(|c| self.pixels[c * plane + i] as f32 / 255.0))
        })
    }
}

/// In-memory CIFAR-10 split.
pub struct Cifar10Dataset {
    images: Vec<CifarImage>,
}

impl Cifar10Dataset {
    /// Wrap already loaded images.
    pub fn from_images(images: Vec<CifarImage>) -> Self {
        Self { images }
    }

    /// Load a split from `root/cifar-10-batches-bin`.
    pub fn load(root: &Path, split: Split) -> Result<Self, DataError> {
        let dir = root.join(BATCHES_DIR);
        let mut images = Vec::new();
        for name in split.file_names() {
            let path = dir.join(name);
            if !path.exists() {
                return Err(DataError::Missing(path));
            }
            let bytes = std::fs::read(&path)?;
            images.extend(parse_records(&bytes, &path)?);
        }
        tracing::info!(
            split = ?split,
            images = images.len(),
            dir = %dir.display(),
            "Loaded CIFAR-10"
        );
        Ok(Self { images })
    }

    /// Load a split, downloading the archive into `root` first if it is missing.
    pub fn load_or_download(root: &Path, split: Split) -> anyhow::Result<Self> {
        match Self::load(root, split) {
            Ok(dataset) => Ok(dataset),
            Err(DataError::Missing(path)) => {
                tracing::info!(
                    missing = %path.display(),
                    "CIFAR-10 not found locally, downloading"
                );
                download(root)?;
                Ok(Self::load(root, split)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn images(&self) -> &[CifarImage] {
        &self.images
    }
}

impl Dataset<CifarImage> for Cifar10Dataset {
    fn get(&self, index: usize) -> Option<CifarImage> {
        self.images.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

fn parse_records(bytes: &[u8], path: &Path) -> Result<Vec<CifarImage>, DataError> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(DataError::Malformed {
            path: path.to_path_buf(),
            len: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(RECORD_LEN)
        .map(|record| CifarImage {
            label: record[0],
            pixels: record[1..].to_vec(),
        })
        .collect())
}

/// Write images in the binary batch format.
///
/// # Panics
/// Panics if an image does not hold exactly 3072 pixel bytes.
pub fn write_batch_file(path: &Path, images: &[CifarImage]) -> std::io::Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for image in images {
        assert_eq!(image.pixels.len(), PIXELS, "CIFAR image must have {PIXELS} bytes");
        file.write_all(&[image.label])?;
        file.write_all(&image.pixels)?;
    }
    file.flush()
}

/// Download and unpack the binary archive into `root`.
pub fn download(root: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(root)?;
    tracing::info!(url = CIFAR10_URL, root = %root.display(), "Downloading CIFAR-10");

    let bytes = reqwest::blocking::get(CIFAR10_URL)
        .and_then(|resp| resp.error_for_status())
        .and_then(|resp| resp.bytes())
        .map_err(|e| anyhow::anyhow!("Failed to download {CIFAR10_URL}: {e}"))?;
    tracing::info!(bytes = bytes.len(), "Download complete, unpacking");

    tar::Archive::new(GzDecoder::new(&bytes[..]))
        .unpack(root)
        .map_err(|e| {
            anyhow::anyhow!("Failed to unpack CIFAR-10 archive into {}: {e}", root.display())
        })?;
    Ok(())
}
