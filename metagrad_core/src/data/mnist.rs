//! Digit dataset source: IDX file parser plus a seeded synthetic stand-in.
//!
//! IDX format (all values big-endian):
//!   images: magic(2051) | count(u32) | rows(u32) | cols(u32) | pixel_data(u8...)
//!   labels: magic(2049) | count(u32) | label_data(u8...)
//!
//! `load_mnist` concatenates the train and t10k splits into one pool, so task
//! splits are decided by label, never by the file a sample came from.

use std::fs;
use std::path::Path;

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::{MetaError, MetaResult};

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

/// Raw digit images and their labels, as handed to [`crate::sampler::build_pool`].
#[derive(Debug, Clone)]
pub struct DigitSet {
    /// Pixel values, shape `[n, rows, cols]`
    pub images: Array3<u8>,
    /// One label per image
    pub labels: Vec<usize>,
}

impl DigitSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Image dimensions: (rows, cols).
    pub fn image_dims(&self) -> (usize, usize) {
        let (_, rows, cols) = self.images.dim();
        (rows, cols)
    }

    /// Parse an image file and a label file already read into memory.
    pub fn from_idx(image_bytes: &[u8], label_bytes: &[u8]) -> MetaResult<Self> {
        let images = parse_idx3_images(image_bytes)?;
        let labels = parse_idx1_labels(label_bytes)?;

        if images.dim().0 != labels.len() {
            return Err(MetaError::shape(
                "idx label file",
                &[images.dim().0],
                &[labels.len()],
            ));
        }

        Ok(Self { images, labels })
    }

    /// Append another set with identical image dimensions.
    pub fn concat(mut self, other: DigitSet) -> MetaResult<Self> {
        if self.image_dims() != other.image_dims() {
            let (r, c) = self.image_dims();
            let (or, oc) = other.image_dims();
            return Err(MetaError::shape("digit set concat", &[r, c], &[or, oc]));
        }
        let images = ndarray::concatenate(
            ndarray::Axis(0),
            &[self.images.view(), other.images.view()],
        )
        .map_err(|err| MetaError::config("images", err.to_string()))?;
        self.labels.extend(other.labels);
        Ok(Self {
            images,
            labels: self.labels,
        })
    }
}

/// Load the four standard MNIST files from `dir` and concatenate both splits.
pub fn load_mnist<P: AsRef<Path>>(dir: P) -> MetaResult<DigitSet> {
    let dir = dir.as_ref();
    let train = DigitSet::from_idx(
        &fs::read(dir.join("train-images-idx3-ubyte"))?,
        &fs::read(dir.join("train-labels-idx1-ubyte"))?,
    )?;
    let test = DigitSet::from_idx(
        &fs::read(dir.join("t10k-images-idx3-ubyte"))?,
        &fs::read(dir.join("t10k-labels-idx1-ubyte"))?,
    )?;
    tracing::info!(
        train = train.len(),
        test = test.len(),
        "loaded MNIST from {}",
        dir.display()
    );
    train.concat(test)
}

/// Deterministic digit-like dataset: `per_class` images for each of the ten
/// labels, each class lighting a distinct stripe pattern plus seeded noise.
/// Sample order is shuffled so labels are interleaved as in real data.
pub fn synthetic_digits(per_class: usize, rows: usize, cols: usize, seed: u64) -> DigitSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = per_class * 10;

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut rng);

    let mut images = Array3::<u8>::zeros((n, rows, cols));
    let mut labels = vec![0usize; n];

    for (slot, &sample) in order.iter().enumerate() {
        let digit = sample / per_class.max(1);
        labels[slot] = digit;
        for r in 0..rows {
            for c in 0..cols {
                let lit = (r * cols + c) % 10 == digit;
                let base: u8 = if lit { 200 } else { 20 };
                let noise: u8 = rng.gen_range(0..40);
                images[[slot, r, c]] = base.saturating_add(noise);
            }
        }
    }

    DigitSet { images, labels }
}

fn read_u32_be(data: &[u8], offset: usize) -> MetaResult<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| MetaError::config("idx", format!("truncated header at byte {offset}")))
}

fn parse_idx3_images(data: &[u8]) -> MetaResult<Array3<u8>> {
    let magic = read_u32_be(data, 0)?;
    if magic != IMAGE_MAGIC {
        return Err(MetaError::config(
            "idx",
            format!("image magic {magic:#06x}, expected {IMAGE_MAGIC:#06x}"),
        ));
    }
    let count = read_u32_be(data, 4)? as usize;
    let rows = read_u32_be(data, 8)? as usize;
    let cols = read_u32_be(data, 12)? as usize;

    let end = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .and_then(|n| n.checked_add(16))
        .ok_or_else(|| {
            MetaError::config("idx", format!("image header {count}x{rows}x{cols} overflows"))
        })?;
    let pixels = data.get(16..end).ok_or_else(|| {
        MetaError::config("idx", format!("image payload shorter than {count}x{rows}x{cols}"))
    })?;

    Array3::from_shape_vec((count, rows, cols), pixels.to_vec())
        .map_err(|err| MetaError::config("idx", err.to_string()))
}

fn parse_idx1_labels(data: &[u8]) -> MetaResult<Vec<usize>> {
    let magic = read_u32_be(data, 0)?;
    if magic != LABEL_MAGIC {
        return Err(MetaError::config(
            "idx",
            format!("label magic {magic:#06x}, expected {LABEL_MAGIC:#06x}"),
        ));
    }
    let count = read_u32_be(data, 4)? as usize;
    let end = count
        .checked_add(8)
        .ok_or_else(|| MetaError::config("idx", format!("label count {count} overflows")))?;
    let labels = data
        .get(8..end)
        .ok_or_else(|| MetaError::config("idx", format!("label payload shorter than {count}")))?;
    Ok(labels.iter().map(|&l| l as usize).collect())
}
