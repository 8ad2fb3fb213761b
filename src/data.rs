use crate::error::{TrainError, TrainResult};
use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use glob::{MatchOptions, Pattern};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Settings for locating and assembling unaligned batches.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub crop_size: u32,
    /// Random horizontal flips during training.
    pub flip: bool,
    /// Consecutive frames per sample; `1` disables sequences.
    pub temporal_frames: usize,
    /// Class labels from the sub-directory names of domain A.
    pub class_labels: bool,
    /// Segmentation masks from `<phase>A_label/`.
    pub masks_a: bool,
    /// Segmentation masks from `<phase>B_label/`.
    pub masks_b: bool,
    /// Pair A and B by index instead of drawing B at random.
    pub serial_batches: bool,
}

/// One sample of a domain: its frames (a single one without sequences),
/// class and mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub frames: Vec<PathBuf>,
    pub class: Option<usize>,
    pub mask: Option<PathBuf>,
}

/// A pair of independently drawn domain samples.
#[derive(Debug, Clone)]
pub struct UnalignedItem {
    pub a: Sample,
    pub b: Sample,
}

/// What the training step consumes: real images per domain plus the
/// optional labels and frame sequences.
#[derive(Clone, Debug)]
pub struct CutBatch<B: Backend> {
    pub real_a: Tensor<B, 4>,
    pub real_b: Tensor<B, 4>,
    pub class_a: Option<Tensor<B, 1, Int>>,
    pub mask_a: Option<Tensor<B, 3, Int>>,
    pub mask_b: Option<Tensor<B, 3, Int>>,
    /// `[batch, T, c, h, w]`; `real_a` is the last frame.
    pub frames_a: Option<Tensor<B, 5>>,
    pub frames_b: Option<Tensor<B, 5>>,
}

impl<B: Backend> CutBatch<B> {
    pub fn new(real_a: Tensor<B, 4>, real_b: Tensor<B, 4>) -> Self {
        Self {
            real_a,
            real_b,
            class_a: None,
            mask_a: None,
            mask_b: None,
            frames_a: None,
            frames_b: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.real_a.dims()[0]
    }
}

/// Image folders `<phase>A/` and `<phase>B/` with no pairing between them.
#[derive(Debug, Clone)]
pub struct UnalignedDataset {
    a: Vec<Sample>,
    b: Vec<Sample>,
    classes: Vec<String>,
}

impl UnalignedDataset {
    pub fn open(root: &Path, phase: &str, config: &DataConfig) -> Result<Self> {
        let dir_a = root.join(format!("{phase}A"));
        let dir_b = root.join(format!("{phase}B"));
        let mask_dir_a = config.masks_a.then(|| root.join(format!("{phase}A_label")));
        let mask_dir_b = config.masks_b.then(|| root.join(format!("{phase}B_label")));

        let (a, classes) = collect_samples(&dir_a, mask_dir_a.as_deref(), config)?;
        let (b, _) = collect_samples(&dir_b, mask_dir_b.as_deref(), config)?;
        if a.is_empty() || b.is_empty() {
            return Err(anyhow::anyhow!(
                "no samples found under {} and {} ({} and {} found)",
                dir_a.display(),
                dir_b.display(),
                a.len(),
                b.len()
            ));
        }
        Ok(Self { a, b, classes })
    }

    pub fn len_a(&self) -> usize {
        self.a.len()
    }

    pub fn len_b(&self) -> usize {
        self.b.len()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn domain_b(&self) -> &[Sample] {
        &self.b
    }
}

impl Dataset<UnalignedItem> for UnalignedDataset {
    fn get(&self, index: usize) -> Option<UnalignedItem> {
        if index >= self.len() {
            return None;
        }
        Some(UnalignedItem {
            a: self.a[index % self.a.len()].clone(),
            b: self.b[index % self.b.len()].clone(),
        })
    }

    fn len(&self) -> usize {
        self.a.len().max(self.b.len())
    }
}

fn collect_samples(
    dir: &Path,
    mask_dir: Option<&Path>,
    config: &DataConfig,
) -> Result<(Vec<Sample>, Vec<String>)> {
    let mut groups: Vec<(Option<usize>, Vec<PathBuf>)> = Vec::new();
    let mut classes = Vec::new();
    if config.class_labels {
        let subdirs = glob_sorted(dir, "*")?
            .into_iter()
            .filter(|path| path.is_dir())
            .collect::<Vec<_>>();
        for (class, subdir) in subdirs.iter().enumerate() {
            classes.push(
                subdir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
            groups.push((Some(class), list_images(subdir)?));
        }
    } else {
        groups.push((None, list_images(dir)?));
    }

    let frames = config.temporal_frames.max(1);
    let mut samples = Vec::new();
    for (class, paths) in groups {
        if paths.len() < frames {
            continue;
        }
        for window in paths.windows(frames) {
            let mask = match mask_dir {
                Some(mask_dir) => Some(mask_path(dir, mask_dir, &window[frames - 1])?),
                None => None,
            };
            samples.push(Sample {
                frames: window.to_vec(),
                class,
                mask,
            });
        }
    }
    Ok((samples, classes))
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for ext in IMAGE_EXTENSIONS {
        paths.extend(glob_sorted(dir, &format!("*.{ext}"))?);
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Entries of `dir` matching `pattern`, ignoring case, sorted.
fn glob_sorted(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(anyhow::anyhow!("failed to read {}", dir.display()));
    }
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    let full = format!("{}/{pattern}", Pattern::escape(&dir.to_string_lossy()));
    let mut paths: Vec<PathBuf> = glob::glob_with(&full, options)
        .with_context(|| format!("invalid pattern {full}"))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();
    Ok(paths)
}

/// Mask of `image`: same relative path under `mask_dir`, as PNG.
fn mask_path(image_dir: &Path, mask_dir: &Path, image: &Path) -> Result<PathBuf> {
    let relative = image
        .strip_prefix(image_dir)
        .with_context(|| format!("{} is outside {}", image.display(), image_dir.display()))?;
    let path = mask_dir.join(relative).with_extension("png");
    if !path.exists() {
        return Err(anyhow::anyhow!("missing mask {}", path.display()));
    }
    Ok(path)
}

/// Decode, resize and normalise a batch of unaligned items.
pub fn build_batch<B: Backend>(
    items: &[UnalignedItem],
    config: &DataConfig,
    augment: bool,
    rng: &mut impl Rng,
    device: &B::Device,
) -> Result<CutBatch<B>> {
    let batch_size = items.len();
    let size = config.crop_size as usize;
    let frames = config.temporal_frames.max(1);

    let mut side_a = Side::default();
    let mut side_b = Side::default();
    let mut classes = Vec::with_capacity(batch_size);
    for item in items {
        let flip_a = augment && config.flip && rng.gen_bool(0.5);
        let flip_b = augment && config.flip && rng.gen_bool(0.5);
        side_a.push(&item.a, config.crop_size, flip_a)?;
        side_b.push(&item.b, config.crop_size, flip_b)?;
        classes.push(item.a.class.unwrap_or(0) as i64);
    }

    let (real_a, frames_a) = side_a.images::<B>(batch_size, frames, size, device);
    let (real_b, frames_b) = side_b.images::<B>(batch_size, frames, size, device);
    let mut batch = CutBatch::new(real_a, real_b);
    if frames > 1 {
        batch.frames_a = Some(frames_a);
        batch.frames_b = Some(frames_b);
    }
    if config.class_labels {
        batch.class_a = Some(Tensor::from_data(
            TensorData::new(classes, [batch_size]),
            device,
        ));
    }
    if config.masks_a {
        batch.mask_a = Some(side_a.mask::<B>(batch_size, size, device));
    }
    if config.masks_b {
        batch.mask_b = Some(side_b.mask::<B>(batch_size, size, device));
    }
    Ok(batch)
}

/// Turns dataset items into training batches for the burn data loader.
///
/// Unless `serial_batches` is set, the B side of every item is redrawn
/// from the whole domain so an A image does not keep meeting the same B.
/// Decoding failures come out as `Err` batches instead of panics.
#[derive(Clone)]
pub struct CutBatcher {
    config: DataConfig,
    augment: bool,
    domain_b: Arc<Vec<Sample>>,
    rng: Arc<Mutex<StdRng>>,
}

impl CutBatcher {
    pub fn new(config: DataConfig, augment: bool, domain_b: Vec<Sample>, seed: u64) -> Self {
        Self {
            config,
            augment,
            domain_b: Arc::new(domain_b),
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl<B: Backend> Batcher<B, UnalignedItem, TrainResult<CutBatch<B>>> for CutBatcher {
    fn batch(&self, mut items: Vec<UnalignedItem>, device: &B::Device) -> TrainResult<CutBatch<B>> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| TrainError::Batch("batcher rng lock poisoned".to_string()))?;
        if !self.config.serial_batches {
            for item in &mut items {
                if let Some(b) = self.domain_b.choose(&mut *rng) {
                    item.b = b.clone();
                }
            }
        }
        build_batch::<B>(&items, &self.config, self.augment, &mut *rng, device)
            .map_err(|err| TrainError::Batch(format!("{err:#}")))
    }
}

/// Pixel buffers of one domain while a batch is assembled.
#[derive(Default)]
struct Side {
    pixels: Vec<f32>,
    masks: Vec<i64>,
}

impl Side {
    fn push(&mut self, sample: &Sample, size: u32, flip: bool) -> Result<()> {
        for path in &sample.frames {
            let mut img = load_rgb(path, size)?;
            if flip {
                image::imageops::flip_horizontal_in_place(&mut img);
            }
            self.pixels.extend(image_to_chw(&img));
        }
        if let Some(path) = &sample.mask {
            let mut mask = load_mask(path, size)?;
            if flip {
                image::imageops::flip_horizontal_in_place(&mut mask);
            }
            self.masks.extend(mask.pixels().map(|p| p.0[0] as i64));
        }
        Ok(())
    }

    /// Last frame of every sample plus the full sequences.
    fn images<B: Backend>(
        &self,
        batch: usize,
        frames: usize,
        size: usize,
        device: &B::Device,
    ) -> (Tensor<B, 4>, Tensor<B, 5>) {
        let sequence = Tensor::<B, 5>::from_data(
            TensorData::new(self.pixels.clone(), [batch, frames, 3, size, size]),
            device,
        );
        let last = sequence
            .clone()
            .slice_dim(1, frames - 1..frames)
            .reshape([batch, 3, size, size]);
        (last, sequence)
    }

    fn mask<B: Backend>(&self, batch: usize, size: usize, device: &B::Device) -> Tensor<B, 3, Int> {
        Tensor::from_data(TensorData::new(self.masks.clone(), [batch, size, size]), device)
    }
}

fn load_rgb(path: &Path, size: u32) -> Result<RgbImage> {
    let img = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();
    if img.width() == size && img.height() == size {
        return Ok(img);
    }
    Ok(image::imageops::resize(&img, size, size, FilterType::CatmullRom))
}

fn load_mask(path: &Path, size: u32) -> Result<GrayImage> {
    let mask = image::open(path)
        .with_context(|| format!("failed to decode mask {}", path.display()))?
        .to_luma8();
    if mask.width() == size && mask.height() == size {
        return Ok(mask);
    }
    Ok(image::imageops::resize(&mask, size, size, FilterType::Nearest))
}

/// Convert RGB image data to CHW floats normalized to [-1, 1].
fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for y in 0..height {
        for x in 0..width {
            let pixel = img.get_pixel(x, y).0;
            let idx = (y * width + x) as usize;
            out[idx] = (pixel[0] as f32 / 127.5) - 1.0;
            out[hw + idx] = (pixel[1] as f32 / 127.5) - 1.0;
            out[2 * hw + idx] = (pixel[2] as f32 / 127.5) - 1.0;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
    use image::{Luma, Rgb};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    type B = NdArray<f32>;

    fn config() -> DataConfig {
        DataConfig {
            crop_size: 4,
            flip: true,
            temporal_frames: 1,
            class_labels: false,
            masks_a: false,
            masks_b: false,
            serial_batches: false,
        }
    }

    /// First pixel of every sample of a `[batch, 3, h, w]` tensor.
    fn first_pixels(images: Tensor<B, 4>) -> Vec<f32> {
        let [batch, c, h, w] = images.dims();
        let values = images.into_data().to_vec::<f32>().unwrap();
        (0..batch).map(|idx| values[idx * c * h * w]).collect()
    }

    fn write_image(path: &Path, value: u8) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(6, 6, Rgb([value, value, value])).save(path).unwrap();
    }

    fn write_mask(path: &Path, label: u8) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        GrayImage::from_pixel(6, 6, Luma([label])).save(path).unwrap();
    }

    #[test]
    fn unaligned_domains_cover_the_larger_side() {
        let root = TempDir::new().unwrap();
        for idx in 0..3 {
            write_image(&root.path().join(format!("trainA/{idx}.png")), 0);
        }
        write_image(&root.path().join("trainB/0.png"), 255);
        std::fs::write(root.path().join("trainA/notes.txt"), "skip").unwrap();

        let dataset = UnalignedDataset::open(root.path(), "train", &config()).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.len_b(), 1);
        assert!(dataset.get(3).is_none());

        let items = (0..2).filter_map(|idx| dataset.get(idx)).collect::<Vec<_>>();
        let mut rng = StdRng::seed_from_u64(0);
        let batch = build_batch::<B>(&items, &config(), true, &mut rng, &Default::default()).unwrap();
        assert_eq!(batch.real_a.dims(), [2, 3, 4, 4]);
        assert!((batch.real_a.clone().min().into_scalar() + 1.0).abs() < 1e-6);
        assert!((batch.real_b.max().into_scalar() - 1.0).abs() < 1e-6);
        assert!(batch.frames_a.is_none());
    }

    #[test]
    fn classes_masks_and_sequences() {
        let root = TempDir::new().unwrap();
        for (class, name) in ["cat", "dog"].iter().enumerate() {
            for frame in 0..3 {
                let path = format!("trainA/{name}/{frame}.jpg");
                write_image(&root.path().join(&path), 10 * frame as u8);
                write_mask(&root.path().join(format!("trainA_label/{name}/{frame}.png")), class as u8);
            }
        }
        for frame in 0..2 {
            write_image(&root.path().join(format!("trainB/x/{frame}.png")), 0);
        }
        let config = DataConfig {
            temporal_frames: 2,
            class_labels: true,
            masks_a: true,
            ..config()
        };

        let dataset = UnalignedDataset::open(root.path(), "train", &config).unwrap();
        assert_eq!(dataset.classes().to_vec(), vec!["cat".to_string(), "dog".to_string()]);
        // Two windows of two frames per class.
        assert_eq!(dataset.len_a(), 4);
        assert_eq!(dataset.len_b(), 1);

        let items = vec![dataset.get(0).unwrap(), dataset.get(3).unwrap()];
        let mut rng = StdRng::seed_from_u64(0);
        let batch = build_batch::<B>(&items, &config, false, &mut rng, &Default::default()).unwrap();
        assert_eq!(batch.frames_a.as_ref().map(|frames| frames.dims()), Some([2, 2, 3, 4, 4]));
        let classes = batch.class_a.unwrap().into_data().to_vec::<i64>().unwrap();
        assert_eq!(classes, vec![0, 1]);
        let mask = batch.mask_a.unwrap();
        assert_eq!(mask.dims(), [2, 4, 4]);
        assert_eq!(mask.sum().into_scalar(), 16);
    }

    #[test]
    fn missing_mask_is_reported() {
        let root = TempDir::new().unwrap();
        write_image(&root.path().join("trainA/0.png"), 0);
        write_image(&root.path().join("trainB/0.png"), 0);
        let config = DataConfig {
            masks_a: true,
            ..config()
        };
        let err = UnalignedDataset::open(root.path(), "train", &config).unwrap_err();
        assert!(err.to_string().contains("missing mask"));
    }

    #[test]
    fn listing_ignores_case_and_escapes_the_root() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("set[1]");
        write_image(&data.join("trainA/0.png"), 0);
        write_image(&data.join("trainA/1.JPG"), 0);
        write_image(&data.join("trainA/nested/2.png"), 0);
        std::fs::write(data.join("trainA/readme.md"), "skip").unwrap();
        write_image(&data.join("trainB/0.Png"), 0);

        let dataset = UnalignedDataset::open(&data, "train", &config()).unwrap();
        assert_eq!(dataset.len_a(), 2);
        assert_eq!(dataset.len_b(), 1);
        let names: Vec<_> = (0..2)
            .map(|idx| {
                let item = dataset.get(idx).unwrap();
                item.a.frames[0].file_name().unwrap().to_string_lossy().into_owned()
            })
            .collect();
        assert_eq!(names, vec!["0.png".to_string(), "1.JPG".to_string()]);
    }

    #[test]
    fn missing_domain_directory_is_an_error() {
        let root = TempDir::new().unwrap();
        write_image(&root.path().join("trainA/0.png"), 0);
        let err = UnalignedDataset::open(root.path(), "train", &config()).unwrap_err();
        assert!(format!("{err:#}").contains("trainB"));
    }

    #[test]
    fn loader_yields_full_batches_then_the_remainder() {
        let root = TempDir::new().unwrap();
        for idx in 0..5 {
            write_image(&root.path().join(format!("trainA/{idx}.png")), 0);
        }
        write_image(&root.path().join("trainB/0.png"), 255);
        let dataset = UnalignedDataset::open(root.path(), "train", &config()).unwrap();
        let batcher = CutBatcher::new(config(), true, dataset.domain_b().to_vec(), 7);

        let loader = DataLoaderBuilder::<B, UnalignedItem, TrainResult<CutBatch<B>>>::new(batcher)
            .batch_size(2)
            .shuffle(7)
            .set_device(Default::default())
            .build(dataset);
        let sizes: Vec<usize> = loader
            .iter()
            .map(|batch| batch.unwrap().batch_size())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn undecodable_image_fails_its_batch() {
        let root = TempDir::new().unwrap();
        write_image(&root.path().join("trainA/0.png"), 0);
        std::fs::write(root.path().join("trainA/1.png"), "not an image").unwrap();
        write_image(&root.path().join("trainB/0.png"), 0);
        let dataset = UnalignedDataset::open(root.path(), "train", &config()).unwrap();
        let batcher = CutBatcher::new(config(), false, dataset.domain_b().to_vec(), 0);

        let items = vec![dataset.get(0).unwrap(), dataset.get(1).unwrap()];
        let result: TrainResult<CutBatch<B>> = batcher.batch(items, &Default::default());
        match result {
            Err(TrainError::Batch(message)) => assert!(message.contains("1.png"), "{message}"),
            other => panic!("expected a batch error, got {other:?}"),
        }
    }

    #[test]
    fn domain_b_is_drawn_at_random_unless_serial() {
        let root = TempDir::new().unwrap();
        write_image(&root.path().join("trainA/0.png"), 0);
        for (idx, value) in [0u8, 80, 160, 240].into_iter().enumerate() {
            write_image(&root.path().join(format!("trainB/{idx}.png")), value);
        }
        let config = DataConfig {
            flip: false,
            ..config()
        };
        let dataset = UnalignedDataset::open(root.path(), "train", &config).unwrap();
        let items = vec![dataset.get(0).unwrap(); 16];
        let distinct = |batcher: &CutBatcher| {
            let batch: TrainResult<CutBatch<B>> = batcher.batch(items.clone(), &Default::default());
            first_pixels(batch.unwrap().real_b)
                .into_iter()
                .map(|value| (value * 1000.0).round() as i64)
                .collect::<BTreeSet<_>>()
                .len()
        };

        let random = CutBatcher::new(config.clone(), false, dataset.domain_b().to_vec(), 3);
        assert!(distinct(&random) > 1);

        let serial = DataConfig {
            serial_batches: true,
            ..config
        };
        let serial = CutBatcher::new(serial, false, dataset.domain_b().to_vec(), 3);
        assert_eq!(distinct(&serial), 1);
    }
}
