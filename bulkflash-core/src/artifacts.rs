//! Locates and validates the files a run flashes.
//!
//! Everything is resolved once, before any device task starts, into a
//! [`RunArtifacts`] value that tasks only ever borrow.
use crate::error::{FlashError, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the subdirectory of an extracted factory image that holds discrete
/// partition images.
pub const PARTITION_DIR: &str = "partitions";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisioningMode {
    FactoryImage,
    OtaSideload,
}

impl fmt::Display for ProvisioningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningMode::FactoryImage => f.write_str("factory image"),
            ProvisioningMode::OtaSideload => f.write_str("OTA sideload"),
        }
    }
}

/// One file flashed to the partition named after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionImage {
    pub partition: String,
    pub path: PathBuf,
}

/// The images shared by every device in factory-image mode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageBundle {
    pub bootloader: Option<PathBuf>,
    pub radio: Option<PathBuf>,
    /// The OS update package applied with `fastboot update`.
    pub update_package: PathBuf,
    /// Discrete partition images, sorted by partition name. Empty when the
    /// factory image has no partition directory.
    pub partitions: Vec<PartitionImage>,
}

impl ImageBundle {
    /// The single bootloader and radio images, if both were found.
    pub fn monolithic_firmware(&self) -> Option<(&Path, &Path)> {
        match (&self.bootloader, &self.radio) {
            (Some(bootloader), Some(radio)) => Some((bootloader, radio)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Images {
    Factory(ImageBundle),
    Ota(PathBuf),
}

/// Everything a run needs from disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunArtifacts {
    pub images: Images,
    /// Custom AVB key. When present, factory-image tasks provision it and
    /// relock the bootloader.
    pub sign_key: Option<PathBuf>,
}

impl RunArtifacts {
    pub fn mode(&self) -> ProvisioningMode {
        match self.images {
            Images::Factory(_) => ProvisioningMode::FactoryImage,
            Images::Ota(_) => ProvisioningMode::OtaSideload,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let io_err = |source| FlashError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    entries.sort();
    Ok(entries)
}

/// Lists `<factory dir>/partitions/*`, naming each partition after the file
/// stem (`abl.img` flashes `abl`).
fn partition_images(factory_dir: &Path) -> Result<Vec<PartitionImage>> {
    let dir = factory_dir.join(PARTITION_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    Ok(sorted_entries(&dir)?
        .into_iter()
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let partition = path.file_stem()?.to_string_lossy().into_owned();
            (!partition.is_empty()).then_some(PartitionImage { partition, path })
        })
        .collect())
}

/// Finds the extracted factory image for `model` and pulls its firmware out.
///
/// Other directories named after the model (an unpacked update package, for
/// instance) are skipped when they hold no firmware. If none does, the first
/// one is returned so the caller can report what is missing.
fn factory_firmware(entries: &[PathBuf], model: &str) -> Result<Option<ImageBundle>> {
    let mut first = None;
    for dir in entries
        .iter()
        .filter(|p| p.is_dir() && file_name(p).starts_with(model))
    {
        let bundle = firmware_in(dir)?;
        if bundle.monolithic_firmware().is_some() || !bundle.partitions.is_empty() {
            return Ok(Some(bundle));
        }
        first.get_or_insert(bundle);
    }
    Ok(first)
}

fn firmware_in(factory_dir: &Path) -> Result<ImageBundle> {
    let mut bundle = ImageBundle::default();
    for path in sorted_entries(factory_dir)? {
        if !path.is_file() {
            continue;
        }
        let name = file_name(&path);
        if name.contains("bootloader") {
            bundle.bootloader = Some(path);
        } else if name.contains("radio") {
            bundle.radio = Some(path);
        }
    }
    bundle.partitions = partition_images(factory_dir)?;
    Ok(bundle)
}

/// Resolves the artifacts for `model` in `dir`.
///
/// Recognised entries:
/// - `*<model>*-img-*.zip`: the OS update package (factory-image mode).
/// - `*<model>*ota*.zip`: the OTA package (sideload mode).
/// - `*.bin`: the custom AVB key.
/// - a directory starting with `<model>`: an extracted factory image holding
///   `bootloader-*.img`, `radio-*.img` and optionally a `partitions/` directory.
///
/// # Errors
///
/// [`FlashError::PrerequisiteMissing`] when a file the mode requires is absent,
/// [`FlashError::Io`] when `dir` cannot be read.
pub fn resolve(dir: &Path, model: &str, mode: ProvisioningMode) -> Result<RunArtifacts> {
    if model.is_empty() {
        return Err(FlashError::missing("device model"));
    }
    let entries = sorted_entries(dir)?;

    let mut update_package = None;
    let mut ota_package = None;
    let mut keys = Vec::new();
    for path in entries.iter().filter(|p| p.is_file()) {
        let name = file_name(path);
        if name.contains(model) && name.ends_with(".zip") {
            if name.contains("-img-") {
                update_package.get_or_insert_with(|| path.clone());
            } else if name.contains("ota") {
                ota_package.get_or_insert_with(|| path.clone());
            }
        } else if name.ends_with(".bin") {
            keys.push(path.clone());
        }
    }

    if keys.len() > 1 {
        warn!(count = keys.len(), "several key files found, using {}", keys[0].display());
    }
    let sign_key = keys.into_iter().next();

    let images = match mode {
        ProvisioningMode::FactoryImage => {
            let update_package = update_package.ok_or_else(|| {
                FlashError::missing(format!("OS update package ({model}-img-*.zip) in {}", dir.display()))
            })?;
            let mut bundle = factory_firmware(&entries, model)?.ok_or_else(|| {
                FlashError::missing(format!("extracted factory image ({model}-*/) in {}", dir.display()))
            })?;
            if bundle.monolithic_firmware().is_none() && bundle.partitions.is_empty() {
                return Err(FlashError::missing(format!(
                    "bootloader and radio images, or a {PARTITION_DIR}/ directory, in the {model} factory image"
                )));
            }
            bundle.update_package = update_package;
            Images::Factory(bundle)
        }
        ProvisioningMode::OtaSideload => Images::Ota(ota_package.ok_or_else(|| {
            FlashError::missing(format!("OTA package ({model}-ota-*.zip) in {}", dir.display()))
        })?),
    };

    let artifacts = RunArtifacts { images, sign_key };
    info!(model, mode = %artifacts.mode(), ?artifacts, "artifacts resolved");
    Ok(artifacts)
}

/// Source of the artifacts for a run, consulted once per run.
pub trait ArtifactResolver {
    fn resolve(&self, model: &str, mode: ProvisioningMode) -> Result<RunArtifacts>;
}

/// [`ArtifactResolver`] that scans one local directory with [`resolve`].
#[derive(Clone, Debug)]
pub struct DirectoryResolver {
    pub dir: PathBuf,
}

impl DirectoryResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactResolver for DirectoryResolver {
    fn resolve(&self, model: &str, mode: ProvisioningMode) -> Result<RunArtifacts> {
        resolve(&self.dir, model, mode)
    }
}
