//! Publishing images to the image registry.
//!
//! All operations go through the [`ImageRegistry`] trait; [`GlanceClient`]
//! is the implementation talking to a real registry.

use std::collections::BTreeMap;
use std::fs::File;

use anyhow::{Context, Result};
use camino::Utf8Path;
use clap::ValueEnum;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::builder::ImageFormat;

mod glance;
pub use glance::GlanceClient;

#[cfg(test)]
pub(crate) mod fake;

/// The operating system family an image is tagged with.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OsTag {
    /// Linux guests, run on KVM
    Linux,
    /// Windows guests, run on Hyper-V
    Windows,
}

impl OsTag {
    /// The value of the `os` image property.
    pub fn os_family(&self) -> &'static str {
        match self {
            OsTag::Linux => "LINUX",
            OsTag::Windows => "WINDOWS",
        }
    }

    /// The value of the `hypervisor_type` image property.
    pub fn hypervisor_type(&self) -> &'static str {
        match self {
            OsTag::Linux => "kvm",
            OsTag::Windows => "hyperv",
        }
    }
}

/// Who can see an image.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Only the owning project
    Private,
}

/// Metadata an image is created with.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Image name; unique by convention
    pub name: String,
    /// Who can see the image
    pub visibility: Visibility,
    /// Disk format, e.g. `qcow2`
    pub disk_format: String,
    /// Container format; always `bare` here
    pub container_format: String,
    /// Free-form properties
    #[serde(flatten)]
    pub properties: BTreeMap<String, String>,
}

impl ImageMetadata {
    /// Metadata for a private image named `name` in `format`, tagged for `os`.
    pub fn new(name: &str, format: ImageFormat, os: OsTag) -> Self {
        let properties = [
            ("os", os.os_family()),
            ("hypervisor_type", os.hypervisor_type()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        Self {
            name: name.to_owned(),
            visibility: Visibility::Private,
            disk_format: format.disk_format().to_owned(),
            container_format: "bare".to_owned(),
            properties,
        }
    }
}

/// An image as listed by the registry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ImageSummary {
    /// The registry-assigned identifier
    pub id: String,
    /// Image name, if it has one
    #[serde(default)]
    pub name: Option<String>,
}

/// The operations needed from an image registry.
pub trait ImageRegistry {
    /// List images, optionally only those named exactly `name`.
    fn list_images(&self, name: Option<&str>) -> Result<Vec<ImageSummary>>;

    /// Delete the image with the given id.
    fn delete_image(&self, id: &str) -> Result<()>;

    /// Create an image with `metadata`, uploading its content from `data`.
    /// Returns the new image's id.
    fn create_image(&self, metadata: &ImageMetadata, data: File) -> Result<String>;
}

/// Reported when the registry can't be used at all, as opposed to a failing operation.
pub const UNREACHABLE: &str =
    "Can't connect to the image registry. Are the tenant and credentials set properly?";

/// Verify the registry is reachable and accepts our credentials.
pub fn check_connectivity(registry: &dyn ImageRegistry) -> Result<()> {
    registry.list_images(None).context(UNREACHABLE)?;
    Ok(())
}

/// Find the id of the image named `name`. If there are several, the first
/// one the registry returns wins.
pub fn find_image_id_by_name(registry: &dyn ImageRegistry, name: &str) -> Result<Option<String>> {
    let images = registry.list_images(Some(name))?;
    if images.len() > 1 {
        tracing::debug!("{} images named {name}", images.len());
    }
    Ok(images.into_iter().next().map(|i| i.id))
}

/// Delete an image that is about to be replaced.
pub fn remove_image(registry: &dyn ImageRegistry, id: &str) -> Result<()> {
    tracing::warn!("Removing image with id {id}");
    registry
        .delete_image(id)
        .with_context(|| format!("Removing image {id}"))
}

/// Upload the file at `path` as a new image.
pub fn upload(registry: &dyn ImageRegistry, path: &Utf8Path, metadata: &ImageMetadata) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Opening {path}"))?;
    let id = registry.create_image(metadata, f)?;
    tracing::info!("Uploaded {path} as {} ({id})", metadata.name);
    Ok(id)
}

/// Upload `path` to the registry, replacing any image of the same name.
///
/// Without a `name` the image is named after the file, minus its extension.
#[context("Uploading {path}")]
pub fn upload_image(
    registry: &dyn ImageRegistry,
    path: &Utf8Path,
    format: ImageFormat,
    name: Option<&str>,
    os: OsTag,
) -> Result<String> {
    let name = match name.filter(|n| !n.is_empty()) {
        Some(n) => n,
        None => path
            .file_stem()
            .ok_or_else(|| anyhow::anyhow!("Can't derive an image name from {path}"))?,
    };
    if let Some(id) = find_image_id_by_name(registry, name)? {
        remove_image(registry, &id)?;
    }
    let metadata = ImageMetadata::new(name, format, os);
    upload(registry, path, &metadata)
}
