//! An in-memory registry for tests.

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::Read;

use anyhow::Result;

use super::{ImageMetadata, ImageRegistry, ImageSummary, OsTag};
use crate::builder::ImageFormat;

#[derive(Debug, Clone)]
pub(crate) struct StoredImage {
    pub(crate) id: String,
    pub(crate) metadata: ImageMetadata,
    pub(crate) data: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeRegistry {
    images: RefCell<Vec<StoredImage>>,
    next_id: Cell<u32>,
    unreachable: bool,
    fail_create: bool,
}

impl FakeRegistry {
    pub(crate) fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    /// Image creation fails, after any same-named image was deleted.
    pub(crate) fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Default::default()
        }
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    fn alloc_id(&self) -> String {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        format!("img-{id}")
    }

    /// Add an image directly, returning its id.
    pub(crate) fn insert(&self, name: &str) -> String {
        let id = self.alloc_id();
        self.images.borrow_mut().push(StoredImage {
            id: id.clone(),
            metadata: ImageMetadata::new(name, ImageFormat::Qcow2, OsTag::Linux),
            data: Vec::new(),
        });
        id
    }

    pub(crate) fn images(&self) -> Vec<StoredImage> {
        self.images.borrow().clone()
    }
}

impl ImageRegistry for FakeRegistry {
    fn list_images(&self, name: Option<&str>) -> Result<Vec<ImageSummary>> {
        self.check_reachable()?;
        Ok(self
            .images
            .borrow()
            .iter()
            .filter(|i| name.map_or(true, |n| i.metadata.name == n))
            .map(|i| ImageSummary {
                id: i.id.clone(),
                name: Some(i.metadata.name.clone()),
            })
            .collect())
    }

    fn delete_image(&self, id: &str) -> Result<()> {
        self.check_reachable()?;
        let mut images = self.images.borrow_mut();
        let before = images.len();
        images.retain(|i| i.id != id);
        anyhow::ensure!(images.len() < before, "No image {id}");
        Ok(())
    }

    fn create_image(&self, metadata: &ImageMetadata, mut data: File) -> Result<String> {
        self.check_reachable()?;
        if self.fail_create {
            anyhow::bail!("storage backend full");
        }
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let id = self.alloc_id();
        self.images.borrow_mut().push(StoredImage {
            id: id.clone(),
            metadata: metadata.clone(),
            data: buf,
        });
        Ok(id)
    }
}
