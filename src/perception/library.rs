use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use image::GrayImage;

use crate::errors::{DeskPilotError, DeskResult};

/// Named reference images the model can point at (`wait_for`, `expect`).
#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
    templates: BTreeMap<String, Arc<GrayImage>>,
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.png` in `dir`; the file stem becomes the template name.
    pub fn load_dir(dir: &Path) -> DeskResult<Self> {
        let mut lib = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_png = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("png"))
                .unwrap_or(false);
            if !is_png {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let img = image::open(&path)?.to_luma8();
            tracing::debug!(name, w = img.width(), h = img.height(), "template loaded");
            lib.insert(name, img);
        }
        tracing::info!(dir = %dir.display(), count = lib.len(), "template library loaded");
        Ok(lib)
    }

    pub fn insert(&mut self, name: impl Into<String>, image: GrayImage) {
        self.templates.insert(name.into(), Arc::new(image));
    }

    pub fn get(&self, name: &str) -> Option<Arc<GrayImage>> {
        self.templates.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> DeskResult<Arc<GrayImage>> {
        self.get(name)
            .ok_or_else(|| DeskPilotError::InvalidAction(format!("unknown template '{name}'")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
