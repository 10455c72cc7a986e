//! Output path management.
//!
//! - Next to the input: `<stem>_<suffix>.<ext>`
//! - Under `--output-dir`: main outputs are `<stem>.<ext>`, auxiliary
//!   outputs keep their suffix
//! - Paths stored in metadata are relative to the metadata file

use anyhow::Result;
use log::debug;
use std::path::{Path, PathBuf};

use crate::metadata::{load_or_create_metadata, metadata_path, save_metadata, CaptureMetadata};

pub struct OutputManager<'a> {
    input_path: &'a Path,
    output_dir: Option<&'a Path>,
    skip_metadata: bool,
}

impl<'a> OutputManager<'a> {
    pub fn new(input_path: &'a Path, output_dir: Option<&'a Path>, skip_metadata: bool) -> Self {
        Self {
            input_path,
            output_dir,
            skip_metadata,
        }
    }

    fn input_stem(&self) -> &str {
        self.input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output")
    }

    fn place(&self, filename: String) -> Result<PathBuf> {
        match self.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(dir.join(filename))
            }
            None => Ok(self
                .input_path
                .parent()
                .unwrap_or(Path::new("."))
                .join(filename)),
        }
    }

    /// Primary output; the suffix is dropped inside a dedicated output dir
    pub fn main_output_path(&self, suffix: &str, extension: &str) -> Result<PathBuf> {
        let stem = self.input_stem();
        let filename = if self.output_dir.is_some() {
            format!("{stem}.{extension}")
        } else {
            format!("{stem}_{suffix}.{extension}")
        };
        self.place(filename)
    }

    /// Secondary output; always suffixed
    pub fn auxiliary_output_path(&self, suffix: &str, extension: &str) -> Result<PathBuf> {
        let filename = format!("{}_{suffix}.{extension}", self.input_stem());
        self.place(filename)
    }

    pub fn metadata_path(&self) -> Result<PathBuf> {
        metadata_path(self.input_path, self.output_dir)
    }

    /// Path as it should be recorded in this input's metadata
    pub fn relative_to_metadata(&self, path: &Path) -> Result<String> {
        if self.skip_metadata {
            return Ok(path.to_string_lossy().to_string());
        }
        Ok(make_path_relative_to_toml(path, &self.metadata_path()?))
    }

    /// Merge sections into this input's metadata file
    pub fn update_metadata<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut CaptureMetadata),
    {
        if self.skip_metadata {
            return Ok(());
        }
        let path = self.metadata_path()?;
        let mut metadata = load_or_create_metadata(&path)?;
        update(&mut metadata);
        save_metadata(&metadata, &path)?;
        debug!("Saved metadata to: {}", path.display());
        Ok(())
    }
}

/// Relative path with forward slashes when `file_path` sits under the TOML
/// file's directory, otherwise the path unchanged
pub fn make_path_relative_to_toml(file_path: &Path, toml_path: &Path) -> String {
    toml_path
        .parent()
        .and_then(|dir| file_path.strip_prefix(dir).ok())
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
        .unwrap_or_else(|| file_path.to_string_lossy().to_string())
}
