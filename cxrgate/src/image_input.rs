//! Collecting capture files from the command line and reading them

use crate::preprocessing::decode_image;
use anyhow::{Context, Result};
use image::DynamicImage;
use std::fs;
use std::path::{Path, PathBuf};

/// What to do with missing or unsupported inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPolicy {
    /// Fail the whole run
    Strict,
    /// Warn and skip
    Permissive,
}

impl InputPolicy {
    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            InputPolicy::Strict
        } else {
            InputPolicy::Permissive
        }
    }

    fn is_strict(self) -> bool {
        self == InputPolicy::Strict
    }
}

/// Capture formats the decoder handles: jpg, jpeg, png, webp, bmp, tiff, tif
pub fn is_supported_capture(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| {
            matches!(
                ext.as_str(),
                "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tiff" | "tif"
            )
        })
}

/// Supported captures directly inside `dir`, sorted
pub fn captures_in_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && is_supported_capture(&path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn looks_like_glob(source: &str) -> bool {
    source.contains(|c: char| matches!(c, '*' | '?' | '['))
}

fn skip_or_fail(policy: InputPolicy, message: String) -> Result<()> {
    if policy.is_strict() {
        anyhow::bail!(message);
    }
    log::warn!("{}{}", crate::color_utils::symbols::warning(), message);
    Ok(())
}

/// Expand files, directories and glob patterns into a sorted, deduplicated
/// list of capture paths.
pub fn collect_captures(sources: &[String], policy: InputPolicy) -> Result<Vec<PathBuf>> {
    let mut captures = Vec::new();

    for source in sources {
        let path = Path::new(source);

        if path.is_file() {
            if is_supported_capture(path) {
                captures.push(path.to_path_buf());
            } else {
                skip_or_fail(
                    policy,
                    format!("File is not a supported image format: {}", path.display()),
                )?;
            }
        } else if path.is_dir() {
            captures.extend(captures_in_directory(path)?);
        } else if !looks_like_glob(source) {
            skip_or_fail(policy, format!("File does not exist: {source}"))?;
        } else {
            let paths = match glob::glob(source) {
                Ok(paths) => paths,
                Err(e) => {
                    skip_or_fail(policy, format!("Invalid glob pattern {source}: {e}"))?;
                    continue;
                }
            };
            let before = captures.len();
            for entry in paths {
                match entry {
                    Ok(p) if p.is_file() && is_supported_capture(&p) => captures.push(p),
                    Ok(_) => {}
                    Err(e) => log::warn!(
                        "{}Error reading path in glob {source}: {e}",
                        crate::color_utils::symbols::warning()
                    ),
                }
            }
            if captures.len() == before {
                skip_or_fail(
                    policy,
                    format!("No image files found matching pattern: {source}"),
                )?;
            }
        }
    }

    captures.sort();
    captures.dedup();

    if captures.is_empty() && policy.is_strict() {
        anyhow::bail!("No image files found in the specified sources");
    }
    Ok(captures)
}

/// Read and decode one capture
pub fn load_capture(path: &Path) -> Result<DynamicImage> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read image: {}", path.display()))?;
    let image =
        decode_image(&bytes).with_context(|| format!("Failed to decode: {}", path.display()))?;
    log::debug!(
        "Loaded {} ({}x{}, {:?})",
        path.display(),
        image.width(),
        image.height(),
        image.color()
    );
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    #[test]
    fn test_is_supported_capture() {
        assert!(is_supported_capture(Path::new("chest.jpg")));
        assert!(is_supported_capture(Path::new("CHEST.PNG")));
        assert!(is_supported_capture(Path::new("scan.tif")));
        assert!(!is_supported_capture(Path::new("notes.txt")));
        assert!(!is_supported_capture(Path::new("scan.dcm")));
        assert!(!is_supported_capture(Path::new("noext")));
    }

    #[test]
    fn test_collect_directory_and_dedup() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        fs::write(dir.path().join("b.png"), b"x").unwrap();
        fs::write(dir.path().join("c.txt"), b"x").unwrap();

        let dir_str = dir.path().to_string_lossy().to_string();
        let file_str = dir.path().join("a.jpg").to_string_lossy().to_string();
        let found = collect_captures(&[dir_str, file_str], InputPolicy::Strict).unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].file_name().unwrap(), "a.jpg");
    }

    #[test]
    fn test_strict_vs_permissive() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("a.jpg");
        let text = dir.path().join("c.txt");
        fs::write(&image, b"x").unwrap();
        fs::write(&text, b"x").unwrap();

        let sources = vec![
            image.to_string_lossy().to_string(),
            text.to_string_lossy().to_string(),
            dir.path().join("missing.png").to_string_lossy().to_string(),
        ];
        assert!(collect_captures(&sources, InputPolicy::Strict).is_err());

        let found = collect_captures(&sources, InputPolicy::Permissive).unwrap();
        assert_eq!(found, vec![image]);
    }

    #[test]
    fn test_glob_without_matches() {
        let dir = tempdir().unwrap();
        let pattern = dir.path().join("*.jpg").to_string_lossy().to_string();
        assert!(collect_captures(&[pattern.clone()], InputPolicy::Strict).is_err());
        assert!(collect_captures(&[pattern], InputPolicy::Permissive)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_load_capture() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cxr.png");
        RgbImage::from_pixel(12, 9, Rgb([1, 2, 3])).save(&path).unwrap();

        let image = load_capture(&path).unwrap();
        assert_eq!((image.width(), image.height()), (12, 9));

        let bogus = dir.path().join("bogus.png");
        fs::write(&bogus, b"not a png").unwrap();
        assert!(load_capture(&bogus).is_err());
    }
}
