use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::UpscaleError;
use crate::inference::Pass;

pub const DEFAULT_DENOISE_MODEL: &str = "photo/noise3";
pub const DEFAULT_UPSCALE_MODEL: &str = "art/scale2x";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFormat {
    /// Layer-descriptor JSON evaluated by the built-in convolution stack.
    Json,
    Onnx,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("json") {
            Some(Self::Json)
        } else if ext.eq_ignore_ascii_case("onnx") {
            Some(Self::Onnx)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Onnx => write!(f, "onnx"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Denoise,
    Upscale,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Denoise => write!(f, "denoise"),
            Self::Upscale => write!(f, "upscale"),
        }
    }
}

impl ModelKind {
    pub fn matches(self, pass: Pass) -> bool {
        matches!(
            (self, pass),
            (Self::Denoise, Pass::Denoise) | (Self::Upscale, Pass::Upscale)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub name: String,
    /// `None` for discovered files whose role is unknown.
    pub kind: Option<ModelKind>,
    /// Discovered entries only have a kind guessed from the file name.
    pub builtin: bool,
    /// Path relative to the models directory.
    pub filename: String,
    pub format: ModelFormat,
    /// Channel count, required for ONNX; JSON models declare their own.
    pub input_planes: Option<usize>,
    pub sha256: Option<String>,
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    let mut entries = Vec::new();
    for (style, about) in [("art", "illustrations"), ("photo", "photographs")] {
        entries.push(ModelEntry {
            name: format!("{style}/scale2x"),
            kind: Some(ModelKind::Upscale),
            builtin: true,
            filename: format!("{style}/scale2.0x_model.json"),
            format: ModelFormat::Json,
            input_planes: None,
            sha256: None,
            description: format!("2x upscaling tuned for {about}"),
        });
        for level in 0..=3 {
            entries.push(ModelEntry {
                name: format!("{style}/noise{level}"),
                kind: Some(ModelKind::Denoise),
                builtin: true,
                filename: format!("{style}/noise{level}_model.json"),
                format: ModelFormat::Json,
                input_planes: None,
                sha256: None,
                description: format!("Level {level} noise reduction for {about}"),
            });
        }
    }
    entries
}

/// Where a model lives and how to load it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub name: String,
    pub path: PathBuf,
    pub format: ModelFormat,
    pub input_planes: Option<usize>,
    pub sha256: Option<String>,
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Register model files under `models_dir` (and its immediate
    /// subdirectories) that the catalog does not already know.
    pub fn discover(&mut self) -> Result<()> {
        let root = self.models_dir.clone();
        if !root.exists() {
            return Ok(());
        }

        let mut dirs = vec![root.clone()];
        let read_dir = fs::read_dir(&root)
            .with_context(|| format!("Failed to read models directory: {}", root.display()))?;
        let mut files = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
        for dir in dirs.iter().skip(1) {
            let read_dir = fs::read_dir(dir)
                .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;
            for entry in read_dir {
                let path = entry?.path();
                if path.is_file() {
                    files.push(path);
                }
            }
        }
        files.sort();

        for path in files {
            let Some(format) = ModelFormat::from_path(&path) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(&root) else {
                continue;
            };
            let filename = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }

            let name = filename
                .rsplit_once('.')
                .map_or(filename.as_str(), |(stem, _)| stem)
                .to_string();

            info!(filename = %filename, %format, "Discovered unknown model");

            let lower = filename.to_lowercase();
            let kind = if lower.contains("noise") {
                Some(ModelKind::Denoise)
            } else if lower.contains("scale") {
                Some(ModelKind::Upscale)
            } else {
                None
            };

            self.entries.push(ModelEntry {
                name,
                kind,
                builtin: false,
                filename,
                format,
                input_planes: None,
                sha256: None,
                description: "Discovered model (metadata unknown)".into(),
            });
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.model_path(name).is_some_and(|p| p.is_file())
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.filename))
    }

    /// Resolve a catalog name or a filesystem path to a loadable source for
    /// `pass`.
    ///
    /// An existing path wins over a catalog entry of the same name. A
    /// built-in entry of the other kind is a configuration error; a
    /// discovered one only warns, since its kind is a guess.
    pub fn resolve(&self, name_or_path: &str, pass: Pass) -> Result<ModelSource> {
        let direct = Path::new(name_or_path);
        if direct.is_file() {
            let format = ModelFormat::from_path(direct).with_context(|| {
                format!("Unsupported model file extension: {}", direct.display())
            })?;
            return Ok(ModelSource {
                name: name_or_path.to_string(),
                path: direct.to_path_buf(),
                format,
                input_planes: None,
                sha256: None,
            });
        }

        let Some(entry) = self.get(name_or_path) else {
            bail!(
                "Unknown model '{name_or_path}' (not a catalog name or an existing file under {})",
                self.models_dir.display()
            );
        };

        if let Some(kind) = entry.kind.filter(|kind| !kind.matches(pass)) {
            if entry.builtin {
                return Err(UpscaleError::config(format!(
                    "model '{}' is a {kind} model and cannot run the {pass} pass",
                    entry.name
                ))
                .into());
            }
            warn!(model = %entry.name, %kind, %pass, "Model name suggests a different pass");
        }
        debug!(model = %entry.name, %pass, description = %entry.description, "Resolved model");

        Ok(ModelSource {
            name: entry.name.clone(),
            path: self.models_dir.join(&entry.filename),
            format: entry.format,
            input_planes: entry.input_planes,
            sha256: entry.sha256.clone(),
        })
    }
}

/// Check a model file against its recorded checksum, if any.
pub fn verify_checksum(source: &ModelSource) -> Result<()> {
    let Some(expected) = &source.sha256 else {
        return Ok(());
    };
    let actual = sha256_file(&source.path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        bail!(
            "SHA256 mismatch for {}: expected {expected}, got {actual}",
            source.name
        );
    }
    info!(model = %source.name, "Hash verified OK");
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}

/// Warn about catalog defaults that are missing on disk.
pub fn warn_missing(registry: &ModelRegistry, names: &[&str]) {
    for name in names {
        if registry.get(name).is_some() && !registry.is_available(name) {
            warn!(model = %name, dir = %registry.models_dir().display(), "Model file not found");
        }
    }
}
