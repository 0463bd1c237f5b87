use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::status::TransferStatus;

use super::archive::ArchiveFormat;
use super::download::{existing_len, filename_from_uri, FileTransfer};

const MANIFEST_FILE: &str = "manifest.json";
pub const IMPORTED_VERSION: &str = "_";

static NON_ALPHANUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9]").expect("valid name regex"));

/// Directory-safe form of an artifact name.
#[must_use]
pub fn normalized_name(name: &str) -> String {
    NON_ALPHANUMERIC.replace_all(name, "_").into_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtraFile {
    pub url: String,
    pub file_name: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// A downloadable model plus the auxiliary files it needs to be usable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub url: String,
    pub version: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub is_archive: bool,
    #[serde(default)]
    pub archive_format: ArchiveFormat,
    #[serde(default)]
    pub archive_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_files: Vec<ExtraFile>,
    #[serde(default)]
    pub imported: bool,
}

impl ArtifactDescriptor {
    #[must_use]
    pub fn title(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// `<root>/<normalized name>/<version>`
    #[must_use]
    pub fn version_dir(&self, root: &Path) -> PathBuf {
        root.join(normalized_name(&self.name)).join(&self.version)
    }

    #[must_use]
    pub fn primary_path(&self, root: &Path) -> PathBuf {
        self.version_dir(root).join(&self.file_name)
    }

    #[must_use]
    pub fn archive_dir_path(&self, root: &Path) -> Option<PathBuf> {
        if !self.is_archive {
            return None;
        }
        let dir = self
            .archive_dir
            .clone()
            .unwrap_or_else(|| normalized_name(&self.name));
        Some(self.version_dir(root).join(dir))
    }

    /// Primary plus extras.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.size_bytes + self.extra_files.iter().map(|f| f.size_bytes).sum::<u64>()
    }

    /// The ordered transfer list: primary file first, then extras.
    #[must_use]
    pub fn transfers(&self, root: &Path, auth_token: Option<&str>) -> Vec<FileTransfer> {
        let dir = self.version_dir(root);
        let token = auth_token
            .map(str::to_owned)
            .or_else(|| self.auth_token.clone());
        let mut transfers = vec![FileTransfer {
            url: self.url.clone(),
            destination: dir.join(&self.file_name),
            expected_bytes: Some(self.size_bytes),
            auth_token: token.clone(),
        }];
        transfers.extend(self.extra_files.iter().map(|extra| FileTransfer {
            url: extra.url.clone(),
            destination: dir.join(&extra.file_name),
            expected_bytes: Some(extra.size_bytes),
            auth_token: token.clone(),
        }));
        transfers
    }

    fn validate(&mut self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("artifact name must not be empty");
        }
        if self.version.trim().is_empty() {
            bail!("{}: version must not be empty", self.name);
        }
        if self.file_name.is_empty() {
            self.file_name = filename_from_uri(&self.url)
                .ok_or_else(|| anyhow!("{}: cannot derive file name from url", self.name))?;
        }
        let names = std::iter::once(&self.file_name).chain(self.extra_files.iter().map(|f| &f.file_name));
        for name in names {
            if name.contains('/') || name.contains('\\') || name == ".." {
                bail!("{}: file name {name:?} must not contain path separators", self.name);
            }
        }
        Ok(())
    }
}

pub struct ModelManager {
    root: PathBuf,
    manifest: PathBuf,
    descriptors: Vec<ArtifactDescriptor>,
}

impl ModelManager {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).context("create model directory")?;
        let manifest = root.join(MANIFEST_FILE);
        let mut manager = Self {
            root,
            manifest,
            descriptors: vec![],
        };
        manager.load_manifest()?;
        Ok(manager)
    }

    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    pub fn register(&mut self, mut descriptor: ArtifactDescriptor) -> Result<()> {
        descriptor.validate()?;
        if let Some(existing) = self
            .descriptors
            .iter_mut()
            .find(|current| current.name == descriptor.name)
        {
            *existing = descriptor;
        } else {
            self.descriptors.push(descriptor);
        }
        self.save()
    }

    /// Loads a JSON list of descriptors (an allowlist) and registers each one.
    pub fn register_all(&mut self, allowlist: &Path) -> Result<usize> {
        let file = File::open(allowlist)
            .with_context(|| format!("open allowlist {}", allowlist.display()))?;
        let descriptors: Vec<ArtifactDescriptor> =
            serde_json::from_reader(file).context("parse allowlist")?;
        let count = descriptors.len();
        for descriptor in descriptors {
            self.register(descriptor)?;
        }
        Ok(count)
    }

    pub fn descriptor(&self, name: &str) -> Option<&ArtifactDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn descriptors(&self) -> Vec<&ArtifactDescriptor> {
        self.descriptors.iter().collect()
    }

    /// Derives download status from what is on disk.
    pub fn scan_status(&self, descriptor: &ArtifactDescriptor) -> Result<(TransferStatus, u64)> {
        let transfers = descriptor.transfers(&self.root, None);
        let mut on_disk = 0u64;
        let mut complete = true;
        let mut any_bytes = false;

        for (index, transfer) in transfers.iter().enumerate() {
            if index == 0 {
                if let Some(dir) = descriptor.archive_dir_path(&self.root) {
                    if dir.is_dir() && !transfer.destination.exists() {
                        on_disk += descriptor.size_bytes;
                        any_bytes = true;
                        continue;
                    }
                }
            }
            let len = existing_len(&transfer.destination)?;
            on_disk += len;
            any_bytes |= len > 0;
            let expected = transfer.expected_bytes.unwrap_or(0);
            let file_done = transfer.destination.is_file() && (expected == 0 || len >= expected);
            // A primary archive still on disk has not been expanded yet.
            let needs_expand = index == 0 && descriptor.is_archive;
            if !file_done || needs_expand {
                complete = false;
            }
        }

        let status = if complete {
            TransferStatus::Succeeded
        } else if any_bytes {
            TransferStatus::PartiallyDownloaded
        } else {
            TransferStatus::NotStarted
        };
        Ok((status, on_disk))
    }

    pub fn delete(&mut self, name: &str) -> Result<Option<ArtifactDescriptor>> {
        let Some(position) = self.descriptors.iter().position(|d| d.name == name) else {
            return Ok(None);
        };
        let path = self.descriptors[position].version_dir(&self.root);
        if path.exists() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("remove model directory {}", path.display()))?;
        }
        let removed = if self.descriptors[position].imported {
            let removed = self.descriptors.remove(position);
            self.save()?;
            removed
        } else {
            self.descriptors[position].clone()
        };
        info!("deleted local files for {name}");
        Ok(Some(removed))
    }

    /// Copies a local model file into the layout and registers it.
    pub fn import_local(&mut self, source: &Path, name: &str) -> Result<ArtifactDescriptor> {
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("invalid import path {}", source.display()))?;
        let size_bytes = fs::metadata(source)
            .with_context(|| format!("stat {}", source.display()))?
            .len();
        let descriptor = ArtifactDescriptor {
            name: name.to_string(),
            display_name: None,
            url: String::new(),
            version: IMPORTED_VERSION.into(),
            file_name,
            size_bytes,
            is_archive: false,
            archive_format: ArchiveFormat::default(),
            archive_dir: None,
            sha256: None,
            auth_token: None,
            extra_files: vec![],
            imported: true,
        };
        let target = descriptor.primary_path(&self.root);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).context("create import directory")?;
        }
        fs::copy(source, &target)
            .with_context(|| format!("copy {} to {}", source.display(), target.display()))?;
        self.register(descriptor.clone())?;
        info!("imported {name} from {}", source.display());
        Ok(descriptor)
    }

    pub fn save(&self) -> Result<()> {
        let manifest = File::create(&self.manifest).context("create model manifest")?;
        serde_json::to_writer_pretty(manifest, &self.descriptors)
            .context("write model manifest")?;
        Ok(())
    }

    fn load_manifest(&mut self) -> Result<()> {
        if self.manifest.exists() {
            let manifest = File::open(&self.manifest).context("open model manifest")?;
            let descriptors: Vec<ArtifactDescriptor> =
                serde_json::from_reader(manifest).context("parse model manifest")?;
            self.descriptors = descriptors;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_descriptor(name: &str) -> ArtifactDescriptor {
    ArtifactDescriptor {
        name: name.to_string(),
        display_name: Some("Gemma 3 1B".into()),
        url: "https://example.test/gemma.task".into(),
        version: "abc123".into(),
        file_name: "gemma.task".into(),
        size_bytes: 100,
        is_archive: false,
        archive_format: ArchiveFormat::Zip,
        archive_dir: None,
        sha256: None,
        auth_token: None,
        extra_files: vec![ExtraFile {
            url: "https://example.test/tokenizer.json".into(),
            file_name: "tokenizer.json".into(),
            size_bytes: 20,
        }],
        imported: false,
    }
}
