//! Frame acquisition
//!
//! The scheduler pulls one encoded frame per tick from a [`FrameSource`].
//! A source that has nothing to offer returns `None` and the tick is skipped.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// One encoded image frame (JPEG or PNG bytes)
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            captured_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Acquire the next frame, or `None` if no frame is available right now
    async fn next_frame(&mut self) -> Option<Frame>;
}

/// Cycles through the image files in a directory, in file name order
#[derive(Debug)]
pub struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    position: usize,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

impl DirectoryFrameSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory: {}", dir.display()))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        files.sort();

        if files.is_empty() {
            anyhow::bail!("no image frames found in {}", dir.display());
        }

        debug!("loaded {} frames from {}", files.len(), dir.display());

        Ok(Self { files, position: 0 })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

#[async_trait]
impl FrameSource for DirectoryFrameSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        let path = self.files.get(self.position)?.clone();
        self.position = (self.position + 1) % self.files.len();

        match tokio::fs::read(&path).await {
            Ok(data) => Some(Frame::new(data)),
            Err(e) => {
                warn!("failed to read frame {}: {}", path.display(), e);
                None
            }
        }
    }
}
