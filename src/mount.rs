//! Cluster image mounting with scoped release
//!
//! The image source is an external collaborator reached through the
//! [`ImageSource`] trait. A successful mount yields a [`MountGuard`];
//! guards are cheap to clone across concurrent fan-out tasks and the
//! underlying unmount runs when the last clone is released. Lifecycle
//! operations release explicitly on every exit path; a guard dropped
//! without release only logs, because unmounting needs an async context.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::warn;

use crate::cluster::Platform;
use crate::error::{Error, Result};

/// When to pull an image before mounting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullPolicy {
    /// Always pull
    Always,
    /// Pull only when not present locally
    Missing,
    /// Never pull; fail if absent
    Never,
}

/// External image engine surface consumed by keel
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Ensure the image is available locally per the pull policy
    async fn pull(&self, image: &str, platform: &Platform, policy: PullPolicy) -> Result<()>;

    /// Mount the image and return the mount point
    async fn mount(&self, image: &str) -> Result<PathBuf>;

    /// Unmount a previously returned mount point
    async fn unmount(&self, path: &Path) -> Result<()>;
}

/// Manifest shipped at the root of every mounted cluster image
#[derive(Clone, Debug, Deserialize)]
pub struct ImageManifest {
    /// Kubernetes version the image installs
    pub version: String,
    /// Platforms the image supports, as `os/arch[/variant]` strings
    pub platforms: Vec<String>,
}

impl ImageManifest {
    /// Whether any advertised platform satisfies `wanted`
    pub fn supports(&self, wanted: &Platform) -> bool {
        self.platforms
            .iter()
            .filter_map(|p| Platform::parse(p).ok())
            .any(|p| wanted.matches(&p))
    }
}

struct MountInner {
    source: Arc<dyn ImageSource>,
    path: PathBuf,
    refs: AtomicUsize,
}

/// Scoped handle to a mounted cluster image
///
/// Cloning increments a refcount; [`MountGuard::release`] unmounts when
/// the count reaches zero.
pub struct MountGuard {
    inner: Arc<MountInner>,
    manifest: ImageManifest,
    defused: bool,
}

impl std::fmt::Debug for MountGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountGuard")
            .field("path", &self.inner.path)
            .field("manifest", &self.manifest)
            .field("defused", &self.defused)
            .finish()
    }
}

impl MountGuard {
    /// The controller-side mount point
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The image manifest read at mount time
    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// The rootfs directory inside the mount
    pub fn rootfs(&self) -> PathBuf {
        self.inner.path.join("rootfs")
    }

    /// Release this handle; the last release performs the unmount
    pub async fn release(mut self) -> Result<()> {
        self.defused = true;
        let inner = self.inner.clone();
        drop(self);
        if inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            inner.source.unmount(&inner.path).await?;
        }
        Ok(())
    }
}

impl Clone for MountGuard {
    fn clone(&self) -> Self {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: self.inner.clone(),
            manifest: self.manifest.clone(),
            defused: false,
        }
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.defused {
            return;
        }
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // No async context here; the mount point survives until the
            // next lifecycle operation remounts or a reset cleans up.
            warn!(path = %self.inner.path.display(), "image mount dropped without release");
        }
    }
}

/// Mount an image and validate it against the cluster platform
///
/// Fails with `ImageMissing` when the mount has no readable manifest and
/// with `PlatformMismatch` when the manifest does not advertise `platform`.
/// On either failure the image is unmounted before returning.
pub async fn mount_image(
    source: Arc<dyn ImageSource>,
    image: &str,
    platform: &Platform,
) -> Result<MountGuard> {
    let path = source.mount(image).await?;

    let manifest = match read_manifest(&path, image).await {
        Ok(m) => m,
        Err(e) => {
            let _ = source.unmount(&path).await;
            return Err(e);
        }
    };

    if !manifest.supports(platform) {
        let advertised = manifest.platforms.join(", ");
        let _ = source.unmount(&path).await;
        return Err(Error::PlatformMismatch {
            image: image.to_string(),
            wanted: platform.to_string(),
            advertised,
        });
    }

    Ok(MountGuard {
        inner: Arc::new(MountInner {
            source,
            path,
            refs: AtomicUsize::new(1),
        }),
        manifest,
        defused: false,
    })
}

async fn read_manifest(mount: &Path, image: &str) -> Result<ImageManifest> {
    let manifest_path = mount.join("metadata.json");
    let body = tokio::fs::read(&manifest_path).await.map_err(|_| Error::ImageMissing {
        image: image.to_string(),
        message: format!("no metadata.json under {}", mount.display()),
    })?;
    serde_json::from_slice(&body).map_err(|e| Error::ImageMissing {
        image: image.to_string(),
        message: format!("unreadable metadata.json: {e}"),
    })
}

/// Image source for images already materialized on the controller
///
/// keel's image build and OCI transport live outside this subsystem; when
/// the CLI is handed a directory that is already a mounted image tree,
/// this source serves it as-is and unmount is a no-op.
pub struct PreMountedImage {
    dir: PathBuf,
}

impl PreMountedImage {
    /// Serve an existing image tree
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ImageSource for PreMountedImage {
    async fn pull(&self, image: &str, _platform: &Platform, _policy: PullPolicy) -> Result<()> {
        // Nothing to transfer; presence is the only thing to check.
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(Error::ImageMissing {
                image: image.to_string(),
                message: format!("{} is not a directory", self.dir.display()),
            })
        }
    }

    async fn mount(&self, image: &str) -> Result<PathBuf> {
        if self.dir.is_dir() {
            Ok(self.dir.clone())
        } else {
            Err(Error::ImageMissing {
                image: image.to_string(),
                message: format!("{} is not a directory", self.dir.display()),
            })
        }
    }

    async fn unmount(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &Path, body: &str) {
        let mut f = std::fs::File::create(dir.join("metadata.json")).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    fn demo_manifest() -> &'static str {
        r#"{"version": "v1.23.8", "platforms": ["linux/amd64", "linux/arm64"]}"#
    }

    #[tokio::test]
    async fn test_mount_validates_platform() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), demo_manifest());
        let source = Arc::new(PreMountedImage::new(dir.path()));

        let guard = mount_image(source.clone(), "demo:latest", &Platform::default())
            .await
            .unwrap();
        assert_eq!(guard.manifest().version, "v1.23.8");
        guard.release().await.unwrap();

        let riscv = Platform::parse("linux/riscv64").unwrap();
        let err = mount_image(source, "demo:latest", &riscv).await.unwrap_err();
        assert_eq!(err.kind(), "E_PLATFORM");
        assert!(err.to_string().contains("linux/amd64"));
    }

    #[tokio::test]
    async fn test_missing_manifest_is_image_missing() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(PreMountedImage::new(dir.path()));
        let err = mount_image(source, "demo:latest", &Platform::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "E_IMAGE_MISSING");
    }

    #[tokio::test]
    async fn test_missing_dir_is_image_missing() {
        let source = Arc::new(PreMountedImage::new("/nonexistent/keel-image"));
        let err = mount_image(source, "demo:latest", &Platform::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "E_IMAGE_MISSING");
    }

    #[tokio::test]
    async fn test_refcounted_release_unmounts_once() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), demo_manifest());

        let mut source = MockImageSource::new();
        let mount_path = dir.path().to_path_buf();
        source
            .expect_mount()
            .returning(move |_| Ok(mount_path.clone()));
        source.expect_unmount().times(1).returning(|_| Ok(()));

        let guard = mount_image(Arc::new(source), "demo:latest", &Platform::default())
            .await
            .unwrap();
        let second = guard.clone();

        guard.release().await.unwrap();
        // Still mounted: the clone holds a reference
        second.release().await.unwrap();
    }

    #[test]
    fn test_manifest_platform_matching() {
        let manifest = ImageManifest {
            version: "v1.23.8".into(),
            platforms: vec!["linux/amd64".into(), "garbage".into()],
        };
        assert!(manifest.supports(&Platform::default()));
        assert!(!manifest.supports(&Platform::parse("linux/arm64").unwrap()));
    }
}
