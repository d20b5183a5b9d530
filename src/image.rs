//! Image inventory check
//!
//! Provisioning a cluster takes tens of seconds; a missing subject image is
//! only discovered at the very end when the pod fails to start. Check the
//! local store first and fail fast.

use tracing::{debug, info};

use crate::runtime::ContainerRuntime;
use crate::{Error, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Normalize an image reference to `registry/repository:tag`.
///
/// `traefik:v3` and `docker.io/library/traefik:v3` name the same image; the
/// runtime may report either form. Digest references are returned unchanged.
pub fn normalize_image_ref(reference: &str) -> String {
    let reference = reference.trim();
    if reference.contains('@') {
        return reference.to_string();
    }

    let (first, rest) = match reference.split_once('/') {
        Some((first, rest)) => (Some(first), rest),
        None => (None, reference),
    };

    let has_registry =
        first.is_some_and(|f| f.contains('.') || f.contains(':') || f == "localhost");

    let (registry, path) = match (first, has_registry) {
        (Some(registry), true) => (registry.to_string(), rest.to_string()),
        (Some(namespace), false) => (DEFAULT_REGISTRY.to_string(), format!("{}/{}", namespace, rest)),
        (None, _) => (DEFAULT_REGISTRY.to_string(), rest.to_string()),
    };

    let path = if registry == DEFAULT_REGISTRY && !path.contains('/') {
        format!("library/{}", path)
    } else {
        path
    };

    let last_segment = path.rsplit('/').next().unwrap_or(&path);
    if last_segment.contains(':') {
        format!("{}/{}", registry, path)
    } else {
        format!("{}/{}:{}", registry, path, DEFAULT_TAG)
    }
}

/// Verify `image` is present in the local runtime.
///
/// Returns [`Error::ImageNotFound`] when it is not.
pub async fn ensure_image_present<R>(runtime: &R, image: &str) -> Result<()>
where
    R: ContainerRuntime + ?Sized,
{
    let wanted = normalize_image_ref(image);
    let images = runtime.list_images().await?;
    debug!(count = images.len(), image = %wanted, "checking local image inventory");

    if images
        .iter()
        .any(|candidate| normalize_image_ref(&candidate.name) == wanted)
    {
        info!(image = %image, "subject image present locally");
        Ok(())
    } else {
        Err(Error::ImageNotFound {
            image: image.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ImageInfo, MockContainerRuntime};

    #[test]
    fn normalizes_short_names() {
        assert_eq!(normalize_image_ref("traefik"), "docker.io/library/traefik:latest");
        assert_eq!(normalize_image_ref("traefik:v3.3"), "docker.io/library/traefik:v3.3");
        assert_eq!(
            normalize_image_ref("traefik/traefik:latest"),
            "docker.io/traefik/traefik:latest"
        );
        assert_eq!(
            normalize_image_ref("traefik/traefik"),
            "docker.io/traefik/traefik:latest"
        );
    }

    #[test]
    fn keeps_explicit_registries() {
        assert_eq!(
            normalize_image_ref("ghcr.io/org/proxy:dev"),
            "ghcr.io/org/proxy:dev"
        );
        assert_eq!(
            normalize_image_ref("localhost:5000/proxy"),
            "localhost:5000/proxy:latest"
        );
        assert_eq!(
            normalize_image_ref("docker.io/rancher/k3s:v1.29.3-k3s1"),
            "docker.io/rancher/k3s:v1.29.3-k3s1"
        );
        assert_eq!(normalize_image_ref("proxy@sha256:abc"), "proxy@sha256:abc");
    }

    fn runtime_with(images: &[&str]) -> MockContainerRuntime {
        let images: Vec<ImageInfo> = images
            .iter()
            .map(|name| ImageInfo {
                name: name.to_string(),
            })
            .collect();
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_list_images()
            .times(1)
            .returning(move || Ok(images.clone()));
        runtime
    }

    /// Story: the locally built image is found even when the runtime reports a short name
    #[tokio::test]
    async fn story_present_image_passes() {
        let runtime = runtime_with(&["rancher/k3s:v1.29.3-k3s1", "traefik/traefik:latest"]);
        ensure_image_present(&runtime, "docker.io/traefik/traefik:latest")
            .await
            .expect("image should be found");
    }

    /// Story: a missing image fails before any cluster is provisioned
    #[tokio::test]
    async fn story_missing_image_fails_fast() {
        let runtime = runtime_with(&["traefik/traefik:v3.0"]);
        let err = ensure_image_present(&runtime, "traefik/traefik:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageNotFound { ref image } if image == "traefik/traefik:latest"));
    }
}
