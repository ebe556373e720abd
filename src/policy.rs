//! Image policy: normalization, registry allow-listing, digest pin-through.
//!
//! Every image reference entering `spawn` passes through here before the
//! runtime adapter sees it. The policy rejects references from registries
//! outside the configured allow-list (and, when an explicit image
//! allow-list is configured, anything not on it) with `image_policy`.

use crate::config::Config;
use crate::constants::MAX_IMAGE_REF_LEN;
use crate::error::{Error, Result};

/// A policy-validated, normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// The reference as the client sent it.
    pub requested: String,
    /// Fully-qualified reference (registry/repository:tag or @digest).
    pub resolved_ref: String,
    /// Digest portion, when the reference carried a pin.
    pub digest: Option<String>,
    /// Registry host the reference points at.
    pub registry: String,
}

/// Image validation and normalization policy.
#[derive(Debug, Clone)]
pub struct ImagePolicy {
    allowed_registries: Vec<String>,
    allowed_images: Vec<String>,
}

impl ImagePolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            allowed_registries: config.allowed_registries.clone(),
            allowed_images: config.allowed_images.clone(),
        }
    }

    /// Validates and normalizes an image reference.
    pub fn resolve(&self, requested: &str) -> Result<ResolvedImage> {
        if requested.is_empty() || requested.len() > MAX_IMAGE_REF_LEN {
            return Err(Error::ImagePolicy {
                image: truncate_for_display(requested),
                reason: format!("reference length must be 1..={MAX_IMAGE_REF_LEN}"),
            });
        }
        if requested.chars().any(char::is_whitespace) {
            return Err(Error::ImagePolicy {
                image: truncate_for_display(requested),
                reason: "reference contains whitespace".to_string(),
            });
        }

        let normalized = normalize(requested);
        let registry = extract_registry(&normalized);

        if !self.allowed_registries.iter().any(|r| r == &registry) {
            return Err(Error::ImagePolicy {
                image: requested.to_string(),
                reason: format!(
                    "registry '{registry}' is not in the allow-list ({})",
                    self.allowed_registries.join(", ")
                ),
            });
        }

        if !self.allowed_images.is_empty()
            && !self
                .allowed_images
                .iter()
                .any(|allowed| allowed == requested || allowed == &normalized)
        {
            return Err(Error::ImagePolicy {
                image: requested.to_string(),
                reason: "image is not in the explicit allow-list".to_string(),
            });
        }

        let digest = normalized
            .split_once('@')
            .map(|(_, digest)| digest.to_string());

        Ok(ResolvedImage {
            requested: requested.to_string(),
            resolved_ref: normalized,
            digest,
            registry,
        })
    }
}

/// Expands shorthand references to fully-qualified ones:
/// `python:3.11` → `docker.io/library/python:3.11`,
/// `user/app` → `docker.io/user/app`.
fn normalize(image_ref: &str) -> String {
    // Separate any digest pin before path analysis.
    let (path, digest) = match image_ref.split_once('@') {
        Some((p, d)) => (p, Some(d)),
        None => (image_ref, None),
    };

    let normalized_path = if !path.contains('/') {
        format!("docker.io/library/{path}")
    } else {
        let first = path.split('/').next().unwrap_or_default();
        if first.contains('.') || first.contains(':') || first == "localhost" {
            path.to_string()
        } else {
            format!("docker.io/{path}")
        }
    };

    match digest {
        Some(d) => format!("{normalized_path}@{d}"),
        None => normalized_path,
    }
}

/// Extracts the registry host from a fully-qualified reference.
fn extract_registry(normalized: &str) -> String {
    normalized
        .split('/')
        .next()
        .unwrap_or("docker.io")
        .to_string()
}

fn truncate_for_display(s: &str) -> String {
    s.chars().take(64).collect()
}
