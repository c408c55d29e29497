//! Container image references and name normalization.

use anyhow::bail;

use super::Container;

/// A container image with a specific version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub version: String,
}

/// Splits an image reference on its last `:` into name and version. The
/// version defaults to `latest` when no tag is present.
pub fn parse_image_name(reference: &str) -> Image {
    match reference.rfind(':') {
        Some(idx) => Image {
            name: reference[..idx].to_string(),
            version: reference[idx + 1..].to_string(),
        },
        None => Image {
            name: reference.to_string(),
            version: "latest".to_string(),
        },
    }
}

/// Extracts the image references of a container list.
pub fn extract_image_list(containers: &[Container]) -> Vec<Image> {
    containers.iter().map(|c| parse_image_name(&c.image)).collect()
}

/// Turns an image reference into a fully qualified one.
///
/// References without an explicit registry domain get `default_domain`
/// prepended (and `library/` inserted for single-segment names, matching
/// the normalization container registries apply). References that already
/// carry a domain are returned unchanged. A trailing tag is preserved as
/// given.
pub fn parse_fqin(reference: &str, default_domain: &str) -> anyhow::Result<String> {
    if reference.is_empty() {
        bail!("invalid reference format: empty image name");
    }

    // A colon only denotes a tag when it appears after the last path
    // separator; otherwise it is a registry port.
    let (repo, tag) = match (reference.rfind(':'), reference.rfind('/')) {
        (Some(colon), Some(slash)) if colon > slash => {
            (&reference[..colon], Some(&reference[colon + 1..]))
        }
        (Some(colon), None) => (&reference[..colon], Some(&reference[colon + 1..])),
        _ => (reference, None),
    };

    if repo.is_empty() {
        bail!("invalid reference format: missing image name in {:?}", reference);
    }

    let qualified = match repo.split_once('/') {
        Some((first, _)) if is_registry_domain(first) => repo.to_string(),
        Some(_) => format!("{}/{}", default_domain, repo),
        None => format!("{}/library/{}", default_domain, repo),
    };

    match tag {
        Some(tag) => Ok(format!("{}:{}", qualified, tag)),
        None => Ok(qualified),
    }
}

// A first path segment counts as a registry domain when it looks like a
// hostname rather than a namespace.
fn is_registry_domain(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}
