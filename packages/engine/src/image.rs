//! Image reference helpers for the pull policy.

/// True when the reference has no tag, or its tag is `latest`. Digested
/// references are always considered pinned.
pub fn is_latest(image: &str) -> bool {
    if image.contains('@') {
        return false;
    }
    let name = image.rsplit('/').next().unwrap_or(image);
    match name.split_once(':') {
        Some((_, tag)) => tag == "latest",
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpinned_references_are_latest() {
        assert!(is_latest("alpine"));
        assert!(is_latest("alpine:latest"));
        assert!(is_latest("docker.io/library/alpine"));
    }

    #[test]
    fn pinned_references_are_not_latest() {
        assert!(!is_latest("alpine:3"));
        assert!(!is_latest("registry:5000/team/tool:v1.2"));
        assert!(!is_latest(
            "alpine@sha256:0000000000000000000000000000000000000000000000000000000000000000"
        ));
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        assert!(is_latest("registry:5000/team/tool"));
    }
}
