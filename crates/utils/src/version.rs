use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Version reported by `--version` and logged at startup, e.g.
/// `v0.3.1-1a2b3c4-dirty`.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format_version(
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1,
        BUILD_INFO.git_dirty(),
    )
});

fn format_version(image_version: &str, commit: Option<&str>, dirty: bool) -> String {
    format!(
        "{}-{}{}",
        image_version,
        commit.unwrap_or("unknown"),
        if dirty { "-dirty" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn version_without_git_state() {
        assert_eq!(format_version("latest", None, false), "latest-unknown");
    }

    #[test]
    fn dirty_tree_is_marked() {
        assert_eq!(
            format_version("v0.1.0", Some("1a2b3c4"), true),
            "v0.1.0-1a2b3c4-dirty"
        );
    }
}
