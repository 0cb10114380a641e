use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown"),
        if is_dirty(option_env!("VERGEN_GIT_DIRTY")) {
            "-dirty"
        } else {
            ""
        }
    )
});

fn is_dirty(flag: Option<&str>) -> bool {
    matches!(flag, Some("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_flag_parsing() {
        assert!(is_dirty(Some("true")));
        assert!(!is_dirty(Some("false")));
        assert!(!is_dirty(None));
    }

    #[test]
    fn version_starts_with_image_version() {
        assert!(VERSION.starts_with(env!("IMAGE_VERSION")));
    }
}
