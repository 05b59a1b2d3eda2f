pub mod macros {
    /// Formats package related information.
    /// This includes the package name and version, and commit info.
    #[macro_export]
    macro_rules! fmt_package_info {
        () => {{
            format!(
                "{} {} ({})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                $crate::raw_version_str()
            )
        }};
    }

    /// Prints package related information.
    #[macro_export]
    macro_rules! print_package_info {
        () => {
            println!("{}", $crate::fmt_package_info!());
        };
    }
}

/// The git revision baked into the build, or "unknown" outside of CI.
pub fn raw_version_str() -> &'static str {
    option_env!("GIT_VERSION").unwrap_or("unknown")
}

/// Same as [`raw_version_str`], owned.
pub fn raw_version_string() -> String {
    String::from(raw_version_str())
}
