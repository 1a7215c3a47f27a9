pub mod macros {
    /// Returns the package description, made of the crate name and version.
    #[macro_export]
    macro_rules! package_description {
        () => {
            concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))
        };
    }

    /// Gets package's version info as a static str.
    #[macro_export]
    macro_rules! version_info_str {
        () => {
            env!("CARGO_PKG_VERSION")
        };
    }

    /// Formats package related information.
    #[macro_export]
    macro_rules! fmt_package_info {
        () => {{
            format!(
                "{} (utils {})",
                $crate::package_description!(),
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

/// The version of the shared utils crate as a String.
pub fn raw_version_string() -> String {
    String::from(raw_version_str())
}

/// The version of the shared utils crate.
pub fn raw_version_str() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
