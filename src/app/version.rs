#[derive(Debug)]
pub struct Version {
    pub build_profile: &'static str,
    pub version: &'static str,
}

impl Version {
    pub fn new() -> Self {
        let build_profile = if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        };

        Self {
            build_profile,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::new()
    }
}
