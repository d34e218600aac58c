/// SDK name and version reported with fetch requests and attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdkMetadata {
    /// SDK name, sent as `sdkName`.
    pub name: &'static str,
    /// SDK version, sent as `sdkVersion`.
    pub version: &'static str,
}

impl SdkMetadata {
    /// Metadata of this crate.
    pub const CURRENT: SdkMetadata = SdkMetadata {
        name: "rust",
        version: env!("CARGO_PKG_VERSION"),
    };
}

impl Default for SdkMetadata {
    fn default() -> Self {
        SdkMetadata::CURRENT
    }
}
