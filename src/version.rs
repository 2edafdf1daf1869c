//! The WA Web version 4-tuple sent in the client payload. Upstream clients
//! scrape this from the web app's bundle at runtime; this core ships a
//! fixed fallback instead and lets the embedder override it, since scraping
//! a third-party web page is outside what this crate owns.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaWebVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl WaWebVersion {
    /// A version 4-tuple known to be accepted by the server at the time
    /// this core was written. Embedders that need to track upstream
    /// releases should supply their own via `WaClientConfig`.
    pub const fn fallback() -> Self {
        Self { major: 2, minor: 3000, patch: 1023223821, build: 0 }
    }
}

impl Default for WaWebVersion {
    fn default() -> Self {
        Self::fallback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_is_the_default() {
        assert_eq!(WaWebVersion::default(), WaWebVersion::fallback());
    }
}
