//! Walker configuration.
//!
//! Defaults target the build architecture and keep the extra verification
//! tied to debug builds.

use crate::arch::{self, FrameLayout};

/// Configuration for stack walking.
///
/// # Example
///
/// ```ignore
/// use prism_frame::{WalkConfig, arch};
///
/// // Walk synthetic AArch64 stacks on any host, with full verification.
/// let config = WalkConfig {
///     layout: &arch::aarch64::LAYOUT,
///     verify_frames: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct WalkConfig {
    /// Architecture constant table.
    ///
    /// Default: [`arch::HOST`]
    pub layout: &'static FrameLayout,

    /// Maximum number of frames a [`crate::FrameStream`] visits before it
    /// reports [`crate::WalkError::DepthLimitExceeded`].
    ///
    /// Default: 16384
    pub max_depth: usize,

    /// Check that a compiled frame's sender sp equals the frame's real fp
    /// on every native-stack transition. Transitions patched at a
    /// continuation return barrier are exempt. The strictly increasing
    /// frame identity check in [`crate::FrameStream`] always runs.
    ///
    /// Default: on in debug builds
    pub verify_frames: bool,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            layout: arch::HOST,
            max_depth: 16 * 1024,
            verify_frames: cfg!(debug_assertions),
        }
    }
}

impl WalkConfig {
    /// Small depth bound and all checks on.
    pub fn for_testing() -> Self {
        Self {
            layout: arch::HOST,
            max_depth: 256,
            verify_frames: true,
        }
    }

    /// Same configuration with a different architecture table.
    pub fn with_layout(mut self, layout: &'static FrameLayout) -> Self {
        self.layout = layout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WalkConfig::default();
        assert_eq!(config.layout, arch::HOST);
        assert_eq!(config.max_depth, 16 * 1024);
        assert_eq!(config.verify_frames, cfg!(debug_assertions));
    }

    #[test]
    fn test_for_testing() {
        let config = WalkConfig::for_testing().with_layout(&arch::aarch64::LAYOUT);
        assert!(config.verify_frames);
        assert_eq!(config.layout.name, "aarch64");
    }
}
