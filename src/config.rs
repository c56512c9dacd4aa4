//! Registry configuration
//!
//! Bounds the amount of memory a registry and its contexts may claim. Hitting a
//! bound surfaces as `ContextError::ResourceExhausted` from the growing
//! operation instead of aborting.

/// Per-context limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextLimits {
    /// Maximum number of known fingerprints for one peer
    pub max_fingerprints: usize,
    /// Maximum size in bytes of the retained MAC key buffer
    pub max_saved_mac_keys_len: usize,
    /// Maximum size in bytes of a preshared secret
    pub max_preshared_secret_len: usize,
}

impl ContextLimits {
    /// Production values
    pub const PROD: Self = Self {
        max_fingerprints: 4096,
        max_saved_mac_keys_len: 1024 * 1024,   // 1 MB
        max_preshared_secret_len: 64 * 1024,   // 64 KB
    };

    /// Test values
    pub const TEST: Self = Self {
        max_fingerprints: 64,
        max_saved_mac_keys_len: 4 * 1024,      // 4 KB
        max_preshared_secret_len: 1024,        // 1 KB
    };

    /// Tiny values for limit tests
    pub const TINY: Self = Self {
        max_fingerprints: 2,
        max_saved_mac_keys_len: 40,            // two SHA-1 MAC keys
        max_preshared_secret_len: 16,
    };
}

impl Default for ContextLimits {
    fn default() -> Self {
        #[cfg(any(test, feature = "test-constants"))]
        { Self::TEST }
        #[cfg(not(any(test, feature = "test-constants")))]
        { Self::PROD }
    }
}

/// Registry configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Maximum number of contexts held at once
    pub max_contexts: usize,
    /// Limits copied into every context the registry creates
    pub context: ContextLimits,
}

impl RegistryConfig {
    /// Create config with default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config with custom per-context limits
    pub fn with_limits(max_contexts: usize, context: ContextLimits) -> Self {
        Self { max_contexts, context }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        #[cfg(any(test, feature = "test-constants"))]
        let max_contexts = 256;
        #[cfg(not(any(test, feature = "test-constants")))]
        let max_contexts = 1 << 20;

        Self {
            max_contexts,
            context: ContextLimits::default(),
        }
    }
}
