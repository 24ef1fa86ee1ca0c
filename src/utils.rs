//! Utility functions shared across the training driver

use std::fs;
use std::path::Path;

use crate::error::Result;

/// File I/O utilities
pub mod io {
    use super::*;

    /// Ensure directory exists
    pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Write a file through a temporary sibling and rename it into place
    pub fn write_file_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<()> {
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");

        fs::write(&temp_path, content)?;
        fs::rename(temp_path, path)?;

        Ok(())
    }
}

/// Performance timing utilities
pub mod timing {
    use std::time::{Duration, Instant};

    /// Simple timer for measuring performance
    pub struct Timer {
        start: Instant,
        name: String,
    }

    impl Timer {
        /// Start a new timer
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                start: Instant::now(),
                name: name.into(),
            }
        }

        /// Get elapsed time
        pub fn elapsed(&self) -> Duration {
            self.start.elapsed()
        }

        /// Stop timer and log result
        pub fn stop(self) -> Duration {
            let elapsed = self.elapsed();
            tracing::debug!("Timer '{}' elapsed: {:.2}s", self.name, elapsed.as_secs_f64());
            elapsed
        }
    }
}

/// Deterministic seed derivation
pub mod seed {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    /// Mix a base seed with a label into a new, stable seed (FNV-1a)
    pub fn derive(base: u64, label: &str) -> u64 {
        let mut hash = FNV_OFFSET;
        for byte in base.to_le_bytes().iter().chain(label.as_bytes()) {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// Mix a base seed with integer coordinates
    pub fn derive_indexed(base: u64, parts: &[u64]) -> u64 {
        let mut hash = FNV_OFFSET ^ base;
        for part in parts {
            for byte in part.to_le_bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }
        hash
    }
}
