//! Runtime and store configuration.

use crate::error::{StemResult, ValidationError};

/// Configuration for the calculation runtime and progress fan-out.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of worker threads, each able to run one full calculation.
    pub workers: usize,
    /// Maximum queued run requests.
    pub queue_capacity: usize,
    /// Buffered progress events before the reporter starts dropping.
    pub reporter_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            reporter_capacity: 1024,
        }
    }
}

impl PipelineConfig {
    /// Checks that every capacity is non-zero.
    ///
    /// # Errors
    /// Returns `ValidationError::BelowMinimum` naming the offending field.
    pub fn validate(self) -> StemResult<Self> {
        for (field, actual) in [
            ("workers", self.workers),
            ("queue_capacity", self.queue_capacity),
            ("reporter_capacity", self.reporter_capacity),
        ] {
            if actual == 0 {
                return Err(ValidationError::BelowMinimum {
                    field,
                    min: 1,
                    actual: 0,
                }
                .into());
            }
        }
        Ok(self)
    }
}

/// Configuration for the file-backed output container.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to fsync after every flush (slower but safer).
    pub sync_on_flush: bool,
    /// Largest encoded container body accepted on open (bytes).
    pub max_file_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_flush: true,
            max_file_size: 4 * 1024 * 1024 * 1024, // 4 GiB
        }
    }
}

impl StoreConfig {
    const MIN_FILE_SIZE: u64 = 64 * 1024;

    /// Checks the size limit.
    ///
    /// # Errors
    /// Returns `ValidationError::BelowMinimum` if `max_file_size` is too small
    /// to hold an empty layout.
    pub fn validate(self) -> StemResult<Self> {
        if self.max_file_size < Self::MIN_FILE_SIZE {
            return Err(ValidationError::BelowMinimum {
                field: "max_file_size",
                min: Self::MIN_FILE_SIZE,
                actual: self.max_file_size,
            }
            .into());
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(StoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cfg = PipelineConfig {
            workers: 0,
            ..PipelineConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err}").contains("workers"));
    }

    #[test]
    fn test_tiny_file_limit_rejected() {
        let cfg = StoreConfig {
            max_file_size: 1024,
            ..StoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
