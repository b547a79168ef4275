//! Configuration management for trellis
//!
//! Provides presets for different deployment sizes and a validate() that
//! rejects geometries the allocator cannot work with.

/// Engine configuration with size presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial number of slots in the id directory (the file doubles on demand)
    pub max_objects: u64,
    /// Size of one allocation region in the payload file (bytes)
    pub initial_region_size: u64,
    /// Evacuate the smallest region when it falls below this fraction of capacity
    pub compaction_trigger: f64,
}

impl Config {
    /// Server-class: sized for a full chain-state working set
    pub fn server() -> Self {
        Self {
            max_objects: 1_000_000,
            initial_region_size: 64 * 1024 * 1024,
            compaction_trigger: 0.5,
        }
    }

    /// Small: embedded use and test suites; keeps both files under a few MB
    pub fn small() -> Self {
        Self {
            max_objects: 64 * 1024,
            initial_region_size: 1024 * 1024,
            compaction_trigger: 0.5,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_objects < 64 {
            return Err("max_objects must be >= 64".into());
        }
        if self.initial_region_size < 64 * 1024 {
            return Err("initial_region_size must be >= 64KB".into());
        }
        if self.initial_region_size % 4096 != 0 {
            return Err("initial_region_size must be a multiple of the page size".into());
        }
        if self.compaction_trigger <= 0.0 || self.compaction_trigger >= 1.0 {
            return Err("compaction_trigger must be in (0.0, 1.0)".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::server()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::server().validate().is_ok());
        assert!(Config::small().validate().is_ok());
    }

    #[test]
    fn test_bad_region_size_rejected() {
        let mut c = Config::small();
        c.initial_region_size = 4096;
        assert!(c.validate().is_err());
        c.initial_region_size = 65_537;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_bad_trigger_rejected() {
        let mut c = Config::small();
        c.compaction_trigger = 0.0;
        assert!(c.validate().is_err());
        c.compaction_trigger = 1.0;
        assert!(c.validate().is_err());
    }
}
