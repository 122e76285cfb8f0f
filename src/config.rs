//! Run configuration loaded from YAML.
//!
//! Every field has a default, so a document only needs to list the values
//! it changes:
//!
//! ```yaml
//! branch_criterion: 1       # minimum particles in an exchanged branch
//! sample_bytes: 262144      # splitter sample budget summed over all ranks
//! kernel_width: 2.0         # support radius in units of h
//! resort_threshold: 1.5     # max/min local count ratio that triggers a re-sort
//! max_timestep_halvings: 20
//! initial_dt: 1.0e-3
//! domain_shape: "cube"      # "cube", "sphere" or "full"
//! seed: 42
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::{
    constants::{
        BRANCH_CRITERION, KERNEL_WIDTH, MAX_TIMESTEP_HALVINGS, RESORT_THRESHOLD, SAMPLE_BYTES,
    },
    error::{Result, SphError},
    geometry::DomainShape,
};

/// Parameters of the distribution layer.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SphConfig {
    /// Minimum number of particles in a branch shared with other ranks.
    pub branch_criterion: usize,
    /// Byte budget of the key samples used to find the splitters.
    pub sample_bytes: usize,
    /// Support radius of the kernel in units of the smoothing length.
    pub kernel_width: f64,
    /// Load imbalance above which the particles are sorted again.
    pub resort_threshold: f64,
    /// Cap on the number of halvings of a candidate timestep.
    pub max_timestep_halvings: u32,
    /// Timestep at the start of the run.
    pub initial_dt: f64,
    /// Shape of the region particles are placed in.
    pub domain_shape: DomainShape,
    /// Seed for random number generators.
    pub seed: u64,
}

impl Default for SphConfig {
    fn default() -> Self {
        Self {
            branch_criterion: BRANCH_CRITERION,
            sample_bytes: SAMPLE_BYTES,
            kernel_width: KERNEL_WIDTH,
            resort_threshold: RESORT_THRESHOLD,
            max_timestep_halvings: MAX_TIMESTEP_HALVINGS,
            initial_dt: 1E-3,
            domain_shape: DomainShape::Full,
            seed: 0,
        }
    }
}

impl SphConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: SphConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Check that all values are in range.
    pub fn validate(&self) -> Result<()> {
        if self.branch_criterion == 0 {
            return Err(SphError::Config(
                "branch_criterion must be at least 1".to_string(),
            ));
        }
        if self.sample_bytes == 0 {
            return Err(SphError::Config("sample_bytes must be positive".to_string()));
        }
        if self.kernel_width.is_nan() || self.kernel_width <= 0.0 {
            return Err(SphError::Config(format!(
                "kernel_width must be positive, got {}",
                self.kernel_width
            )));
        }
        if self.resort_threshold.is_nan() || self.resort_threshold < 1.0 {
            return Err(SphError::Config(format!(
                "resort_threshold must be at least 1, got {}",
                self.resort_threshold
            )));
        }
        if self.initial_dt.is_nan() || self.initial_dt <= 0.0 {
            return Err(SphError::Config(format!(
                "initial_dt must be positive, got {}",
                self.initial_dt
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::SphConfig;
    use crate::{error::SphError, geometry::DomainShape};

    #[test]
    fn test_defaults() {
        let config = SphConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, SphConfig::default());
        assert_eq!(config.branch_criterion, 1);
        assert_eq!(config.sample_bytes, 256 * 1024);
        assert_eq!(config.max_timestep_halvings, 20);
    }

    #[test]
    fn test_parse() {
        let yaml = "
kernel_width: 3.0
domain_shape: sphere
seed: 7
";
        let config = SphConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.kernel_width, 3.0);
        assert_eq!(config.domain_shape, DomainShape::Sphere);
        assert_eq!(config.seed, 7);
        assert_eq!(config.resort_threshold, SphConfig::default().resort_threshold);
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            SphConfig::from_yaml_str("kernel_width: -1.0"),
            Err(SphError::Config(_))
        ));
        assert!(matches!(
            SphConfig::from_yaml_str("domain_shape: torus"),
            Err(SphError::Yaml(_))
        ));
        assert!(matches!(
            SphConfig::from_yaml_str("no_such_field: 1"),
            Err(SphError::Yaml(_))
        ));
        assert!(matches!(
            SphConfig::from_file("/nonexistent/config.yaml"),
            Err(SphError::Io(_))
        ));
    }
}
