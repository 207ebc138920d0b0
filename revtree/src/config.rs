//! Tree and workload configuration.
//!
//! Trees are configured by value through `TreeConfig`. The demo binary
//! additionally loads a `WorkloadConfig` from environment variables.
//!
//! # Environment Variables
//!
//! - `REVTREE_ORDER`: Tree order, at least 6 (default: `32`)
//! - `REVTREE_ENTRIES`: Number of entries the demo workload inserts (default: `10000`)
//! - `REVTREE_SEED`: Seed for the demo workload key generator (default: `42`)
//!
//! # Invariants
//!
//! - A validated `TreeConfig` always has `order >= TreeConfig::MIN_ORDER`
//! - `min_entries() <= max_entries() / 2`, so a split always yields two
//!   halves that satisfy the lower bound

/// B-tree shape parameters.
///
/// # Post-conditions
///
/// When constructed via `new()` or `from_env()`:
/// - `order >= MIN_ORDER`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Maximal number of children of an internal node.
    pub order: usize,
}

/// Error returned when loading or validating configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The tree order is below the supported minimum.
    OrderTooSmall { order: usize, min: usize },
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrderTooSmall { order, min } => {
                write!(f, "tree order {order} is too small (must be at least {min})")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            order: Self::DEFAULT_ORDER,
        }
    }
}

impl TreeConfig {
    /// Smallest supported order.
    pub const MIN_ORDER: usize = 6;
    /// Order used when none is configured.
    pub const DEFAULT_ORDER: usize = 32;

    /// Create a validated configuration.
    pub fn new(order: usize) -> Result<Self, ConfigError> {
        let config = Self { order };
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration describes a usable tree.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.order < Self::MIN_ORDER {
            return Err(ConfigError::OrderTooSmall {
                order: self.order,
                min: Self::MIN_ORDER,
            });
        }
        Ok(())
    }

    /// Maximal number of entries in any node.
    #[must_use]
    pub const fn max_entries(&self) -> usize {
        self.order - 1
    }

    /// Minimal number of entries in any non-root node.
    #[must_use]
    pub const fn min_entries(&self) -> usize {
        self.order / 2 - 1
    }

    /// Load the tree configuration from environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `REVTREE_ORDER` is set but is not a number, or is
    /// below `MIN_ORDER`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let order = load_usize("REVTREE_ORDER", Self::DEFAULT_ORDER)?;
        Self::new(order)
    }
}

/// Parameters of the demo workload run by the `revtree` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadConfig {
    /// Shape of the tree being exercised.
    pub tree: TreeConfig,
    /// Number of distinct keys to insert.
    pub entries: usize,
    /// Seed for the key generator.
    pub seed: u64,
}

impl WorkloadConfig {
    /// Default number of inserted entries.
    pub const DEFAULT_ENTRIES: usize = 10_000;
    /// Default generator seed.
    pub const DEFAULT_SEED: u64 = 42;

    /// Load the workload configuration from environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let tree = TreeConfig::from_env()?;
        let entries = load_usize("REVTREE_ENTRIES", Self::DEFAULT_ENTRIES)?;
        let seed = match std::env::var("REVTREE_SEED") {
            Ok(value) => value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                name: "REVTREE_SEED".to_string(),
                message: format!("'{value}' is not a valid seed"),
            })?,
            Err(_) => Self::DEFAULT_SEED,
        };

        Ok(Self {
            tree,
            entries,
            seed,
        })
    }
}

/// Load a non-negative integer from environment, falling back to `default`
/// when the variable is not set.
fn load_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a valid non-negative integer"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(TreeConfig::default().order, 32);
        assert_eq!(WorkloadConfig::DEFAULT_ENTRIES, 10_000);
        assert_eq!(WorkloadConfig::DEFAULT_SEED, 42);
    }

    #[test]
    fn test_entry_bounds() {
        let config = TreeConfig::new(6).expect("order 6 is valid");
        assert_eq!(config.max_entries(), 5);
        assert_eq!(config.min_entries(), 2);

        let config = TreeConfig::new(7).expect("order 7 is valid");
        assert_eq!(config.max_entries(), 6);
        assert_eq!(config.min_entries(), 2);
    }

    #[test]
    fn test_order_too_small() {
        assert_eq!(
            TreeConfig::new(5),
            Err(ConfigError::OrderTooSmall { order: 5, min: 6 })
        );
        assert!(TreeConfig { order: 3 }.validate().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::OrderTooSmall { order: 4, min: 6 };
        assert_eq!(
            error.to_string(),
            "tree order 4 is too small (must be at least 6)"
        );

        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
