use std::error::Error;
use std::fmt;

/// How a thread waits between two failed compare-and-swap attempts on
/// the same logical page.
///
/// Retrying is always correct, so this only trades CPU burn for latency
/// under contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Spin `2^min(attempt, limit)` times before retrying.
    Exponential {
        /// Upper bound on the exponent, at most 16.
        limit: u32,
    },
    /// Yield the time slice of the current thread before retrying.
    Yield,
}

impl Backoff {
    pub(crate) fn snooze(self, attempt: usize) {
        match self {
            Backoff::None => {}
            Backoff::Exponential { limit } => {
                let exponent = attempt.min(limit.min(MAX_BACKOFF_LIMIT) as usize);
                for _ in 0..(1_usize << exponent) {
                    std::hint::spin_loop();
                }
            }
            Backoff::Yield => std::thread::yield_now(),
        }
    }
}

const MAX_BACKOFF_LIMIT: u32 = 16;

/// Tuning knobs of a [`BwTree`](crate::BwTree).
///
/// The defaults are reasonable for fixed-width keys and values. Smaller
/// pages make structure modifications far more frequent, which is mostly
/// useful for testing.
///
/// # Examples
///
/// ```
/// let config = bwtree::Config::default()
///     .with_leaf_size(4, 64)
///     .with_delta_chain_length(4, 2);
///
/// assert!(config.validate().is_ok());
///
/// let mut tree = bwtree::BwTree::<u32, u32>::with_config(config);
/// tree.assign_gc_id(0);
/// assert!(tree.insert(1, 1));
/// tree.unregister_thread(0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// A leaf page holding more (key, value) pairs than this is split.
    pub leaf_max_size: usize,
    /// A leaf page holding fewer pairs than this is merged into its left
    /// sibling.
    pub leaf_min_size: usize,
    /// An inner page holding more routing entries than this is split.
    pub inner_max_size: usize,
    /// An inner page holding fewer routing entries than this is merged into
    /// its left sibling.
    pub inner_min_size: usize,
    /// Leaf chains with more delta records than this are consolidated.
    pub leaf_delta_chain_length: usize,
    /// Inner chains with more delta records than this are consolidated.
    pub inner_delta_chain_length: usize,
    /// Number of retired items waiting in sealed bags that triggers an epoch
    /// advance and a reclamation pass.
    pub gc_threshold: usize,
    /// Retry policy for contended compare-and-swap installs.
    pub backoff: Backoff,
    /// Per-thread garbage collection slots reserved at construction.
    pub initial_gc_slots: usize,
}

impl Default for Config {
    #[cfg(not(feature = "fuzz_constants"))]
    fn default() -> Config {
        Config {
            leaf_max_size: 128,
            leaf_min_size: 8,
            inner_max_size: 64,
            inner_min_size: 4,
            leaf_delta_chain_length: 8,
            inner_delta_chain_length: 4,
            gc_threshold: 1024,
            backoff: Backoff::Exponential { limit: 6 },
            initial_gc_slots: 1,
        }
    }

    #[cfg(feature = "fuzz_constants")]
    fn default() -> Config {
        Config {
            leaf_max_size: 4,
            leaf_min_size: 1,
            inner_max_size: 4,
            inner_min_size: 1,
            leaf_delta_chain_length: 2,
            inner_delta_chain_length: 2,
            gc_threshold: 8,
            backoff: Backoff::None,
            initial_gc_slots: 1,
        }
    }
}

impl Config {
    /// Sets the merge and split thresholds of leaf pages.
    pub const fn with_leaf_size(mut self, min: usize, max: usize) -> Config {
        self.leaf_min_size = min;
        self.leaf_max_size = max;
        self
    }

    /// Sets the merge and split thresholds of inner pages.
    pub const fn with_inner_size(mut self, min: usize, max: usize) -> Config {
        self.inner_min_size = min;
        self.inner_max_size = max;
        self
    }

    /// Sets the consolidation triggers for leaf and inner delta chains.
    pub const fn with_delta_chain_length(mut self, leaf: usize, inner: usize) -> Config {
        self.leaf_delta_chain_length = leaf;
        self.inner_delta_chain_length = inner;
        self
    }

    /// Sets how much sealed garbage accumulates before reclamation runs.
    pub const fn with_gc_threshold(mut self, gc_threshold: usize) -> Config {
        self.gc_threshold = gc_threshold;
        self
    }

    /// Sets the retry policy for contended installs.
    pub const fn with_backoff(mut self, backoff: Backoff) -> Config {
        self.backoff = backoff;
        self
    }

    /// Sets the number of garbage collection slots reserved up front.
    pub const fn with_initial_gc_slots(mut self, initial_gc_slots: usize) -> Config {
        self.initial_gc_slots = initial_gc_slots;
        self
    }

    /// Checks that the thresholds describe a tree that can make progress.
    ///
    /// A split must leave both halves above the merge threshold, otherwise
    /// the two structure modifications would undo each other forever.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, min, max) in [
            (PageKind::Leaf, self.leaf_min_size, self.leaf_max_size),
            (PageKind::Inner, self.inner_min_size, self.inner_max_size),
        ] {
            if max < 4 {
                return Err(ConfigError::PageTooSmall { kind, max });
            }
            if min >= max / 2 {
                return Err(ConfigError::MergeAboveSplitHalf { kind, min, max });
            }
        }

        if self.leaf_delta_chain_length == 0 || self.inner_delta_chain_length == 0 {
            return Err(ConfigError::EmptyDeltaChain);
        }

        if self.gc_threshold == 0 {
            return Err(ConfigError::ZeroGcThreshold);
        }

        if let Backoff::Exponential { limit } = self.backoff {
            if limit > MAX_BACKOFF_LIMIT {
                return Err(ConfigError::BackoffTooLong { limit });
            }
        }

        Ok(())
    }
}

/// The kind of page a [`ConfigError`] complains about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Pages holding (key, value) pairs.
    Leaf,
    /// Pages holding routing entries.
    Inner,
}

/// Returned by [`Config::validate`] for thresholds that cannot work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The split threshold leaves no room for a meaningful split.
    PageTooSmall {
        /// Which page kind is misconfigured.
        kind: PageKind,
        /// The rejected split threshold.
        max: usize,
    },
    /// Halves produced by a split would immediately qualify for a merge.
    MergeAboveSplitHalf {
        /// Which page kind is misconfigured.
        kind: PageKind,
        /// The rejected merge threshold.
        min: usize,
        /// The split threshold it was checked against.
        max: usize,
    },
    /// A delta chain length of zero would consolidate on every update.
    EmptyDeltaChain,
    /// Garbage would never be allowed to accumulate into bags.
    ZeroGcThreshold,
    /// Exponential backoff beyond `2^16` spins.
    BackoffTooLong {
        /// The rejected exponent limit.
        limit: u32,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::PageTooSmall { kind, max } => {
                write!(f, "{kind:?} split threshold {max} must be at least 4")
            }
            ConfigError::MergeAboveSplitHalf { kind, min, max } => write!(
                f,
                "{kind:?} merge threshold {min} must be below half of the split threshold {max}"
            ),
            ConfigError::EmptyDeltaChain => f.write_str("delta chain lengths must be non-zero"),
            ConfigError::ZeroGcThreshold => f.write_str("gc_threshold must be non-zero"),
            ConfigError::BackoffTooLong { limit } => write!(
                f,
                "exponential backoff limit {limit} exceeds {MAX_BACKOFF_LIMIT}"
            ),
        }
    }
}

impl Error for ConfigError {}

#[test]
fn default_config_is_valid() {
    assert_eq!(Config::default().validate(), Ok(()));
}

#[test]
fn rejects_merge_threshold_above_split_half() {
    let config = Config::default().with_leaf_size(64, 128);
    assert_eq!(
        config.validate(),
        Err(ConfigError::MergeAboveSplitHalf {
            kind: PageKind::Leaf,
            min: 64,
            max: 128
        })
    );

    let config = Config::default().with_inner_size(0, 3);
    assert_eq!(
        config.validate(),
        Err(ConfigError::PageTooSmall {
            kind: PageKind::Inner,
            max: 3
        })
    );
}

#[test]
fn rejects_degenerate_knobs() {
    let config = Config::default().with_delta_chain_length(0, 4);
    assert_eq!(config.validate(), Err(ConfigError::EmptyDeltaChain));

    let config = Config::default().with_gc_threshold(0);
    assert_eq!(config.validate(), Err(ConfigError::ZeroGcThreshold));

    let config = Config::default().with_backoff(Backoff::Exponential { limit: 40 });
    assert_eq!(
        config.validate(),
        Err(ConfigError::BackoffTooLong { limit: 40 })
    );
    assert!(config
        .validate()
        .unwrap_err()
        .to_string()
        .contains("exceeds 16"));
}
