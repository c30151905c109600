//! Transform plan cache with best-effort persistence
//!
//! Plans are immutable once built, so channels that share a transform size
//! share the plan handle; each channel still owns its buffers and scratch.
//! The cache remembers which sizes were planned and can persist that list so
//! the next run plans them up front, before any audio flows. Persistence is
//! purely an optimization: failures are logged and ignored.

use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const CACHE_VERSION: u32 = 1;

/// Forward and inverse plans for one transform size
#[derive(Clone)]
pub struct PlanPair {
    pub forward: Arc<dyn RealToComplex<f32>>,
    pub inverse: Arc<dyn ComplexToReal<f32>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlanCacheFile {
    version: u32,
    fft_sizes: Vec<usize>,
}

/// Cache of real FFT plans keyed by transform size
pub struct PlanCache {
    plans: BTreeMap<usize, PlanPair>,
    path: Option<PathBuf>,
}

impl PlanCache {
    /// A cache that is never persisted
    pub fn in_memory() -> Self {
        Self {
            plans: BTreeMap::new(),
            path: None,
        }
    }

    /// Default location of the persisted cache
    ///
    /// Returns `~/.cache/impulse/plans.json` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|p| p.join("impulse").join("plans.json"))
    }

    /// Open a persisted cache, planning every size it lists
    ///
    /// A missing or unreadable file leaves the cache empty.
    #[instrument]
    pub fn load(path: PathBuf) -> Self {
        let mut cache = Self {
            plans: BTreeMap::new(),
            path: Some(path.clone()),
        };

        match read_cache_file(&path) {
            Ok(sizes) => {
                let mut planner = RealFftPlanner::<f32>::new();
                for size in sizes.into_iter().filter(|&n| n > 0) {
                    cache.plans.insert(size, plan_pair(&mut planner, size));
                }
                info!(
                    path = %path.display(),
                    sizes = cache.plans.len(),
                    "Loaded plan cache"
                );
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed loading plan cache, continuing anyway"
                );
            }
        }

        cache
    }

    /// Plans for `fft_size`, built on first request
    pub fn plan(&mut self, fft_size: usize) -> PlanPair {
        self.plans
            .entry(fft_size)
            .or_insert_with(|| {
                debug!(fft_size, "Planning transform");
                plan_pair(&mut RealFftPlanner::<f32>::new(), fft_size)
            })
            .clone()
    }

    /// Transform sizes currently planned, ascending
    pub fn sizes(&self) -> Vec<usize> {
        self.plans.keys().copied().collect()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persist the planned sizes, if this cache has a path
    #[instrument(skip(self))]
    pub fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };

        if let Err(e) = write_cache_file(path, self.sizes()) {
            warn!(
                path = %path.display(),
                error = %e,
                "failed saving plan cache, continuing anyway"
            );
        } else {
            debug!(path = %path.display(), "Saved plan cache");
        }
    }
}

fn plan_pair(planner: &mut RealFftPlanner<f32>, fft_size: usize) -> PlanPair {
    PlanPair {
        forward: planner.plan_fft_forward(fft_size),
        inverse: planner.plan_fft_inverse(fft_size),
    }
}

fn read_cache_file(path: &Path) -> std::io::Result<Vec<usize>> {
    let contents = std::fs::read_to_string(path)?;
    let file: PlanCacheFile = serde_json::from_str(&contents)?;
    if file.version != CACHE_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported plan cache version {}", file.version),
        ));
    }
    Ok(file.fft_sizes)
}

fn write_cache_file(path: &Path, fft_sizes: Vec<usize>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = PlanCacheFile {
        version: CACHE_VERSION,
        fft_sizes,
    };
    let json = serde_json::to_string_pretty(&file)?;
    std::fs::write(path, json)
}
