//! Resource governor: memory and CPU sampling, eviction, and admission.
//!
//! The governor watches process memory against two thresholds:
//!
//! | Reading | Pressure | Ingest / Embed | Generate / Retrieve |
//! |---------|----------|----------------|---------------------|
//! | below `memory_soft_threshold_mb` | `Normal` | Allow | Allow |
//! | above soft, below ceiling | `Soft` | Defer | Allow |
//! | above `memory_ceiling_mb` | `Hard` | Reject | Allow |
//!
//! Whenever a reading lands above the soft threshold the governor first
//! evicts index documents, lowest cumulative relevance first, resampling
//! after each eviction. One pass stops when memory drops below the
//! threshold, when the index's own size estimate says the excess has been
//! freed, or after a quarter of the indexed documents are gone. RSS often
//! stays high after a free, so an unbounded pass would empty the index.
//! Only the pressure left *after* eviction drives the admission decision.
//!
//! [`ResourceGovernor::spawn_monitor`] repeats this on an interval and
//! caches the resulting [`Pressure`], which the scheduler consults before
//! dispatching ingestion work.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use hearth_core::index::VectorIndex;
use hearth_core::models::TaskKind;

use crate::config::ResourcesConfig;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
/// `USER_HZ`, the unit of utime/stime in `/proc/self/stat`. It is 100 on
/// every mainstream Linux architecture; `sysconf(_SC_CLK_TCK)` is not
/// consulted, so a kernel built otherwise reports a scaled CPU figure.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;
/// At most `1 / EVICTION_SHARE` of the indexed documents go in one pass.
const EVICTION_SHARE: usize = 4;

/// Source of process resource figures.
pub trait MemorySampler: Send + Sync {
    /// Resident set size in bytes; 0 when unknown.
    fn rss_bytes(&self) -> u64;

    /// Cumulative user + system CPU time of the process, if known.
    fn cpu_time(&self) -> Option<Duration> {
        None
    }
}

/// Reads `/proc/self/status` and `/proc/self/stat`. Reports 0 off Linux.
pub struct ProcSampler;

impl MemorySampler for ProcSampler {
    fn rss_bytes(&self) -> u64 {
        if !cfg!(target_os = "linux") {
            return 0;
        }
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|contents| parse_vm_rss(&contents))
            .unwrap_or(0)
    }

    fn cpu_time(&self) -> Option<Duration> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        let contents = std::fs::read_to_string("/proc/self/stat").ok()?;
        parse_cpu_ticks(&contents)
            .map(|ticks| Duration::from_secs_f64(ticks as f64 / CLOCK_TICKS_PER_SEC))
    }
}

/// `VmRSS:   123456 kB` → bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// utime + stime (fields 14 and 15) from `/proc/self/stat`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // comm (field 2) may contain spaces; fields are counted after its ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceReading {
    pub rss_mb: f64,
    /// CPU use since the previous reading, as a percentage of one core.
    pub cpu_percent: f32,
    pub index_chunks: usize,
    pub index_bytes: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Normal = 0,
    Soft = 1,
    Hard = 2,
}

impl Pressure {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Pressure::Normal,
            1 => Pressure::Soft,
            _ => Pressure::Hard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Defer,
    Reject,
}

pub struct ResourceGovernor {
    sampler: Arc<dyn MemorySampler>,
    index: Arc<dyn VectorIndex>,
    soft_mb: f64,
    ceiling_mb: f64,
    pressure: AtomicU8,
    last_cpu: Mutex<Option<(Instant, Duration)>>,
}

impl ResourceGovernor {
    pub fn new(
        config: &ResourcesConfig,
        sampler: Arc<dyn MemorySampler>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            sampler,
            index,
            soft_mb: config.memory_soft_threshold_mb as f64,
            ceiling_mb: config.memory_ceiling_mb as f64,
            pressure: AtomicU8::new(Pressure::Normal as u8),
            last_cpu: Mutex::new(None),
        }
    }

    /// Take a reading without acting on it.
    pub fn sample(&self) -> ResourceReading {
        ResourceReading {
            rss_mb: self.sampler.rss_bytes() as f64 / BYTES_PER_MB,
            cpu_percent: self.cpu_percent(),
            index_chunks: self.index.chunk_count(),
            index_bytes: self.index.approx_bytes(),
            at: Utc::now(),
        }
    }

    fn cpu_percent(&self) -> f32 {
        let Some(cpu) = self.sampler.cpu_time() else {
            return 0.0;
        };
        let now = Instant::now();
        let mut last = self.last_cpu.lock().unwrap_or_else(|e| e.into_inner());
        let percent = match *last {
            Some((at, prev)) => {
                let wall = now.duration_since(at).as_secs_f64();
                if wall > 0.0 {
                    (cpu.saturating_sub(prev).as_secs_f64() / wall * 100.0) as f32
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *last = Some((now, cpu));
        percent
    }

    fn classify(&self, rss_mb: f64) -> Pressure {
        if rss_mb > self.ceiling_mb {
            Pressure::Hard
        } else if rss_mb > self.soft_mb {
            Pressure::Soft
        } else {
            Pressure::Normal
        }
    }

    /// Sample, evict a bounded number of documents while above the soft
    /// threshold, and cache the resulting pressure.
    pub fn relieve(&self) -> Pressure {
        self.index.evict_to(self.index.capacity());

        let mut rss_mb = self.sampler.rss_bytes() as f64 / BYTES_PER_MB;
        if rss_mb > self.soft_mb {
            let budget = self.index.documents().len().div_ceil(EVICTION_SHARE);
            let excess_bytes = (rss_mb - self.soft_mb) * BYTES_PER_MB;
            let start_bytes = self.index.approx_bytes();
            let mut evicted = 0;
            while rss_mb > self.soft_mb && evicted < budget {
                let Some(doc) = self.index.evict_lowest() else {
                    break;
                };
                evicted += 1;
                tracing::warn!(
                    document_id = %doc.id,
                    relevance = doc.relevance,
                    rss_mb,
                    "memory above soft threshold, evicted document"
                );
                rss_mb = self.sampler.rss_bytes() as f64 / BYTES_PER_MB;
                let freed = start_bytes.saturating_sub(self.index.approx_bytes()) as f64;
                if freed >= excess_bytes {
                    break;
                }
            }
            if rss_mb > self.soft_mb {
                tracing::debug!(evicted, budget, rss_mb, "eviction pass ended above soft threshold");
            }
        }

        let pressure = self.classify(rss_mb);
        let previous = Pressure::from_u8(self.pressure.swap(pressure as u8, Ordering::SeqCst));
        if previous != pressure {
            tracing::info!(?previous, ?pressure, rss_mb, "memory pressure changed");
        }
        pressure
    }

    /// Pressure as of the last [`relieve`](Self::relieve).
    pub fn pressure(&self) -> Pressure {
        Pressure::from_u8(self.pressure.load(Ordering::SeqCst))
    }

    /// Admission decision for a new task of `kind`.
    pub fn admit(&self, kind: TaskKind) -> Admission {
        if !kind.is_ingestion() {
            return Admission::Allow;
        }
        let decision = match self.relieve() {
            Pressure::Normal => Admission::Allow,
            Pressure::Soft => Admission::Defer,
            Pressure::Hard => Admission::Reject,
        };
        if decision != Admission::Allow {
            tracing::debug!(%kind, ?decision, "governor admission");
        }
        decision
    }

    /// Periodically [`relieve`](Self::relieve) on a tokio interval.
    pub fn spawn_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                governor.relieve();
            }
        })
    }
}
