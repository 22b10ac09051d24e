//! Resource budgets for a governed process and the arithmetic that enforces them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Optional CPU, memory and wall-clock budgets for one process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_clock_ms: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.cpu_ms.is_none() && self.memory_mb.is_none() && self.wall_clock_ms.is_none()
    }

    /// True when periodic sampling is required (CPU or memory budget set).
    pub fn needs_sampler(&self) -> bool {
        self.cpu_ms.is_some() || self.memory_mb.is_some()
    }

    /// Memory violation for a resident set size, if it exceeds the budget.
    pub fn check_memory(&self, rss_bytes: u64) -> Option<Violation> {
        let limit_mb = self.memory_mb?;
        let rss_mb = rss_bytes as f64 / (1024.0 * 1024.0);
        (rss_mb > limit_mb as f64).then_some(Violation::Memory { limit_mb, rss_mb })
    }
}

/// Running CPU-time total accumulated from instantaneous usage samples.
///
/// Each sample contributes `(cpu_percent / 100) * interval_ms`.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuBudget {
    limit_ms: u64,
    used_ms: f64,
}

impl CpuBudget {
    pub fn new(limit_ms: u64) -> Self {
        Self {
            limit_ms,
            used_ms: 0.0,
        }
    }

    pub fn used_ms(&self) -> f64 {
        self.used_ms
    }

    /// Record one sample and return a violation once the total exceeds the budget.
    pub fn record(&mut self, cpu_percent: f64, interval_ms: u64) -> Option<Violation> {
        let percent = if cpu_percent.is_finite() {
            cpu_percent.max(0.0)
        } else {
            0.0
        };
        self.used_ms += (percent / 100.0) * interval_ms as f64;
        (self.used_ms > self.limit_ms as f64).then_some(Violation::Cpu {
            limit_ms: self.limit_ms,
            used_ms: self.used_ms,
        })
    }
}

/// A budget breach that terminates the governed process.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    WallClock { limit_ms: u64 },
    Memory { limit_mb: u64, rss_mb: f64 },
    Cpu { limit_ms: u64, used_ms: f64 },
}

impl Violation {
    /// Stable short code used in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Violation::WallClock { .. } => "wall_clock_limit",
            Violation::Memory { .. } => "memory_limit",
            Violation::Cpu { .. } => "cpu_limit",
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::WallClock { limit_ms } => {
                write!(f, "wall clock limit of {limit_ms}ms exceeded")
            }
            Violation::Memory { limit_mb, rss_mb } => write!(
                f,
                "memory limit of {limit_mb}MB exceeded ({rss_mb:.1}MB resident)"
            ),
            Violation::Cpu { limit_ms, used_ms } => {
                write!(f, "cpu limit of {limit_ms}ms exceeded ({used_ms:.0}ms used)")
            }
        }
    }
}
