use crate::PoolStats;
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Warning => "warning",
            HealthLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub level: HealthLevel,
    /// Busy instances as a percentage of capacity
    pub utilization: f64,
    pub issues: Vec<String>,
}

/// Grade a pool snapshot. Critical when the pool cannot serve anything,
/// Warning when it serves at reduced capacity or is saturated.
pub fn assess_pool(stats: &PoolStats) -> PoolHealth {
    let mut issues = Vec::new();
    let utilization = crate::utils::percentage(stats.busy, stats.capacity);

    let level = if stats.closed {
        issues.push("browser pool is closed".to_string());
        HealthLevel::Critical
    } else if stats.total == 0 {
        issues.push("no live browser instances".to_string());
        HealthLevel::Critical
    } else {
        if stats.missing > 0 {
            issues.push(format!(
                "{} of {} browser slots awaiting replacement",
                stats.missing, stats.capacity
            ));
        }
        if stats.available == 0 {
            issues.push(format!("all {} browser instances are busy", stats.busy));
        }
        if issues.is_empty() {
            HealthLevel::Healthy
        } else {
            HealthLevel::Warning
        }
    };

    match level {
        HealthLevel::Critical => error!("Browser pool health critical: {}", issues.join("; ")),
        HealthLevel::Warning => warn!("Browser pool health warning: {}", issues.join("; ")),
        HealthLevel::Healthy => {}
    }

    PoolHealth {
        level,
        utilization,
        issues,
    }
}

/// Service-wide health report.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub level: HealthLevel,
    pub rendering_enabled: bool,
    pub pool: Option<PoolHealth>,
    pub pool_stats: Option<PoolStats>,
    pub active_jobs: usize,
    /// Entries in the classifier's render and static caches
    pub classifier_cache: (usize, usize),
}

impl ServiceHealth {
    pub fn new(
        rendering_enabled: bool,
        pool_stats: Option<PoolStats>,
        active_jobs: usize,
        classifier_cache: (usize, usize),
    ) -> Self {
        let pool = pool_stats.as_ref().map(assess_pool);
        let level = match (&pool, rendering_enabled) {
            (Some(pool), _) => pool.level,
            // Rendering was requested but the pool never came up.
            (None, true) => HealthLevel::Critical,
            (None, false) => HealthLevel::Healthy,
        };
        Self {
            level,
            rendering_enabled,
            pool,
            pool_stats,
            active_jobs,
            classifier_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: usize, busy: usize, missing: usize, closed: bool) -> PoolStats {
        PoolStats {
            capacity: total + missing,
            total,
            available: total - busy,
            busy,
            missing,
            acquisitions: 0,
            replacements: 0,
            exhausted: 0,
            closed,
        }
    }

    #[test]
    fn idle_pool_is_healthy() {
        let health = assess_pool(&stats(3, 1, 0, false));
        assert_eq!(health.level, HealthLevel::Healthy);
        assert!(health.issues.is_empty());
        assert_eq!(health.utilization, 33.33);
    }

    #[test]
    fn saturation_and_missing_slots_warn() {
        assert_eq!(assess_pool(&stats(2, 2, 0, false)).level, HealthLevel::Warning);
        let health = assess_pool(&stats(2, 0, 1, false));
        assert_eq!(health.level, HealthLevel::Warning);
        assert!(health.issues[0].contains("awaiting replacement"));
    }

    #[test]
    fn closed_or_empty_pool_is_critical() {
        assert_eq!(assess_pool(&stats(2, 0, 0, true)).level, HealthLevel::Critical);
        assert_eq!(assess_pool(&stats(0, 0, 3, false)).level, HealthLevel::Critical);
    }

    #[test]
    fn service_without_rendering_is_healthy() {
        let health = ServiceHealth::new(false, None, 0, (0, 0));
        assert_eq!(health.level, HealthLevel::Healthy);

        let health = ServiceHealth::new(true, Some(stats(1, 1, 0, false)), 2, (1, 4));
        assert_eq!(health.level, HealthLevel::Warning);
        assert_eq!(health.active_jobs, 2);
    }
}
