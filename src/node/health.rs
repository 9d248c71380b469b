//! Health scoring used to pick the least loaded node.

use serde::{Deserialize, Serialize};

use super::protocol::NodeStats;

/// Maximum capacity ever reported for a node.
const MAX_CAPACITY: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Cortes por métrica: hasta `excellent` puntúa 3, hasta `good` 2, hasta `fair` 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub excellent: f64,
    pub good: f64,
    pub fair: f64,
    pub poor: f64,
}

impl TierThresholds {
    fn score(&self, value: f64) -> f64 {
        if value <= self.excellent {
            3.0
        } else if value <= self.good {
            2.0
        } else if value <= self.fair {
            1.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Lavalink process load, 0.0..=1.0.
    pub cpu: TierThresholds,
    /// Percent of allocated memory in use.
    pub memory: TierThresholds,
    /// Heartbeat round trip in milliseconds.
    pub ping: TierThresholds,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            cpu: TierThresholds {
                excellent: 0.3,
                good: 0.5,
                fair: 0.7,
                poor: 0.85,
            },
            memory: TierThresholds {
                excellent: 60.0,
                good: 75.0,
                fair: 85.0,
                poor: 95.0,
            },
            ping: TierThresholds {
                excellent: 50.0,
                good: 100.0,
                fair: 200.0,
                poor: 300.0,
            },
        }
    }
}

/// Inputs for one health evaluation.
#[derive(Debug, Clone, Copy)]
pub struct HealthInput<'a> {
    pub connected: bool,
    pub stats: &'a NodeStats,
    pub ping_ms: f64,
    pub recent_reconnects: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthStatus {
    pub tier: PerformanceTier,
    pub overloaded: bool,
    pub critical: bool,
    /// Lower is better.
    pub penalty: f64,
    pub remaining_capacity: u32,
}

impl HealthStatus {
    pub fn offline() -> Self {
        Self {
            tier: PerformanceTier::Poor,
            overloaded: true,
            critical: true,
            penalty: f64::MAX,
            remaining_capacity: 0,
        }
    }
}

/// Calcula el estado de salud de un nodo.
pub fn health_status(input: HealthInput<'_>, thresholds: &HealthThresholds) -> HealthStatus {
    if !input.connected {
        return HealthStatus::offline();
    }

    let stats = input.stats;
    let cpu = stats.cpu.lavalink_load;
    let memory = stats.memory_percent();
    let (deficit, nulled) = stats
        .frame_stats
        .map(|f| (f.deficit.max(0) as f64, f.nulled.max(0) as f64))
        .unwrap_or((0.0, 0.0));

    let average = (thresholds.cpu.score(cpu)
        + thresholds.memory.score(memory)
        + thresholds.ping.score(input.ping_ms))
        / 3.0;
    let tier = if average >= 2.5 {
        PerformanceTier::Excellent
    } else if average >= 1.5 {
        PerformanceTier::Good
    } else if average >= 0.5 {
        PerformanceTier::Fair
    } else {
        PerformanceTier::Poor
    };

    let overloaded = cpu > thresholds.cpu.fair
        || memory > thresholds.memory.fair
        || input.ping_ms > thresholds.ping.fair
        || deficit > 0.0;
    let critical = cpu > thresholds.cpu.poor
        || memory > thresholds.memory.poor
        || input.ping_ms > thresholds.ping.poor;

    let mut penalty = stats.players as f64
        + cpu.powi(2) * 10_000.0
        + memory.powf(1.5)
        + input.ping_ms * 2.0
        + deficit * 10.0
        + nulled * 5.0;
    if overloaded {
        penalty += 5_000.0;
    }
    if critical {
        penalty += 10_000.0;
    }
    penalty += 1_000.0 * input.recent_reconnects as f64;

    let remaining_capacity = if overloaded {
        0
    } else {
        estimate_capacity(stats.players, cpu, memory, thresholds)
    };

    HealthStatus {
        tier,
        overloaded,
        critical,
        penalty,
        remaining_capacity,
    }
}

/// Players that still fit before cpu or memory reach the "fair" cut.
fn estimate_capacity(players: u64, cpu: f64, memory: f64, thresholds: &HealthThresholds) -> u32 {
    let cpu_headroom = (thresholds.cpu.fair - cpu).max(0.0);
    let memory_headroom = (thresholds.memory.fair - memory).max(0.0);

    // Sin players no hay costo medido; se asume un costo mínimo por player.
    let (cpu_per_player, memory_per_player) = if players > 0 {
        (
            (cpu / players as f64).max(0.001),
            (memory / players as f64).max(0.01),
        )
    } else {
        (0.01, 0.5)
    };

    let by_cpu = cpu_headroom / cpu_per_player;
    let by_memory = memory_headroom / memory_per_player;
    by_cpu.min(by_memory).min(MAX_CAPACITY).floor() as u32
}
