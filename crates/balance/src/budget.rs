// Copyright 2024 Mazze Foundation. All rights reserved.
// Mazze is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use std::time::{Duration, Instant};

use powermodel::{POWER_MAX, POWER_MIN};

/// Triangular-sweep step size, watts per node per update.
pub const SWEEP_STEP_WATTS: f64 = 10.0;
/// A replayed budget trace advances to a new entry every this many seconds.
pub const TRACE_STEP_SECONDS: u64 = 4;

/// Source of the time-varying cluster power target.
///
/// Either a triangular sweep between `P ± R` or a replay of normalized
/// `[-1, 1]` targets mapped through `(x * R + P)`. Both step at most once
/// per wall second; callers pass the clock in, which keeps the policy
/// deterministic under test. A replay trace must contain at least one
/// entry; past its end the final value holds.
pub struct BudgetGenerator {
    mean_watts: f64,
    reserve_watts: f64,
    total_nodes: u32,
    average_per_node: f64,
    sweep_sign: f64,
    last_step: Instant,
    started: Instant,
    trace: Option<Vec<f64>>,
}

impl BudgetGenerator {
    /// `mean`/`reserve` are cluster-total watts; by default the sweep covers
    /// the whole hardware range of the cluster.
    pub fn new(
        total_nodes: u32,
        mean: Option<f64>,
        reserve: Option<f64>,
        trace: Option<Vec<f64>>,
        now: Instant,
    ) -> Self {
        let nodes = total_nodes as f64;
        let mean_watts = mean.unwrap_or(0.5 * (POWER_MIN + POWER_MAX) * nodes);
        let reserve_watts = reserve.unwrap_or(0.5 * (POWER_MAX - POWER_MIN) * nodes);
        Self {
            mean_watts,
            reserve_watts,
            total_nodes,
            average_per_node: mean_watts / nodes,
            sweep_sign: -1.0,
            last_step: now,
            started: now,
            trace,
        }
    }

    /// Current cluster-total power target in watts.
    pub fn cluster_target(&mut self, now: Instant) -> f64 {
        if now.duration_since(self.last_step) > Duration::from_secs(1) {
            self.last_step = now;
            let nodes = self.total_nodes as f64;
            let mean_per_node = self.mean_watts / nodes;
            let reserve_per_node = self.reserve_watts / nodes;
            match &self.trace {
                None => {
                    let step = if reserve_per_node > 0.0 {
                        SWEEP_STEP_WATTS
                    } else {
                        0.0
                    };
                    if self.average_per_node >= mean_per_node + reserve_per_node {
                        self.sweep_sign = -1.0;
                    }
                    if self.average_per_node <= mean_per_node - reserve_per_node {
                        self.sweep_sign = 1.0;
                    }
                    self.average_per_node += step * self.sweep_sign;
                }
                Some(trace) => {
                    let elapsed = now.duration_since(self.started).as_secs();
                    let index = ((elapsed / TRACE_STEP_SECONDS) as usize).min(trace.len() - 1);
                    self.average_per_node =
                        (trace[index] * self.reserve_watts + self.mean_watts) / nodes;
                }
            }
        }
        self.average_per_node * self.total_nodes as f64
    }

    /// Smoothed per-node target as of the last update.
    pub fn average_per_node(&self) -> f64 {
        self.average_per_node
    }
}
