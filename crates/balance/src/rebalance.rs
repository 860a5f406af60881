// Copyright 2024 Mazze Foundation. All rights reserved.
// Mazze is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use indexmap::IndexMap;
use log::{debug, warn};
use powermodel::{clamp_cap, ModelBook, POWER_MAX, POWER_MIN};

use crate::endpoint::EndpointMetrics;
use crate::IDLE_WATTS_PER_NODE;

/// Endpoints keyed by peer address. Iteration order is insertion order, so
/// allocation tie-breaks are deterministic across a round.
pub type EndpointMap = IndexMap<String, EndpointMetrics>;

/// Slowdown search bracket: jobs are never planned below full speed or past
/// a 4x stretch.
const SLOWDOWN_LO: f64 = 1.0;
const SLOWDOWN_HI: f64 = 4.0;
/// Budget-fill passes per round.
const FILL_ITERATIONS: usize = 10;
/// Passes that may distribute by predicted need before switching to
/// headroom.
const NEED_PHASE_ITERATIONS: usize = 5;
/// Need-based distribution applies only while aggregate need exceeds this
/// many watts per active host.
const NEED_CUTOFF_WATTS_PER_HOST: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
pub struct BalanceSettings {
    pub total_nodes: u32,
    /// When false, the budget is split evenly per host with no regard for
    /// the runtime models.
    pub cross_job_sharing: bool,
}

/// Partition `cluster_cap` watts across the connected jobs, writing each
/// endpoint's `current_cap`.
///
/// With sharing enabled the split equalizes predicted slowdown: a bisection
/// finds the slowdown `s*` whose per-job cap demands exactly consume the
/// budget, then up to [`FILL_ITERATIONS`] proportional passes hand out the
/// remainder, first by predicted need and then by headroom. Unallocated
/// budget is re-derived from the cap sum each pass, so rounding drift
/// cannot accumulate.
pub fn rebalance(
    settings: &BalanceSettings,
    book: &ModelBook,
    cluster_cap: f64,
    endpoints: &mut EndpointMap,
) {
    if endpoints.is_empty() {
        return;
    }
    let active_hosts: f64 = endpoints.values().map(|e| e.host_count as f64).sum();
    let idle_hosts = settings.total_nodes as f64 - active_hosts;
    let idle_power = idle_hosts * IDLE_WATTS_PER_NODE;

    // Everyone at least gets the floor.
    for endpoint in endpoints.values_mut() {
        endpoint.current_cap = POWER_MIN;
    }

    if !settings.cross_job_sharing {
        let unallocated = cluster_cap - idle_power - POWER_MIN * active_hosts;
        let extra_per_host = unallocated / active_hosts;
        for endpoint in endpoints.values_mut() {
            endpoint.current_cap = clamp_cap(POWER_MIN + extra_per_host);
        }
        return;
    }

    let target_slowdown = balanced_slowdown(book, cluster_cap, idle_power, active_hosts, endpoints);

    for pass in 0..FILL_ITERATIONS {
        let allocated: f64 = endpoints.values().map(|e| e.total_cap()).sum();
        let unallocated = cluster_cap - idle_power - allocated;

        let needs: Vec<f64> = endpoints
            .values()
            .map(|e| {
                e.host_count as f64
                    * (e.cap_at_slowdown(book, target_slowdown) - e.current_cap).max(0.0)
            })
            .collect();
        let headrooms: Vec<f64> = endpoints
            .values()
            .map(|e| e.host_count as f64 * (POWER_MAX - e.current_cap))
            .collect();
        let total_need: f64 = needs.iter().sum();
        let total_headroom: f64 = headrooms.iter().sum();

        if unallocated < 1.0 || !(total_headroom > 0.0) {
            break;
        }

        let by_need =
            total_need > NEED_CUTOFF_WATTS_PER_HOST * active_hosts && pass < NEED_PHASE_ITERATIONS;
        for (i, endpoint) in endpoints.values_mut().enumerate() {
            let share = if by_need {
                needs[i] / total_need
            } else {
                headrooms[i] / total_headroom
            };
            endpoint.current_cap += unallocated * share / endpoint.host_count as f64;
            if endpoint.current_cap > POWER_MAX {
                // Overage flows back into the next pass's unallocated sum.
                endpoint.current_cap = POWER_MAX;
            }
        }
    }
}

/// Slowdown at which the jobs' aggregate cap demand plus idle power meets
/// the budget exactly.
fn balanced_slowdown(
    book: &ModelBook,
    cluster_cap: f64,
    idle_power: f64,
    active_hosts: f64,
    endpoints: &EndpointMap,
) -> f64 {
    let deficit = |slowdown: f64| -> f64 {
        let demand: f64 = endpoints
            .values()
            .map(|e| e.host_count as f64 * e.cap_at_slowdown(book, slowdown))
            .sum();
        demand + idle_power - cluster_cap
    };
    match bisect(&deficit, SLOWDOWN_LO, SLOWDOWN_HI) {
        Some(slowdown) => {
            debug!("target balanced slowdown: {:.4}", slowdown);
            slowdown
        }
        None => {
            // Too much idle power, or too few jobs with any cap
            // sensitivity, leaves the deficit single-signed over the
            // bracket.
            let fallback = POWER_MAX * active_hosts / (cluster_cap - idle_power);
            warn!(
                "no balanced slowdown in [{}, {}]; falling back to {:.4} (cap={:.0}, idle={:.0})",
                SLOWDOWN_LO, SLOWDOWN_HI, fallback, cluster_cap, idle_power
            );
            fallback
        }
    }
}

/// Bisection root search; `None` when the bracket does not straddle a sign
/// change.
fn bisect<F: Fn(f64) -> f64>(f: &F, mut lo: f64, mut hi: f64) -> Option<f64> {
    let mut f_lo = f(lo);
    let f_hi = f(hi);
    if !f_lo.is_finite() || !f_hi.is_finite() {
        return None;
    }
    if f_lo == 0.0 {
        return Some(lo);
    }
    if f_hi == 0.0 {
        return Some(hi);
    }
    if f_lo.signum() == f_hi.signum() {
        return None;
    }
    for _ in 0..64 {
        let mid = 0.5 * (lo + hi);
        let f_mid = f(mid);
        if f_mid == 0.0 || hi - lo < 1e-9 {
            return Some(mid);
        }
        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }
    Some(0.5 * (lo + hi))
}
