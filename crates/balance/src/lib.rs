// Copyright 2024 Mazze Foundation. All rights reserved.
// Mazze is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Cluster power-budget accounting: per-job endpoint state, the
//! balanced-slowdown rebalancer, and the time-varying budget generator.
//!
//! The rebalancer is a pure function over the endpoint map; everything that
//! touches wall-clock time takes the clock as an argument so the policy can
//! be exercised deterministically in tests.

mod budget;
mod endpoint;
mod rebalance;

pub use self::{
    budget::{BudgetGenerator, SWEEP_STEP_WATTS, TRACE_STEP_SECONDS},
    endpoint::{EndpointMetrics, Sample, EPOCH_SERIES_MIN, REFIT_GAP, SERIES_CAP},
    rebalance::{rebalance, BalanceSettings, EndpointMap},
};

/// Assumed draw of a node no job currently owns, in watts.
pub const IDLE_WATTS_PER_NODE: f64 = 38.0;
