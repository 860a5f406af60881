// Copyright 2024 Mazze Foundation. All rights reserved.
// Mazze is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Per-job runtime models for the cluster power balancer.
//!
//! A job's sensitivity to power capping is summarized by the curve
//! `t(p) = A * (POWER_MAX - p)^2 + C`, where `t` is the duration of one unit
//! of application progress under a per-host cap of `p` watts. The model is
//! trained online from `(cap, duration)` samples reported by the job and is
//! inverted to answer the planning question the balancer actually asks: what
//! cap keeps this job at a given slowdown?

mod book;
mod model;

pub use self::{
    book::{profile_tail, AppInfo, AppInfoError, AppSpec, Coef, ModelBook, ModelCoef},
    model::{fit, heuristic_cap_at_slowdown, RuntimeModel},
};

/// Per-host hardware power-cap ceiling, in watts.
pub const POWER_MAX: f64 = 280.0;
/// Per-host hardware power-cap floor, in watts.
pub const POWER_MIN: f64 = 140.0;

/// Clamp a per-host cap into the hardware-supported range.
pub fn clamp_cap(cap: f64) -> f64 {
    cap.max(POWER_MIN).min(POWER_MAX)
}
