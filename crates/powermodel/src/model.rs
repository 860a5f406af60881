// Copyright 2024 Mazze Foundation. All rights reserved.
// Mazze is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{clamp_cap, POWER_MAX, POWER_MIN};

/// Number of evenly spaced probe points used by the post-fit shape check.
const SHAPE_GRID_POINTS: usize = 8;

/// Fitted coefficients of `t(p) = a * (POWER_MAX - p)^2 + c`.
///
/// Both coefficients are non-negative for any model that survives
/// [`fit`]; predicted durations therefore never increase with power.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeModel {
    pub a: f64,
    pub c: f64,
}

impl RuntimeModel {
    /// Predicted duration of one progress unit under a per-host cap.
    pub fn time_at_cap(&self, cap: f64) -> f64 {
        let gap = POWER_MAX - cap;
        self.a * gap * gap + self.c
    }

    /// Inverse of [`time_at_cap`](Self::time_at_cap).
    ///
    /// A flat model (`a == 0`) cannot be inverted; any duration is reachable
    /// at any cap, so the lowest cap is returned. A duration below the model
    /// floor `c` is unreachable even at full power, so `POWER_MAX` is
    /// returned.
    pub fn cap_at_time(&self, duration: f64) -> f64 {
        if self.a == 0.0 {
            return POWER_MIN;
        }
        let arg = (duration - self.c) / self.a;
        if arg < 0.0 {
            return POWER_MAX;
        }
        POWER_MAX - arg.sqrt()
    }

    /// Cap at which this job is predicted to run `slowdown` times longer
    /// than at full power.
    ///
    /// `min_observed_duration` backs up the full-power baseline when the
    /// model's own floor is not a usable (positive) duration.
    pub fn cap_at_slowdown(&self, slowdown: f64, min_observed_duration: Option<f64>) -> f64 {
        if slowdown < 1.0 {
            return POWER_MAX;
        }
        let mut baseline = self.time_at_cap(POWER_MAX);
        if !(baseline > 0.0) {
            baseline = match min_observed_duration {
                Some(t) if t > 0.0 => t,
                _ => return heuristic_cap_at_slowdown(slowdown),
            };
        }
        let cap = self.cap_at_time(slowdown * baseline);
        if cap.is_nan() {
            return clamp_cap(POWER_MAX / slowdown / 2.0);
        }
        clamp_cap(cap)
    }
}

/// Cap guess for a job with no model at all: halfway between a naive
/// linear-scaling estimate and the floor.
pub fn heuristic_cap_at_slowdown(slowdown: f64) -> f64 {
    clamp_cap((POWER_MAX / slowdown + POWER_MIN) / 2.0)
}

/// Fit the runtime curve to `(cap, duration)` samples by closed-form least
/// squares over the transformed regressor `x = (POWER_MAX - cap)^2`.
///
/// Returns `None` when the data cannot support a usable model: fewer than
/// two samples, a degenerate design (all caps equal), non-finite
/// coefficients, a negative duration floor, or a shape that fails the
/// monotonicity probe (durations must not increase with power, which is
/// exactly what a negative slope would predict).
pub fn fit<I>(samples: I) -> Option<RuntimeModel>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut n = 0.0f64;
    let mut sx = 0.0f64;
    let mut sy = 0.0f64;
    let mut sxx = 0.0f64;
    let mut sxy = 0.0f64;
    for (cap, duration) in samples {
        let gap = POWER_MAX - cap;
        let x = gap * gap;
        n += 1.0;
        sx += x;
        sy += duration;
        sxx += x * x;
        sxy += x * duration;
    }
    if n < 2.0 {
        return None;
    }
    let denom = n * sxx - sx * sx;
    if !(denom.abs() > f64::EPSILON * (n * sxx).max(1.0)) {
        return None;
    }
    let a = (n * sxy - sx * sy) / denom;
    let c = (sy - a * sx) / n;
    if !a.is_finite() || !c.is_finite() {
        return None;
    }
    let model = RuntimeModel { a, c };
    if !is_shape_valid(&model) || c < 0.0 {
        return None;
    }
    Some(model)
}

/// Probe the fitted curve on an even grid over `[0, POWER_MAX]`; durations
/// must be finite and non-increasing as power grows.
fn is_shape_valid(model: &RuntimeModel) -> bool {
    let mut previous = f64::INFINITY;
    for i in 0..SHAPE_GRID_POINTS {
        let cap = POWER_MAX * i as f64 / (SHAPE_GRID_POINTS - 1) as f64;
        let t = model.time_at_cap(cap);
        if !t.is_finite() || t > previous {
            return false;
        }
        previous = t;
    }
    true
}
