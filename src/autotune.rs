// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Per-chip autotuner (C4): rolling good/bad nonce windows drive clock
//! raise/lower decisions. Pure decision logic lives here; the actual chip
//! reset + PLL rewrite live in [`crate::chain`], which calls back into
//! [`record_clock_change`] once the hardware step has succeeded.

/// Number of full nonce ranges a measurement window spans.
const N_WIN: f64 = 200.0;

/// Bad nonces required before a window's ratio is evaluated.
const BAD_NONCE_EVAL_THRESHOLD: u64 = 5;

/// Minimum sample size before a ratio is considered meaningful.
const MIN_SHARES_FOR_RATIO: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Window {
    pub shares_ok: u64,
    pub shares_nok: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub sys_clk: u32,
}

impl Window {
    fn new(now_ms: u64, num_cores: u32, sys_clk_khz: u32) -> Self {
        let nonces_per_sec = (num_cores as f64 * sys_clk_khz as f64) / 4_294_967.296;
        let duration_ms = if nonces_per_sec > 0.0 {
            (N_WIN / nonces_per_sec * 1000.0) as u64
        } else {
            0
        };
        Window {
            shares_ok: 0,
            shares_nok: 0,
            start_time: now_ms,
            end_time: now_ms + duration_ms,
            sys_clk: sys_clk_khz,
        }
    }
}

/// Ratio in permille, or `None` until the window has at least
/// `MIN_SHARES_FOR_RATIO` samples (the spec's `-1` sentinel).
pub fn ratio_permille(w: &Window) -> Option<i64> {
    let shares_all = w.shares_ok + w.shares_nok;
    if shares_all < MIN_SHARES_FOR_RATIO {
        return None;
    }
    Some(((w.shares_nok * 1000 + shares_all / 2) / shares_all) as i64)
}

#[derive(Debug, Clone, Copy)]
pub struct AutotuneParams {
    pub lower_clk_khz: u32,
    pub upper_clk_khz: u32,
    pub lower_ratio_pm: i64,
    pub upper_ratio_pm: i64,
    pub delta_clk_khz: u32,
}

/// Per-chip autotune state: the in-progress window plus a snapshot of the
/// window that was active before the most recent clock change.
#[derive(Debug, Clone, Copy)]
pub struct AutotuneState {
    pub current: Window,
    pub prev: Window,
    pub enabled: bool,
}

impl AutotuneState {
    pub fn new(now_ms: u64, num_cores: u32, sys_clk_khz: u32, enabled: bool) -> Self {
        let current = Window::new(now_ms, num_cores, sys_clk_khz);
        AutotuneState {
            current,
            prev: current,
            enabled,
        }
    }
}

/// Record a good nonce. Returns `true` if the caller should raise the clock
/// by `ΔCLK`.
///
/// If the current window's clock is already at or below the previous
/// window's clock, the chip already climbed past its peak on a prior
/// uptune and must not be nudged further (peak-stickiness rule, §9).
pub fn on_good_nonce(state: &mut AutotuneState, params: &AutotuneParams, now_ms: u64) -> bool {
    state.current.shares_ok += 1;

    if state.current.sys_clk <= state.prev.sys_clk {
        return false;
    }
    check_uptune(state, params, now_ms)
}

/// Whether the current window warrants raising the clock. Shared by
/// `on_good_nonce` and `flush_work`'s pre-flush uptune check (an autotune
/// restart already implies the reset a flush would otherwise perform).
pub fn check_uptune(state: &AutotuneState, params: &AutotuneParams, now_ms: u64) -> bool {
    if !state.enabled || now_ms < state.current.end_time {
        return false;
    }
    matches!(ratio_permille(&state.current), Some(ratio) if ratio < params.lower_ratio_pm)
}

/// Record a bad nonce. Returns `Some(delta)` (always negative) if the caller
/// should lower the clock by `|delta|`. If the ratio doesn't warrant a
/// lower-clock decision, the window is reset in place (old measurements
/// evicted) and `None` is returned.
pub fn on_bad_nonce(
    state: &mut AutotuneState,
    params: &AutotuneParams,
    now_ms: u64,
    num_cores: u32,
) -> Option<i32> {
    state.current.shares_nok += 1;

    if state.current.shares_nok < BAD_NONCE_EVAL_THRESHOLD {
        return None;
    }

    match ratio_permille(&state.current) {
        Some(ratio) if ratio > params.upper_ratio_pm && state.current.sys_clk > params.lower_clk_khz => {
            Some(-(params.delta_clk_khz as i32))
        }
        _ => {
            state.current = Window::new(now_ms, num_cores, state.current.sys_clk);
            None
        }
    }
}

/// Clamp a proposed clock change to `[lower_clk_khz, upper_clk_khz]`.
pub fn clamp_new_clock(current_khz: u32, delta_khz: i32, params: &AutotuneParams) -> u32 {
    let proposed = current_khz as i64 + delta_khz as i64;
    proposed
        .max(params.lower_clk_khz as i64)
        .min(params.upper_clk_khz as i64) as u32
}

/// Called once a clock-change restart has succeeded in hardware: snapshots
/// the outgoing window into `prev` and opens a fresh window at the new clock.
pub fn record_clock_change(state: &mut AutotuneState, now_ms: u64, num_cores: u32, new_clk_khz: u32) {
    state.prev = state.current;
    state.current = Window::new(now_ms, num_cores, new_clk_khz);
}

#[cfg(test)]
mod test {
    use super::*;

    fn params() -> AutotuneParams {
        AutotuneParams {
            lower_clk_khz: 400_000,
            upper_clk_khz: 1_100_000,
            lower_ratio_pm: 3,
            upper_ratio_pm: 20,
            delta_clk_khz: 4_000,
        }
    }

    #[test]
    fn bad_nonce_sequence_lowers_clock() {
        // 5 bad, 0 good, sys_clk=800MHz, upper_ratio=20 permille
        let mut state = AutotuneState::new(0, 100, 800_000, true);
        let p = params();
        let mut decision = None;
        for _ in 0..5 {
            decision = on_bad_nonce(&mut state, &p, 0, 100);
        }
        assert_eq!(decision, Some(-4000));

        let new_clk = clamp_new_clock(state.current.sys_clk, decision.unwrap(), &p);
        assert_eq!(new_clk, 796_000);

        record_clock_change(&mut state, 1_000, 100, new_clk);
        assert_eq!(state.prev.sys_clk, 800_000);
        assert_eq!(state.current.sys_clk, 796_000);
    }

    #[test]
    fn peak_stickiness_blocks_uptune_past_previous_peak() {
        // current clock has already climbed above a window that was itself
        // lower than the recorded peak (prev), so a good nonce must not
        // trigger another uptune no matter the ratio.
        let mut state = AutotuneState::new(0, 100, 800_000, true);
        state.prev.sys_clk = 900_000;
        let p = params();

        // push well past end_time and accumulate a flattering ratio
        state.current.end_time = 0;
        for _ in 0..40 {
            state.current.shares_ok += 1;
        }

        let should_uptune = on_good_nonce(&mut state, &p, 1_000_000);
        assert!(!should_uptune);
    }

    #[test]
    fn uptune_fires_once_window_closed_with_low_ratio() {
        let mut state = AutotuneState::new(0, 100, 800_000, true);
        state.current.end_time = 0; // window already closed
        let p = params();

        let mut fired = false;
        for _ in 0..40 {
            if on_good_nonce(&mut state, &p, 1_000) {
                fired = true;
                break;
            }
        }
        assert!(fired, "low bad-share ratio past window end should uptune");
    }

    #[test]
    fn ratio_unknown_below_sample_floor() {
        let w = Window::new(0, 100, 800_000);
        assert_eq!(ratio_permille(&w), None);
    }
}
