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

//! Scan loop (C6): one scheduler tick's worth of orchestration across the
//! chain lifecycle, job pipeline, autotuner, and board selector.

use crate::autotune::{self, AutotuneParams};
use crate::chain::Chain;
use crate::error;
use crate::frame;
use crate::host::{Clock, NonceSink, SpiTransport, WorkSource};
use crate::job;
use crate::selector::BoardSelector;
use crate::stats::StatsLog;
use crate::warn;

const TEMP_REFRESH_INTERVAL_MS: u64 = 2_000;
const THERMAL_THROTTLE_SLEEP_MS: u64 = 5_000;

/// Attempt to apply a clock delta to one chip: unicast reset, retire its
/// in-flight work, re-run PLL config at the new clock, and on success
/// snapshot the autotune window and log the change.
fn try_adjust_clock(
    chain: &mut Chain,
    chip_index: usize,
    delta_khz: i32,
    params: &AutotuneParams,
    ref_clk_khz: u32,
    spi: &mut dyn SpiTransport,
    clock: &dyn Clock,
    sink: &mut dyn NonceSink,
    stats: &mut StatsLog,
    now_ms: u64,
) -> error::Result<()> {
    let current_khz = chain.chips[chip_index].autotune.current.sys_clk;
    let new_khz = autotune::clamp_new_clock(current_khz, delta_khz, params);
    if new_khz == current_khz {
        return Ok(());
    }

    let num_chips = chain.num_chips;
    let chain_id = chain.chain_id;
    let chip_id = chain.chips[chip_index].chip_id;

    frame::cmd_reset(spi, chip_id, 0xe5, Some(num_chips))?;
    chain.chips[chip_index].retire_all_work(sink);

    let locked = crate::chain::set_pll_config(spi, clock, chip_id, ref_clk_khz, new_khz, Some(num_chips))?;
    if !locked {
        warn!("chain {} chip {}: PLL failed to lock at {} kHz", chain_id, chip_id, new_khz);
        return Ok(());
    }

    let num_cores = chain.chips[chip_index].num_cores;
    let ratio = autotune::ratio_permille(&chain.chips[chip_index].autotune.current).unwrap_or(-1);
    autotune::record_clock_change(&mut chain.chips[chip_index].autotune, now_ms, num_cores, new_khz);
    stats.record_clock_change(now_ms, delta_khz > 0, chain_id, chip_id, ratio, new_khz, current_khz)?;
    Ok(())
}

/// One scan tick for a chain, per §4.6. Returns hashes credited
/// (`nonce_ranges_processed << 32`).
#[allow(clippy::too_many_arguments)]
pub fn scanwork(
    chain: &mut Chain,
    selector: &dyn BoardSelector,
    spi: &mut dyn SpiTransport,
    clock: &dyn Clock,
    sink: &mut dyn NonceSink,
    params: &AutotuneParams,
    ref_clk_khz: u32,
    cutoff_temp_c: f32,
    override_diff: Option<f64>,
    stats: &mut StatsLog,
) -> error::Result<i64> {
    if chain.num_cores == 0 {
        chain.disabled = true;
        return Ok(0);
    }

    let guard = match selector.select(chain.chain_id as usize)? {
        None => return Ok(0),
        Some(g) => g,
    };

    spi.set_speed_hz(chain.spi_clk_hz)?;
    let now_ms = clock.now_ms();

    if chain.last_temp_time + TEMP_REFRESH_INTERVAL_MS < now_ms {
        if let Ok(t) = selector.get_temp(&guard, chain.chain_id as usize) {
            chain.temp = Some(t);
            chain.last_temp_time = now_ms;
        }
    }

    loop {
        match job::get_nonce(chain, spi, sink)? {
            job::NonceEvent::Empty => break,
            job::NonceEvent::Good { chip_index } => {
                let should_uptune = {
                    let chip = &mut chain.chips[chip_index];
                    autotune::on_good_nonce(&mut chip.autotune, params, now_ms)
                };
                if should_uptune {
                    try_adjust_clock(
                        chain,
                        chip_index,
                        params.delta_clk_khz as i32,
                        params,
                        ref_clk_khz,
                        spi,
                        clock,
                        sink,
                        stats,
                        now_ms,
                    )?;
                }
            }
            job::NonceEvent::Rejected { chip_index } => {
                let num_cores = chain.chips[chip_index].num_cores;
                let decision = {
                    let chip = &mut chain.chips[chip_index];
                    autotune::on_bad_nonce(&mut chip.autotune, params, now_ms, num_cores)
                };
                if let Some(delta) = decision {
                    try_adjust_clock(chain, chip_index, delta, params, ref_clk_khz, spi, clock, sink, stats, now_ms)?;
                }
            }
            job::NonceEvent::Stale { .. } | job::NonceEvent::Invalid => {}
        }
    }

    if let Some(t) = chain.temp {
        if t > cutoff_temp_c {
            clock.sleep_ms(THERMAL_THROTTLE_SLEEP_MS);
            selector.release(guard);
            return Ok(0);
        }
    }

    for idx in (0..chain.num_active_chips).rev() {
        if chain.chips[idx].disabled || !chain.chips[idx].reachable() {
            continue;
        }
        let num_chips = chain.num_chips;
        let chip_id = chain.chips[idx].chip_id;
        match frame::cmd_read_reg(spi, chip_id, Some(num_chips)) {
            Ok(status) => {
                let queue_states = status[6];
                job::run_qstate_machine(chain, idx, queue_states, override_diff, spi, sink, now_ms)?;
            }
            Err(_) => {
                chain.chips[idx].begin_cooldown(now_ms);
            }
        }
    }

    chain.check_disabled_chips(spi, now_ms)?;
    selector.release(guard);

    let credited = chain.nonce_ranges_processed.max(0);
    chain.nonce_ranges_processed = 0;
    Ok(credited << 32)
}

/// Abort all in-flight jobs, let any due uptune supersede a flush on each
/// chip, then drain the host work queue.
#[allow(clippy::too_many_arguments)]
pub fn flush_work(
    chain: &mut Chain,
    selector: &dyn BoardSelector,
    spi: &mut dyn SpiTransport,
    clock: &dyn Clock,
    sink: &mut dyn NonceSink,
    params: &AutotuneParams,
    ref_clk_khz: u32,
    stats: &mut StatsLog,
) -> error::Result<()> {
    let guard = match selector.select(chain.chain_id as usize)? {
        None => return Ok(()),
        Some(g) => g,
    };

    job::abort_work(spi, chain.num_chips)?;
    let now_ms = clock.now_ms();

    for idx in 0..chain.chips.len() {
        let should_uptune = autotune::check_uptune(&chain.chips[idx].autotune, params, now_ms);
        if should_uptune {
            try_adjust_clock(
                chain,
                idx,
                params.delta_clk_khz as i32,
                params,
                ref_clk_khz,
                spi,
                clock,
                sink,
                stats,
                now_ms,
            )?;
        } else {
            chain.chips[idx].retire_all_work(sink);
        }
    }

    chain.active_wq.clear();
    selector.release(guard);
    Ok(())
}

/// `true` once the chain's queue already holds `2 * num_active_chips` items;
/// otherwise pulls and enqueues one more from the host.
pub fn queue_full(chain: &mut Chain, source: &mut dyn WorkSource) -> bool {
    if chain.active_wq.len() >= 2 * chain.num_active_chips {
        return true;
    }
    if let Some(work) = source.get_queued() {
        chain.active_wq.push_back(work);
    }
    false
}
