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

//! Chain lifecycle (C2): detection, BIST bring-up, PLL configuration, and
//! per-chip health tracking for one SPI daisy chain.

use std::collections::VecDeque;

use crate::chip::{self, Chip, ChipClass};
use crate::error::{self, ErrorKind};
use crate::frame::{self, op};
use crate::host::{Clock, SpiTransport};
use crate::pll;
use crate::work::WorkItem;
use crate::{info, warn};

pub const MAX_CHAIN_LENGTH: usize = 64;
const DETECT_SPI_HZ: u32 = 100_000;
const BIST_INITIAL_PLL: [u8; 6] = [0x82, 0x19, 0x21, 0x84, 0x00, 0x00];
const PLL_LOCK_POLL_ATTEMPTS: u32 = 25;
const PLL_LOCK_POLL_INTERVAL_MS: u64 = 40;

const BROKEN_RECLOCK_KHZ: u32 = 400_000;
const WEAK_RECLOCK_KHZ: u32 = 600_000;

/// Scan for the chain's length by echoing a `RESET` header back through the
/// shift register, up to `2 * MAX_CHAIN_LENGTH` words.
pub fn detect_chain_length(spi: &mut dyn SpiTransport) -> error::Result<usize> {
    let tx = [op::RESET, 0, 0, 0, 0, 0];
    let mut tx_scratch = [0u8; 6];
    spi.transfer(Some(&tx), &mut tx_scratch)
        .map_err(|_| ErrorKind::Spi("chain detect header failed".to_string()))?;

    let mut rx = [0u8; 2];
    for i in 0..(2 * MAX_CHAIN_LENGTH) {
        spi.transfer(None, &mut rx)
            .map_err(|_| ErrorKind::Spi("chain detect poll failed".to_string()))?;
        if rx == [op::RESET, 0x00] {
            return Ok(i / 2 + 1);
        }
    }
    Ok(0)
}

/// Write a PLL register to one chip and poll `READ_REG` until it reports
/// lock (bit0 of `rx[4]`) and echoes the written `reg[0..1]`.
pub fn set_pll_config(
    spi: &mut dyn SpiTransport,
    clock: &dyn Clock,
    chip_id: u8,
    ref_khz: u32,
    sys_khz: u32,
    num_chips: Option<usize>,
) -> error::Result<bool> {
    let reg = pll::get_pll_reg(ref_khz, sys_khz);
    frame::cmd_write_reg(spi, chip_id, &reg, num_chips)?;
    poll_pll_lock(spi, clock, chip_id, &reg, num_chips)
}

fn poll_pll_lock(
    spi: &mut dyn SpiTransport,
    clock: &dyn Clock,
    chip_id: u8,
    reg: &pll::PllBytes,
    num_chips: Option<usize>,
) -> error::Result<bool> {
    for _ in 0..PLL_LOCK_POLL_ATTEMPTS {
        clock.sleep_ms(PLL_LOCK_POLL_INTERVAL_MS);
        let status = frame::cmd_read_reg(spi, chip_id, num_chips)?;
        let locked = status[4] & 1 != 0;
        let echoes = status[2] == reg[0] && status[3] == reg[1];
        if locked && echoes {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Broadcast a PLL write, then verify lock on every chip individually (the
/// spec requires broadcast writes be confirmed chip-by-chip).
pub fn broadcast_pll_and_verify(
    spi: &mut dyn SpiTransport,
    clock: &dyn Clock,
    ref_khz: u32,
    sys_khz: u32,
    num_chips: usize,
) -> error::Result<Vec<bool>> {
    let reg = pll::get_pll_reg(ref_khz, sys_khz);
    frame::cmd_write_reg(spi, 0, &reg, Some(num_chips))?;

    let mut results = Vec::with_capacity(num_chips);
    for chip_id in 1..=num_chips as u8 {
        results.push(poll_pll_lock(spi, clock, chip_id, &reg, Some(num_chips))?);
    }
    Ok(results)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckChipResult {
    pub class: ChipClass,
    pub num_cores: u32,
    /// Target clock (kHz) this chip should be re-configured to, if any.
    pub reclock_khz: Option<u32>,
    pub disable: bool,
}

/// Classify a chip from its `READ_REG` status and decide whether it needs
/// re-clocking or disabling.
pub fn check_chip(status: &[u8; 8], bypass: bool) -> CheckChipResult {
    let num_cores = status[7] as u32;
    let class = chip::classify(num_cores, bypass);
    match class {
        ChipClass::Bypass => CheckChipResult {
            class,
            num_cores: 0,
            reclock_khz: None,
            disable: true,
        },
        ChipClass::Broken => CheckChipResult {
            class,
            num_cores,
            reclock_khz: Some(BROKEN_RECLOCK_KHZ),
            disable: true,
        },
        ChipClass::Weak => CheckChipResult {
            class,
            num_cores,
            reclock_khz: Some(WEAK_RECLOCK_KHZ),
            disable: false,
        },
        ChipClass::Normal => CheckChipResult {
            class,
            num_cores,
            reclock_khz: None,
            disable: false,
        },
    }
}

/// One SPI-attached daisy chain of A1 chips.
pub struct Chain {
    pub chain_id: u8,
    pub num_chips: usize,
    pub num_active_chips: usize,
    pub num_cores: u32,
    pub chips: Vec<Chip>,
    pub active_wq: VecDeque<WorkItem>,
    pub disabled: bool,
    pub temp: Option<f32>,
    pub last_temp_time: u64,
    pub sys_clk_khz: u32,
    /// SPI bus speed used once the chain is past the slow detect phase.
    pub spi_clk_hz: u32,
    pub nonce_ranges_processed: i64,
    /// Bit `i` set means chip `i+1` is listed in the bypass bitmask for this chain.
    pub bypass_mask: u64,
}

impl Chain {
    pub fn new(chain_id: u8, sys_clk_khz: u32, spi_clk_hz: u32, bypass_mask: u64) -> Self {
        Chain {
            chain_id,
            num_chips: 0,
            num_active_chips: 0,
            num_cores: 0,
            chips: Vec::new(),
            active_wq: VecDeque::new(),
            disabled: false,
            temp: None,
            last_temp_time: 0,
            sys_clk_khz,
            spi_clk_hz,
            nonce_ranges_processed: 0,
            bypass_mask,
        }
    }

    fn is_bypassed(&self, chip_index: usize) -> bool {
        self.bypass_mask & (1 << chip_index) != 0
    }

    /// Full bring-up sequence: detect length, BIST, target-clock PLL, and
    /// per-chip health classification.
    #[allow(clippy::too_many_arguments)]
    pub fn init_chain(
        &mut self,
        spi: &mut dyn SpiTransport,
        clock: &dyn Clock,
        ref_khz: u32,
        target_sys_khz: u32,
        now_ms: u64,
        autotune_enabled: bool,
        chip_num_cap: Option<usize>,
    ) -> error::Result<()> {
        spi.set_speed_hz(DETECT_SPI_HZ)?;
        let num_chips = detect_chain_length(spi)?;
        if num_chips == 0 {
            self.disabled = true;
            return Err(ErrorKind::Chain(self.chain_id as usize, "no chips detected".to_string()).into());
        }
        if num_chips > MAX_CHAIN_LENGTH {
            return Err(ErrorKind::Chain(
                self.chain_id as usize,
                format!("detected {} chips, exceeds MAX_CHAIN_LENGTH", num_chips),
            )
            .into());
        }
        self.num_chips = num_chips;

        // Initial low-frequency broadcast PLL write (~200 MHz) so BIST itself
        // runs at a conservative clock before the target clock is applied.
        frame::cmd_write_reg(spi, 0, &BIST_INITIAL_PLL, Some(num_chips))?;
        frame::cmd_bist_start(spi)?;

        let lock_results = broadcast_pll_and_verify(spi, clock, ref_khz, target_sys_khz, num_chips)?;
        spi.set_speed_hz(self.spi_clk_hz)?;
        frame::cmd_bist_fix(spi, num_chips)?;

        self.chips = (1..=num_chips)
            .map(|i| Chip::new(i as u8, now_ms, target_sys_khz, autotune_enabled))
            .collect();

        for (idx, chip) in self.chips.iter_mut().enumerate() {
            if !lock_results.get(idx).copied().unwrap_or(false) {
                warn!("chain {} chip {} failed PLL lock during init", self.chain_id, chip.chip_id);
            }
            let status = frame::cmd_read_reg(spi, chip.chip_id, Some(num_chips))?;
            let bypass = self.is_bypassed(idx);
            let decision = check_chip(&status, bypass);
            chip.num_cores = decision.num_cores;
            chip.disabled = decision.disable;

            if let Some(reclock) = decision.reclock_khz {
                let _ = set_pll_config(spi, clock, chip.chip_id, ref_khz, reclock, Some(num_chips));
            }
            info!(
                "chain {} chip {}: {:?}, {} cores",
                self.chain_id, chip.chip_id, decision.class, chip.num_cores
            );
        }

        self.num_active_chips = chip_num_cap.map(|c| c.min(num_chips)).unwrap_or(num_chips);
        self.num_cores = self.chips[..self.num_active_chips]
            .iter()
            .filter(|c| !c.disabled)
            .map(|c| c.num_cores)
            .sum();
        Ok(())
    }

    /// Retry cooling-down chips once their 30s window has elapsed.
    pub fn check_disabled_chips(
        &mut self,
        spi: &mut dyn SpiTransport,
        now_ms: u64,
    ) -> error::Result<()> {
        let num_chips = self.num_chips;
        for chip in self.chips.iter_mut() {
            if chip.disabled || chip.cooldown_begin == 0 {
                continue;
            }
            if !chip.cooldown_elapsed(now_ms) {
                continue;
            }
            match frame::cmd_read_reg(spi, chip.chip_id, Some(num_chips)) {
                Ok(status) => {
                    chip.num_cores = status[7] as u32;
                    chip.record_cooldown_retry_success();
                    self.num_cores += chip.num_cores;
                }
                Err(_) => {
                    if chip.record_cooldown_retry_failure() {
                        self.num_cores = self.num_cores.saturating_sub(chip.num_cores);
                        warn!(
                            "chain {} chip {} terminally disabled after {} cooldown retries",
                            self.chain_id, chip.chip_id, chip::DISABLE_CHIP_FAIL_THRESHOLD
                        );
                    }
                }
            }
        }
        Ok(())
    }
}
