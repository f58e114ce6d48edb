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

//! Per-chip state: the 4-slot job queue, health counters, and health
//! classification produced during BIST (C2/C3 shared data).

use crate::autotune::AutotuneState;
use crate::host::NonceSink;
use crate::work::WorkItem;

pub const JOB_SLOTS: usize = 4;

/// A chip is retried once per cooldown window before counting toward the
/// terminal-disable threshold.
pub const COOLDOWN_MS: u64 = 30_000;

/// After this many failed cooldown retries the chip is terminally disabled.
pub const DISABLE_CHIP_FAIL_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipClass {
    Normal,
    Weak,
    Broken,
    Bypass,
}

/// Classify a chip from its reported core count and whether it's named in
/// the per-chain bypass bitmask.
pub fn classify(num_cores: u32, bypass: bool) -> ChipClass {
    if bypass {
        ChipClass::Bypass
    } else if num_cores < 26 {
        ChipClass::Broken
    } else if num_cores < 30 {
        ChipClass::Weak
    } else {
        ChipClass::Normal
    }
}

#[derive(Debug)]
pub struct Chip {
    pub chip_id: u8,
    pub num_cores: u32,
    /// In-flight work by job_id slot (`work[j] == None` iff slot `j` is free).
    pub work: [Option<WorkItem>; JOB_SLOTS],
    /// Next slot to fill, 0..3.
    pub last_queued_id: u8,
    pub hw_errors: u64,
    pub stales: u64,
    pub nonces_found: u64,
    pub nonce_ranges_done: u64,
    /// Nonzero while the chip is cooling down from a transient failure.
    pub cooldown_begin: u64,
    pub fail_count: u32,
    /// Terminal: set once `fail_count` exceeds the threshold.
    pub disabled: bool,
    pub autotune: AutotuneState,
}

impl Chip {
    pub fn new(chip_id: u8, now_ms: u64, sys_clk_khz: u32, autotune_enabled: bool) -> Self {
        Chip {
            chip_id,
            num_cores: 0,
            work: Default::default(),
            last_queued_id: 0,
            hw_errors: 0,
            stales: 0,
            nonces_found: 0,
            nonce_ranges_done: 0,
            cooldown_begin: 0,
            fail_count: 0,
            disabled: false,
            autotune: AutotuneState::new(now_ms, 0, sys_clk_khz, autotune_enabled),
        }
    }

    /// A chip is reachable iff not terminally disabled and not cooling down.
    pub fn reachable(&self) -> bool {
        !self.disabled && self.cooldown_begin == 0
    }

    pub fn begin_cooldown(&mut self, now_ms: u64) {
        self.cooldown_begin = now_ms;
    }

    pub fn cooldown_elapsed(&self, now_ms: u64) -> bool {
        self.cooldown_begin != 0 && now_ms >= self.cooldown_begin + COOLDOWN_MS
    }

    /// A failed cooldown retry. Returns `true` if this failure pushed the
    /// chip into terminal disable.
    pub fn record_cooldown_retry_failure(&mut self) -> bool {
        self.fail_count += 1;
        if self.fail_count > DISABLE_CHIP_FAIL_THRESHOLD {
            self.disabled = true;
            true
        } else {
            false
        }
    }

    /// A successful cooldown retry clears the cooldown and resets the fail streak.
    pub fn record_cooldown_retry_success(&mut self) {
        self.cooldown_begin = 0;
        self.fail_count = 0;
    }

    /// Retire every occupied slot through the host sink and reset the queue
    /// pointer. Used by `abort_work`/`flush_work` and by autotuner restarts.
    pub fn retire_all_work(&mut self, sink: &mut dyn NonceSink) {
        for slot in self.work.iter_mut() {
            if let Some(w) = slot.take() {
                sink.work_completed(w);
            }
        }
        self.last_queued_id = 0;
    }
}
