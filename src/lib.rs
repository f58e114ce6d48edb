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

//! Device driver for Bitmine A1 SHA-256 ASIC chains.
//!
//! [`Driver`] is the host-facing facade: it owns every detected [`Chain`],
//! the board selector, and the stats log, and implements the `detect` /
//! `scanwork` / `queue_full` / `flush_work` / `get_statline_before` /
//! `thread_shutdown` contract a mining framework drives one chain at a time.
//! Everything underneath (`frame`, `chain`, `job`, `autotune`, `selector`)
//! is usable standalone by a host that wants finer-grained control.

pub mod autotune;
pub mod chain;
pub mod chip;
pub mod config;
pub mod error;
pub mod frame;
pub mod host;
pub mod job;
pub mod logging;
pub mod pll;
pub mod scan;
pub mod selector;
pub mod stats;
pub mod target;
pub mod work;

use crate::autotune::AutotuneParams;
use crate::chain::Chain;
use crate::config::Config;
use crate::error::{self, ErrorKind};
use crate::host::{Clock, NonceSink, SpiTransport, WorkSource};
use crate::selector::BoardSelector;
use crate::stats::StatsLog;
use crate::{info, warn};

/// Top-level host-facing driver: one instance per product, one [`Chain`] per
/// detected SPI daisy chain, all sharing one board selector and stats log.
pub struct Driver {
    config: Config,
    chains: Vec<Chain>,
    selector: Box<dyn BoardSelector>,
    stats: StatsLog,
}

impl Driver {
    /// Probe every chain the selector exposes and bring each one up. A
    /// hotplug probe is a no-op (`Ok(None)`) — this product has no hotplug
    /// support. Chains that fail to initialize are logged and skipped, not
    /// fatal to the whole detect pass; only a fully empty result is an error.
    pub fn detect(
        hotplug: bool,
        spi: &mut dyn SpiTransport,
        clock: &dyn Clock,
        mut selector: Box<dyn BoardSelector>,
        config: Config,
    ) -> error::Result<Option<Self>> {
        if hotplug {
            return Ok(None);
        }

        let stats = StatsLog::open(config.stats_log_path.as_deref())?;
        let now_ms = clock.now_ms();
        let mut chains = Vec::new();

        for chain_id in 0..selector.max_chains() {
            let guard = match selector.select(chain_id)? {
                None => break,
                Some(g) => g,
            };

            let board = chain_id;
            let mut chain = Chain::new(
                chain_id as u8,
                config.board_sys_clk_khz(board),
                config.board_spi_clk_hz(board),
                config.board_bypass_mask(board),
            );
            let result = chain.init_chain(
                spi,
                clock,
                config.ref_clk_khz,
                config.board_sys_clk_khz(board),
                now_ms,
                config.autotune_enabled,
                config.chip_num.map(|n| n as usize),
            );
            selector.release(guard);

            match result {
                Ok(()) => {
                    info!("chain {}: registered, {} cores", chain_id, chain.num_cores);
                    chains.push(chain);
                }
                Err(e) => {
                    warn!("chain {}: failed to initialize: {}", chain_id, e);
                }
            }
        }

        if chains.is_empty() {
            selector.exit();
            return Err(ErrorKind::General("detect: no chains registered".to_string()).into());
        }

        Ok(Some(Driver { config, chains, selector, stats }))
    }

    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    fn autotune_params(&self) -> AutotuneParams {
        AutotuneParams {
            lower_clk_khz: self.config.lower_clk_khz,
            upper_clk_khz: self.config.upper_clk_khz,
            lower_ratio_pm: self.config.lower_ratio_pm,
            upper_ratio_pm: self.config.upper_ratio_pm,
            delta_clk_khz: 4_000,
        }
    }

    /// One scheduler tick for `chain_index`. Returns hashes credited
    /// (`nonce_ranges_processed << 32`).
    pub fn scanwork(
        &mut self,
        chain_index: usize,
        spi: &mut dyn SpiTransport,
        clock: &dyn Clock,
        sink: &mut dyn NonceSink,
        cutoff_temp_c: f32,
    ) -> error::Result<i64> {
        let params = self.autotune_params();
        let ref_clk_khz = self.config.ref_clk_khz;
        let override_diff = self.config.override_diff.map(|d| d as f64);
        let chain = &mut self.chains[chain_index];
        scan::scanwork(
            chain,
            self.selector.as_ref(),
            spi,
            clock,
            sink,
            &params,
            ref_clk_khz,
            cutoff_temp_c,
            override_diff,
            &mut self.stats,
        )
    }

    /// `true` once `chain_index`'s queue already holds `2 * num_active_chips`
    /// items; otherwise pulls and enqueues one more from `source`.
    pub fn queue_full(&mut self, chain_index: usize, source: &mut dyn WorkSource) -> bool {
        scan::queue_full(&mut self.chains[chain_index], source)
    }

    /// Abort in-flight work on `chain_index`, letting any due uptune
    /// supersede the flush, then drain its host work queue.
    pub fn flush_work(
        &mut self,
        chain_index: usize,
        spi: &mut dyn SpiTransport,
        clock: &dyn Clock,
        sink: &mut dyn NonceSink,
    ) -> error::Result<()> {
        let params = self.autotune_params();
        let ref_clk_khz = self.config.ref_clk_khz;
        let chain = &mut self.chains[chain_index];
        scan::flush_work(
            chain,
            self.selector.as_ref(),
            spi,
            clock,
            sink,
            &params,
            ref_clk_khz,
            &mut self.stats,
        )
    }

    /// One-line status prefix: ` CC:AA/TTT  TT°C` (chain_id, active chips,
    /// active cores, last-sampled temperature).
    pub fn get_statline_before(&self, chain_index: usize) -> String {
        let chain = &self.chains[chain_index];
        format!(
            " {:02}:{:02}/{:03}  {:>2.0}\u{b0}C",
            chain.chain_id,
            chain.num_active_chips,
            chain.num_cores,
            chain.temp.unwrap_or(0.0),
        )
    }

    /// Close the stats file and release the board selector's expander.
    pub fn thread_shutdown(&mut self) {
        self.stats.close();
        self.selector.exit();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::selector::DummySelector;
    use crate::work::WorkItem;
    use std::sync::Mutex;

    struct FixedClock(Mutex<u64>);
    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            *self.0.lock().unwrap()
        }
        fn sleep_ms(&self, ms: u64) {
            *self.0.lock().unwrap() += ms;
        }
    }

    /// Scripted single-chip chain: echoes the detect header at word 1 (one
    /// chip); answers `WRITE_REG` with an opcode/chip_id echo and remembers
    /// the register bytes so the following `READ_REG` polls report them back
    /// locked, with a healthy 64-core count.
    struct ScriptedSpi {
        word_count: usize,
        last_tx: Vec<u8>,
        last_reg: [u8; 2],
    }
    impl SpiTransport for ScriptedSpi {
        fn set_speed_hz(&mut self, _hz: u32) -> error::Result<()> {
            Ok(())
        }
        fn transfer(&mut self, tx: Option<&[u8]>, rx: &mut [u8]) -> error::Result<()> {
            if let Some(tx) = tx {
                self.last_tx = tx.to_vec();
                for b in rx.iter_mut() {
                    *b = 0;
                }
                return Ok(());
            }

            let is_detect_poll = self.last_tx.len() == 6 && self.last_tx[0] == crate::frame::op::RESET;
            if is_detect_poll {
                if self.word_count == 1 {
                    rx[0] = crate::frame::op::RESET;
                    rx[1] = 0x00;
                } else {
                    rx[0] = 0xff;
                    rx[1] = 0xff;
                }
                self.word_count += 1;
                return Ok(());
            }

            for b in rx.iter_mut() {
                *b = 0;
            }
            let len = rx.len();
            let cmd = self.last_tx.first().copied().unwrap_or(0);
            let chip_id = self.last_tx.get(1).copied().unwrap_or(0);
            if cmd == crate::frame::op::WRITE_REG {
                self.last_reg = [
                    self.last_tx.get(2).copied().unwrap_or(0),
                    self.last_tx.get(3).copied().unwrap_or(0),
                ];
                rx[len - 2] = cmd;
                rx[len - 1] = chip_id;
            } else if cmd == crate::frame::op::READ_REG {
                rx[len - 8] = crate::frame::op::READ_REG_RESP;
                rx[len - 7] = chip_id;
                rx[len - 6] = self.last_reg[0];
                rx[len - 5] = self.last_reg[1];
                rx[len - 4] = 1; // locked
                rx[len - 1] = 64; // core count
            } else if len >= 2 {
                rx[len - 2] = cmd;
                rx[len - 1] = chip_id;
            }
            Ok(())
        }
    }

    struct NullSink;
    impl NonceSink for NullSink {
        fn submit_nonce(&mut self, _work: &WorkItem, _nonce: u32) -> bool {
            true
        }
        fn work_completed(&mut self, _work: WorkItem) {}
    }

    #[test]
    fn hotplug_detect_is_a_noop() {
        let mut spi = ScriptedSpi { word_count: 0, last_tx: Vec::new(), last_reg: [0, 0] };
        let clock = FixedClock(Mutex::new(0));
        let selector = Box::new(DummySelector::new());
        let driver = Driver::detect(true, &mut spi, &clock, selector, Config::default()).unwrap();
        assert!(driver.is_none());
    }

    #[test]
    fn detect_registers_single_chain_and_reports_statline() {
        let mut spi = ScriptedSpi { word_count: 0, last_tx: Vec::new(), last_reg: [0, 0] };
        let clock = FixedClock(Mutex::new(0));
        let selector = Box::new(DummySelector::new());
        let mut config = Config::default();
        config.stats_log_path = None;
        let driver = Driver::detect(false, &mut spi, &clock, selector, config)
            .unwrap()
            .expect("single-chip chain should register");
        assert_eq!(driver.num_chains(), 1);
        let statline = driver.get_statline_before(0);
        assert!(statline.contains("00:01/064"));
    }

    #[test]
    fn detect_fails_when_no_chips_found() {
        struct SilentSpi;
        impl SpiTransport for SilentSpi {
            fn set_speed_hz(&mut self, _hz: u32) -> error::Result<()> {
                Ok(())
            }
            fn transfer(&mut self, _tx: Option<&[u8]>, rx: &mut [u8]) -> error::Result<()> {
                for b in rx.iter_mut() {
                    *b = 0xff;
                }
                Ok(())
            }
        }
        let mut spi = SilentSpi;
        let clock = FixedClock(Mutex::new(0));
        let selector = Box::new(DummySelector::new());
        let err = Driver::detect(false, &mut spi, &clock, selector, Config::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::General("detect: no chains registered".to_string()));
    }

    #[test]
    fn queue_full_and_flush_work_round_trip_through_driver() {
        let mut spi = ScriptedSpi { word_count: 0, last_tx: Vec::new(), last_reg: [0, 0] };
        let clock = FixedClock(Mutex::new(0));
        let selector = Box::new(DummySelector::new());
        let mut driver = Driver::detect(false, &mut spi, &clock, selector, Config::default())
            .unwrap()
            .unwrap();

        struct OneShotSource(bool);
        impl WorkSource for OneShotSource {
            fn get_queued(&mut self) -> Option<WorkItem> {
                if self.0 {
                    self.0 = false;
                    Some(WorkItem::new([0u8; 32], [0u8; 12], 0x1d00ffff, 1.0))
                } else {
                    None
                }
            }
        }
        let mut source = OneShotSource(true);
        assert!(!driver.queue_full(0, &mut source));

        let mut sink = NullSink;
        driver.flush_work(0, &mut spi, &clock, &mut sink).unwrap();
        driver.thread_shutdown();
    }
}
