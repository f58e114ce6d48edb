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

//! Per-chip job pipeline (C3): 4-slot work queue, nonce harvest, and the
//! qstate dispatch state machine.

use crate::chain::Chain;
use crate::chip::Chip;
use crate::error;
use crate::frame::{self};
use crate::host::{NonceSink, SpiTransport};
use crate::work::WorkItem;
use crate::warn;

const RESET_STRATEGY_ABORT: u8 = 0xe5;

/// Write `work` into a chip's next job slot. Returns `Ok(true)` if a
/// previously-occupied slot was rolled over (a nonce range completed),
/// `Ok(false)` if the slot was free.
///
/// On SPI failure the work is retired back to the host, the chip enters
/// cooldown, and the error propagates.
#[allow(clippy::too_many_arguments)]
pub fn set_work(
    chip: &mut Chip,
    chain_id: u8,
    work: WorkItem,
    queue_states: u8,
    spi: &mut dyn SpiTransport,
    num_chips: Option<usize>,
    override_diff: Option<f64>,
    sink: &mut dyn NonceSink,
    now_ms: u64,
) -> error::Result<bool> {
    let slot = chip.last_queued_id as usize;
    let job_id_wire = (slot as u8) + 1;

    let oldest_busy = queue_states & 0x0f;
    let newest_busy = (queue_states >> 4) & 0x0f;
    let overlaps = oldest_busy != 0
        && if oldest_busy <= newest_busy {
            job_id_wire >= oldest_busy && job_id_wire <= newest_busy
        } else {
            job_id_wire >= oldest_busy || job_id_wire <= newest_busy
        };
    if overlaps {
        warn!(
            "chain {} chip {}: queuing job {} into a still-busy slot",
            chain_id, chip.chip_id, job_id_wire
        );
    }

    let rolled_over = chip.work[slot].take();
    if let Some(prev) = rolled_over {
        sink.work_completed(prev);
    }

    match frame::cmd_write_job(spi, job_id_wire, chip.chip_id, &work, override_diff, num_chips) {
        Ok(()) => {
            chip.work[slot] = Some(work);
            chip.last_queued_id = ((slot + 1) & 3) as u8;
            Ok(rolled_over.is_some())
        }
        Err(e) => {
            sink.work_completed(work);
            chip.begin_cooldown(now_ms);
            Err(e)
        }
    }
}

/// Outcome of one `get_nonce` call, used by the caller to drive autotuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceEvent {
    /// No result pending.
    Empty,
    /// Malformed job_id or chip_id; frame flushed and the result dropped.
    Invalid,
    /// Result matched a slot the chain had already cleared (post-flush).
    Stale { chip_index: usize },
    /// Result matched in-flight work and the host accepted the nonce.
    Good { chip_index: usize },
    /// Result matched in-flight work but the host rejected the nonce.
    Rejected { chip_index: usize },
}

/// Poll and process one pending `READ_RESULT_BCAST` record.
pub fn get_nonce(
    chain: &mut Chain,
    spi: &mut dyn SpiTransport,
    sink: &mut dyn NonceSink,
) -> error::Result<NonceEvent> {
    let num_chips = chain.num_chips;
    let record = match frame::cmd_read_result_bcast(spi, num_chips)? {
        None => return Ok(NonceEvent::Empty),
        Some(r) => r,
    };

    if record.chip_id == 0 {
        return Ok(NonceEvent::Empty);
    }
    if record.job_id < 1 || record.job_id > 4 {
        frame::flush_spi(spi)?;
        return Ok(NonceEvent::Invalid);
    }
    if record.chip_id as usize > chain.num_active_chips {
        frame::flush_spi(spi)?;
        return Ok(NonceEvent::Invalid);
    }

    let chip_index = record.chip_id as usize - 1;
    let slot = (record.job_id - 1) as usize;
    let chip = &mut chain.chips[chip_index];

    let work = match chip.work[slot].take() {
        None => {
            chip.stales += 1;
            return Ok(NonceEvent::Stale { chip_index });
        }
        Some(w) => w,
    };

    let nonce = record.nonce.swap_bytes();
    let accepted = sink.submit_nonce(&work, nonce);
    if accepted {
        chip.nonces_found += 1;
    } else {
        chip.hw_errors += 1;
        chain.nonce_ranges_processed -= work.device_diff.round() as i64;
    }
    sink.work_completed(work);

    Ok(if accepted {
        NonceEvent::Good { chip_index }
    } else {
        NonceEvent::Rejected { chip_index }
    })
}

/// Dequeue one work item for `chip_index` and write it through `set_work`,
/// crediting `nonce_ranges_done`/`nonce_ranges_processed` on slot rollover.
#[allow(clippy::too_many_arguments)]
fn dispatch_one(
    chain: &mut Chain,
    chip_index: usize,
    queue_states: u8,
    override_diff: Option<f64>,
    spi: &mut dyn SpiTransport,
    sink: &mut dyn NonceSink,
    now_ms: u64,
) -> error::Result<()> {
    let work = match chain.active_wq.pop_front() {
        Some(w) => w,
        None => return Ok(()),
    };
    let num_chips = chain.num_chips;
    let chain_id = chain.chain_id;
    let chip = &mut chain.chips[chip_index];
    let rolled = set_work(
        chip,
        chain_id,
        work,
        queue_states,
        spi,
        Some(num_chips),
        override_diff,
        sink,
        now_ms,
    )?;
    if rolled {
        chip.nonce_ranges_done += 1;
        chain.nonce_ranges_processed += 1;
    }
    Ok(())
}

/// Run the qstate dispatch state machine for one chip (`queue_states & 3`):
/// `3`=full (skip), `2`=invalid (skip), `1`=one slot free (dispatch once),
/// `0`=both front slots free (dispatch twice, falling through case 1).
#[allow(clippy::too_many_arguments)]
pub fn run_qstate_machine(
    chain: &mut Chain,
    chip_index: usize,
    queue_states: u8,
    override_diff: Option<f64>,
    spi: &mut dyn SpiTransport,
    sink: &mut dyn NonceSink,
    now_ms: u64,
) -> error::Result<()> {
    match queue_states & 0x03 {
        3 => Ok(()),
        2 => {
            warn!(
                "chain {} chip {}: invalid qstate reported",
                chain.chain_id, chain.chips[chip_index].chip_id
            );
            Ok(())
        }
        0 => {
            dispatch_one(chain, chip_index, queue_states, override_diff, spi, sink, now_ms)?;
            dispatch_one(chain, chip_index, queue_states, override_diff, spi, sink, now_ms)
        }
        1 => dispatch_one(chain, chip_index, queue_states, override_diff, spi, sink, now_ms),
        _ => unreachable!(),
    }
}

/// Broadcast a `RESET` with the abort strategy byte, discarding every
/// queued job in the chain. The host's next flush clears per-chip `work[]`.
pub fn abort_work(spi: &mut dyn SpiTransport, num_chips: usize) -> error::Result<()> {
    frame::cmd_reset(spi, 0, RESET_STRATEGY_ABORT, Some(num_chips))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::Chain;
    use crate::chip::Chip;

    struct NullSink;
    impl NonceSink for NullSink {
        fn submit_nonce(&mut self, _work: &WorkItem, _nonce: u32) -> bool {
            true
        }
        fn work_completed(&mut self, _work: WorkItem) {}
    }

    #[derive(Default)]
    struct EchoSpi {
        last_tx: Vec<u8>,
    }
    impl SpiTransport for EchoSpi {
        fn set_speed_hz(&mut self, _hz: u32) -> error::Result<()> {
            Ok(())
        }
        fn transfer(&mut self, tx: Option<&[u8]>, rx: &mut [u8]) -> error::Result<()> {
            match tx {
                Some(tx) => self.last_tx = tx.to_vec(),
                None => {
                    // echo the last tx header at the tail of the poll buffer,
                    // matching this codec's ack_offset = poll_len - resp_len
                    if rx.len() >= 2 && self.last_tx.len() >= 2 {
                        let off = rx.len() - 2;
                        rx[off] = self.last_tx[0];
                        rx[off + 1] = self.last_tx[1];
                    }
                }
            }
            Ok(())
        }
    }

    fn work() -> WorkItem {
        WorkItem::new([0u8; 32], [0u8; 12], 0x1d00ffff, 1.0)
    }

    #[test]
    fn set_work_advances_slot_on_success() {
        let mut chip = Chip::new(1, 0, 800_000, true);
        let mut spi = EchoSpi::default();
        let mut sink = NullSink;
        let rolled = set_work(&mut chip, 0, work(), 0, &mut spi, Some(1), None, &mut sink, 0).unwrap();
        assert!(!rolled); // slot 0 was empty
        assert_eq!(chip.last_queued_id, 1);
        assert!(chip.work[0].is_some());
    }

    #[test]
    fn set_work_reports_rollover() {
        let mut chip = Chip::new(1, 0, 800_000, true);
        chip.work[0] = Some(work());
        let mut spi = EchoSpi::default();
        let mut sink = NullSink;
        let rolled = set_work(&mut chip, 0, work(), 0, &mut spi, Some(1), None, &mut sink, 0).unwrap();
        assert!(rolled);
    }

    #[test]
    fn qstate_zero_dispatches_twice() {
        let mut chain = Chain::new(1, 800_000, 2_000_000, 0);
        chain.num_chips = 1;
        chain.num_active_chips = 1;
        chain.chips.push(Chip::new(1, 0, 800_000, true));
        chain.active_wq.push_back(work());
        chain.active_wq.push_back(work());
        let mut spi = EchoSpi::default();
        let mut sink = NullSink;
        run_qstate_machine(&mut chain, 0, 0, None, &mut spi, &mut sink, 0).unwrap();
        assert_eq!(chain.chips[0].last_queued_id, 2);
        assert!(chain.active_wq.is_empty());
    }

    #[test]
    fn qstate_full_skips() {
        let mut chain = Chain::new(1, 800_000, 2_000_000, 0);
        chain.num_chips = 1;
        chain.num_active_chips = 1;
        chain.chips.push(Chip::new(1, 0, 800_000, true));
        chain.active_wq.push_back(work());
        let mut spi = EchoSpi::default();
        let mut sink = NullSink;
        run_qstate_machine(&mut chain, 0, 3, None, &mut spi, &mut sink, 0).unwrap();
        assert_eq!(chain.chips[0].last_queued_id, 0);
        assert_eq!(chain.active_wq.len(), 1);
    }

    struct RejectSink;
    impl NonceSink for RejectSink {
        fn submit_nonce(&mut self, _work: &WorkItem, _nonce: u32) -> bool {
            false
        }
        fn work_completed(&mut self, _work: WorkItem) {}
    }

    struct ResultSpi;
    impl SpiTransport for ResultSpi {
        fn set_speed_hz(&mut self, _hz: u32) -> error::Result<()> {
            Ok(())
        }
        fn transfer(&mut self, tx: Option<&[u8]>, rx: &mut [u8]) -> error::Result<()> {
            if tx.is_some() {
                return Ok(());
            }
            for b in rx.iter_mut() {
                *b = 0;
            }
            rx[0] = (1 << 4) | crate::frame::op::READ_RESULT;
            rx[1] = 1; // chip_id
            rx[2..6].copy_from_slice(&0xdead_beefu32.to_be_bytes());
            Ok(())
        }
    }

    #[test]
    fn get_nonce_rejected_increments_hw_errors() {
        let mut chain = Chain::new(1, 800_000, 2_000_000, 0);
        chain.num_chips = 1;
        chain.num_active_chips = 1;
        let mut chip = Chip::new(1, 0, 800_000, true);
        chip.work[0] = Some(work());
        chain.chips.push(chip);

        let mut spi = ResultSpi;
        let mut sink = RejectSink;
        let event = get_nonce(&mut chain, &mut spi, &mut sink).unwrap();
        assert_eq!(event, NonceEvent::Rejected { chip_index: 0 });
        assert_eq!(chain.chips[0].hw_errors, 1);
    }
}
