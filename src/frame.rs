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

//! SPI command frame codec (C1): builds/parses A1 daisy-chain command frames.
//!
//! Chips are wired as a shift register, so every command transmits a header
//! plus mandatory padding to keep the clock running while the frame travels
//! down the chain and the response travels back.

use crate::error::{self, ErrorKind};
use crate::host::SpiTransport;
use crate::target;
use crate::work::WorkItem;

pub mod op {
    pub const BIST_START: u8 = 0x01;
    pub const BIST_FIX: u8 = 0x03;
    pub const RESET: u8 = 0x04;
    pub const WRITE_JOB: u8 = 0x07;
    pub const READ_RESULT: u8 = 0x08;
    pub const WRITE_REG: u8 = 0x09;
    pub const READ_REG: u8 = 0x0a;
    pub const READ_REG_RESP: u8 = 0x1a;
}

/// Result record parsed out of a `READ_RESULT_BCAST` scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultRecord {
    pub job_id: u8,
    pub chip_id: u8,
    /// Nonce in host byte order (already byte-swapped from the wire).
    pub nonce: u32,
}

/// Build a simple command frame: 2-byte header + payload, padded out to
/// `4 + payload.len()` bytes total (header + payload + fixed trailing pad).
fn build_simple_frame(cmd: u8, chip_id: u8, payload: &[u8]) -> Vec<u8> {
    let tx_len = 4 + payload.len();
    let mut frame = Vec::with_capacity(tx_len);
    frame.push(cmd);
    frame.push(chip_id);
    frame.extend_from_slice(payload);
    frame.resize(tx_len, 0);
    frame
}

/// How many bytes to read back after transmitting `tx_frame`, per §4.1.
fn poll_len(chip_id: u8, resp_len: usize, num_chips: Option<usize>) -> usize {
    if chip_id == 0 {
        match num_chips {
            Some(n) => resp_len + 4 * n,
            // chain length not known yet (during detection): assume 8 chips
            None => resp_len + 4 * 8 + 32,
        }
    } else {
        resp_len + 4 * (chip_id as usize) - 2
    }
}

/// Offset of the acknowledgement within the post-tx RX buffer.
fn ack_offset(poll_len: usize, resp_len: usize) -> usize {
    poll_len.saturating_sub(resp_len)
}

/// Generic exec: transmit `tx_frame`, then read back `poll_len` bytes and
/// return the `resp_len`-byte acknowledgement slice located within it.
pub fn exec(
    spi: &mut dyn SpiTransport,
    tx_frame: &[u8],
    chip_id: u8,
    resp_len: usize,
    num_chips: Option<usize>,
) -> error::Result<Vec<u8>> {
    let mut tx_scratch = vec![0u8; tx_frame.len()];
    spi.transfer(Some(tx_frame), &mut tx_scratch)
        .map_err(|_| ErrorKind::Spi("command header transfer failed".to_string()))?;

    let plen = poll_len(chip_id, resp_len, num_chips);
    let mut rx = vec![0u8; plen];
    spi.transfer(None, &mut rx)
        .map_err(|_| ErrorKind::Spi("response poll transfer failed".to_string()))?;

    let off = ack_offset(plen, resp_len);
    Ok(rx[off..off + resp_len].to_vec())
}

/// Clock out 64 zero bytes to drain the chain pipeline after an error.
pub fn flush_spi(spi: &mut dyn SpiTransport) -> error::Result<()> {
    let tx = [0u8; 64];
    let mut rx = [0u8; 64];
    spi.transfer(Some(&tx), &mut rx)
        .map_err(|_| ErrorKind::Spi("flush failed".to_string()))
}

/// `RESET` with a broadcast/unicast strategy byte (payload is 4 zero bytes
/// unless a non-zero strategy, e.g. `0xe5`, is requested).
pub fn cmd_reset(
    spi: &mut dyn SpiTransport,
    chip_id: u8,
    strategy: u8,
    num_chips: Option<usize>,
) -> error::Result<Vec<u8>> {
    let payload = [strategy, 0, 0, 0];
    let frame = build_simple_frame(op::RESET, chip_id, &payload);
    exec(spi, &frame, chip_id, 2, num_chips)
}

/// `BIST_START` broadcast: chips self-enumerate and begin reporting core counts.
pub fn cmd_bist_start(spi: &mut dyn SpiTransport) -> error::Result<()> {
    let frame = build_simple_frame(op::BIST_START, 0, &[0, 0, 0, 0]);
    exec(spi, &frame, 0, 2, None)?;
    Ok(())
}

/// `BIST_FIX` broadcast: latches the chain after the BIST sweep.
pub fn cmd_bist_fix(spi: &mut dyn SpiTransport, num_chips: usize) -> error::Result<()> {
    let frame = build_simple_frame(op::BIST_FIX, 0, &[0, 0, 0, 0]);
    exec(spi, &frame, 0, 2, Some(num_chips))?;
    Ok(())
}

/// `WRITE_REG`: write a 6-byte register payload (used for PLL configuration).
/// Validates the 2-byte response echoes the tx header verbatim.
pub fn cmd_write_reg(
    spi: &mut dyn SpiTransport,
    chip_id: u8,
    reg: &[u8; 6],
    num_chips: Option<usize>,
) -> error::Result<()> {
    let frame = build_simple_frame(op::WRITE_REG, chip_id, reg);
    let ret = exec(spi, &frame, chip_id, 2, num_chips)?;
    if ret[0] != frame[0] || ret[1] != frame[1] {
        return Err(ErrorKind::Protocol(format!(
            "WRITE_REG echo mismatch: sent {:#04x} {:#04x}, got {:#04x} {:#04x}",
            frame[0], frame[1], ret[0], ret[1]
        ))
        .into());
    }
    Ok(())
}

/// `READ_REG`: read back an 8-byte register status. Validates `ret[0] ==
/// READ_REG_RESP` and `ret[1] == chip_id`.
pub fn cmd_read_reg(
    spi: &mut dyn SpiTransport,
    chip_id: u8,
    num_chips: Option<usize>,
) -> error::Result<[u8; 8]> {
    let frame = build_simple_frame(op::READ_REG, chip_id, &[0, 0, 0, 0]);
    let ret = exec(spi, &frame, chip_id, 8, num_chips)?;
    if ret[0] != op::READ_REG_RESP || ret[1] != chip_id {
        return Err(ErrorKind::Protocol(format!(
            "READ_REG reply mismatch from chip {}: {:#04x} {:#04x}",
            chip_id, ret[0], ret[1]
        ))
        .into());
    }
    let mut out = [0u8; 8];
    out.copy_from_slice(&ret);
    Ok(out)
}

/// Byte-reverse a 256-bit (32-byte) unit.
pub fn swab256(data: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = data[31 - i];
    }
    out
}

/// Build the fixed 58-byte `WRITE_JOB` frame for one chip's job slot.
pub fn build_write_job_frame(
    job_id: u8,
    chip_id: u8,
    work: &WorkItem,
    override_diff: Option<f64>,
) -> error::Result<[u8; 58]> {
    if job_id < 1 || job_id > 4 {
        return Err(ErrorKind::Protocol(format!("invalid job_id {}", job_id)).into());
    }
    let mut frame = [0u8; 58];
    frame[0] = (job_id << 4) | op::WRITE_JOB;
    frame[1] = chip_id;
    frame[2..34].copy_from_slice(&swab256(&work.midstate));

    for i in 0..3 {
        let word = u32::from_le_bytes([
            work.data_tail[i * 4],
            work.data_tail[i * 4 + 1],
            work.data_tail[i * 4 + 2],
            work.data_tail[i * 4 + 3],
        ]);
        frame[34 + i * 4..38 + i * 4].copy_from_slice(&word.to_be_bytes());
    }

    frame[46..50].copy_from_slice(&0u32.to_be_bytes()); // start nonce
    let nbits = match override_diff {
        Some(diff) => target::get_target(diff),
        None => work.nbits,
    };
    frame[50..54].copy_from_slice(&nbits.to_be_bytes());
    frame[54..58].copy_from_slice(&0xffff_ffffu32.to_be_bytes()); // end nonce

    Ok(frame)
}

/// Send a `WRITE_JOB` frame and validate the 2-byte echo of the tx header.
pub fn cmd_write_job(
    spi: &mut dyn SpiTransport,
    job_id: u8,
    chip_id: u8,
    work: &WorkItem,
    override_diff: Option<f64>,
    num_chips: Option<usize>,
) -> error::Result<()> {
    let frame = build_write_job_frame(job_id, chip_id, work, override_diff)?;
    let ret = exec(spi, &frame, chip_id, 2, num_chips)?;
    if ret[0] != frame[0] || ret[1] != frame[1] {
        return Err(ErrorKind::Protocol(format!(
            "WRITE_JOB echo mismatch: sent {:#04x} {:#04x}, got {:#04x} {:#04x}",
            frame[0], frame[1], ret[0], ret[1]
        ))
        .into());
    }
    Ok(())
}

/// `READ_RESULT_BCAST`: writes an 8-byte prelude, reads `8 + 4*num_chips`
/// bytes, then scans two bytes at a time for the first word whose low
/// nibble equals `READ_RESULT`. That word plus the five following bytes form
/// the result record.
pub fn cmd_read_result_bcast(
    spi: &mut dyn SpiTransport,
    num_chips: usize,
) -> error::Result<Option<ResultRecord>> {
    let tx = [0u8; 8];
    let mut tx_scratch = [0u8; 8];
    spi.transfer(Some(&tx), &mut tx_scratch)
        .map_err(|_| ErrorKind::Spi("READ_RESULT_BCAST prelude failed".to_string()))?;

    let rx_len = 8 + 4 * num_chips;
    let mut rx = vec![0u8; rx_len];
    spi.transfer(None, &mut rx)
        .map_err(|_| ErrorKind::Spi("READ_RESULT_BCAST poll failed".to_string()))?;

    let mut i = 0;
    while i + 1 < rx.len() {
        if (rx[i] & 0x0f) == op::READ_RESULT {
            if i + 6 > rx.len() {
                break;
            }
            let job_id = rx[i] >> 4;
            let chip_id = rx[i + 1];
            let nonce = u32::from_be_bytes([rx[i + 2], rx[i + 3], rx[i + 4], rx[i + 5]]);
            return Ok(Some(ResultRecord {
                job_id,
                chip_id,
                nonce,
            }));
        }
        i += 2;
    }
    Ok(None)
}
