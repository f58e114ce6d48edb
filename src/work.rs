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

//! Work item as seen by the core: opaque except for what goes on the wire.

/// One unit of mining work dispatched to a chip's job slot.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// 32-byte SHA-256 midstate.
    pub midstate: [u8; 32],
    /// 12-byte tail: merkle root tail / ntime / nbits, each a little-endian
    /// 32-bit word as handed down by the host.
    pub data_tail: [u8; 12],
    /// First nonce of this item's assigned range.
    pub start_nonce: u32,
    /// Target difficulty expressed as compact "nbits".
    pub nbits: u32,
    /// Per-work difficulty, used to credit/penalise `nonce_ranges_processed`.
    pub device_diff: f64,
}

impl WorkItem {
    pub fn new(midstate: [u8; 32], data_tail: [u8; 12], nbits: u32, device_diff: f64) -> Self {
        Self {
            midstate,
            data_tail,
            start_nonce: 0,
            nbits,
            device_diff,
        }
    }
}
