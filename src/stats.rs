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

//! Optional append-only stats log: one line per autotuner clock change.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{self, ErrorKind};

pub struct StatsLog {
    writer: Option<BufWriter<std::fs::File>>,
}

impl StatsLog {
    /// With `path == None`, every record is a no-op (stats logging disabled).
    pub fn open(path: Option<&Path>) -> error::Result<Self> {
        let writer = match path {
            Some(p) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .map_err(|e| ErrorKind::Config(format!("opening stats log {:?}: {}", p, e)))?;
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(StatsLog { writer })
    }

    /// Append one line: `[timestamp] [+++|---] chain/chip: ratio sys_clk (prev_clk)`.
    pub fn record_clock_change(
        &mut self,
        timestamp_ms: u64,
        raised: bool,
        chain_id: u8,
        chip_id: u8,
        ratio_pm: i64,
        sys_clk_khz: u32,
        prev_clk_khz: u32,
    ) -> error::Result<()> {
        let writer = match &mut self.writer {
            Some(w) => w,
            None => return Ok(()),
        };
        let sign = if raised { "+++" } else { "---" };
        writeln!(
            writer,
            "[{}] [{}] {}/{}: {}‰ {} ({})",
            timestamp_ms, sign, chain_id, chip_id, ratio_pm, sys_clk_khz, prev_clk_khz
        )
        .map_err(|e| ErrorKind::Config(format!("writing stats log: {}", e)))?;
        writer
            .flush()
            .map_err(|e| ErrorKind::Config(format!("flushing stats log: {}", e)))?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.writer = None;
    }
}
