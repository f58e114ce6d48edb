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

//! Runtime configuration: built-in defaults, the `--bitmine-a1-options`
//! CLI option string grammar, and an optional TOML config file layered on
//! top of both.

use serde::Deserialize;

use crate::error::{self, ErrorKind};

/// Per-board arrays in the CLI option string are indexed 0..MAX_BOARDS.
pub const MAX_BOARDS: usize = 16;

/// Effective runtime configuration for one driver instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub ref_clk_khz: u32,
    pub sys_clk_khz: u32,
    pub spi_clk_hz: u32,
    pub lower_clk_khz: u32,
    pub upper_clk_khz: u32,
    pub lower_ratio_pm: i64,
    pub upper_ratio_pm: i64,
    pub autotune_enabled: bool,
    pub stats_log_path: Option<std::path::PathBuf>,
    /// Cap the number of chips registered per chain below what's physically
    /// detected, for testing with a partial chain.
    pub chip_num: Option<u32>,
    /// MCP4x trimpot wiper value applied to every board's voltage regulator.
    pub wiper: Option<u32>,
    /// Fixed per-chip difficulty target, overriding each work item's own `nbits`.
    pub override_diff: Option<u32>,
    /// Bit `i` set bypasses chip `i+1` on every chain.
    pub board_mask: u64,
    pub per_board_clk_khz: Vec<u64>,
    pub per_board_wiper: Vec<u64>,
    pub per_board_chip_mask: Vec<u64>,
    pub per_board_spi_clk_hz: Vec<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ref_clk_khz: 16_000,
            sys_clk_khz: 800_000,
            spi_clk_hz: 2_000_000,
            lower_clk_khz: 400_000,
            upper_clk_khz: 1_100_000,
            lower_ratio_pm: 3,
            upper_ratio_pm: 20,
            autotune_enabled: true,
            stats_log_path: None,
            chip_num: None,
            wiper: None,
            override_diff: None,
            board_mask: 0,
            per_board_clk_khz: Vec::new(),
            per_board_wiper: Vec::new(),
            per_board_chip_mask: Vec::new(),
            per_board_spi_clk_hz: Vec::new(),
        }
    }
}

impl Config {
    pub fn apply_cli_options(&mut self, opts: &CliOptions) {
        if let Some(v) = opts.ref_clk_khz {
            self.ref_clk_khz = v;
        }
        if let Some(v) = opts.sys_clk_khz {
            self.sys_clk_khz = v;
        }
        if let Some(v) = opts.spi_clk_hz {
            self.spi_clk_hz = v;
        }
        if opts.chip_num.is_some() {
            self.chip_num = opts.chip_num;
        }
        if opts.wiper.is_some() {
            self.wiper = opts.wiper;
        }
        if opts.override_diff.is_some() {
            self.override_diff = opts.override_diff;
        }
        self.board_mask = opts.board_mask;
        self.per_board_clk_khz = opts.per_board_clk_khz.clone();
        self.per_board_wiper = opts.per_board_wiper.clone();
        self.per_board_chip_mask = opts.per_board_chip_mask.clone();
        self.per_board_spi_clk_hz = opts.per_board_spi_clk_hz.clone();
    }

    /// Effective ASIC clock for `board`, honoring a per-board override.
    pub fn board_sys_clk_khz(&self, board: usize) -> u32 {
        CliOptions::board_value(&self.per_board_clk_khz, board)
            .map(|v| v as u32)
            .unwrap_or(self.sys_clk_khz)
    }

    /// Effective SPI bus speed for `board`, honoring a per-board override.
    pub fn board_spi_clk_hz(&self, board: usize) -> u32 {
        CliOptions::board_value(&self.per_board_spi_clk_hz, board)
            .map(|v| v as u32)
            .unwrap_or(self.spi_clk_hz)
    }

    /// Effective chip bypass bitmask for `board`, honoring a per-board override.
    pub fn board_bypass_mask(&self, board: usize) -> u64 {
        CliOptions::board_value(&self.per_board_chip_mask, board).unwrap_or(self.board_mask)
    }

    pub fn apply_file_config(&mut self, file: &FileConfig) {
        if let Some(v) = file.ref_clk_khz {
            self.ref_clk_khz = v;
        }
        if let Some(v) = file.sys_clk_khz {
            self.sys_clk_khz = v;
        }
        if let Some(v) = file.spi_clk_hz {
            self.spi_clk_hz = v;
        }
        if let Some(v) = file.lower_clk_khz {
            self.lower_clk_khz = v;
        }
        if let Some(v) = file.upper_clk_khz {
            self.upper_clk_khz = v;
        }
        if let Some(v) = file.lower_ratio_pm {
            self.lower_ratio_pm = v;
        }
        if let Some(v) = file.upper_ratio_pm {
            self.upper_ratio_pm = v;
        }
        if let Some(v) = file.autotune_enabled {
            self.autotune_enabled = v;
        }
        if let Some(v) = &file.stats_log_path {
            self.stats_log_path = Some(std::path::PathBuf::from(v));
        }
    }

    /// Build a `Config` from the `--bitmine-a1-options` string alone,
    /// layered over the built-in defaults.
    pub fn from_option_string(s: &str) -> error::Result<Config> {
        let mut config = Config::default();
        let opts = parse_cli_options(s)?;
        config.apply_cli_options(&opts);
        Ok(config)
    }
}

/// Optional on-disk config file, layered under CLI options and defaults.
/// Unknown fields are rejected to catch typos early.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub ref_clk_khz: Option<u32>,
    pub sys_clk_khz: Option<u32>,
    pub spi_clk_hz: Option<u32>,
    pub lower_clk_khz: Option<u32>,
    pub upper_clk_khz: Option<u32>,
    pub lower_ratio_pm: Option<i64>,
    pub upper_ratio_pm: Option<i64>,
    pub autotune_enabled: Option<bool>,
    pub stats_log_path: Option<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            ref_clk_khz: None,
            sys_clk_khz: None,
            spi_clk_hz: None,
            lower_clk_khz: None,
            upper_clk_khz: None,
            lower_ratio_pm: None,
            upper_ratio_pm: None,
            autotune_enabled: None,
            stats_log_path: None,
        }
    }
}

pub fn parse_file_config(toml_text: &str) -> error::Result<FileConfig> {
    toml::from_str(toml_text).map_err(|e| ErrorKind::Config(format!("config file: {}", e)).into())
}

/// Parsed `--bitmine-a1-options` value. A zero in any of the six decimal
/// fields means "don't override that default".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOptions {
    pub ref_clk_khz: Option<u32>,
    pub sys_clk_khz: Option<u32>,
    pub spi_clk_hz: Option<u32>,
    pub chip_num: Option<u32>,
    pub wiper: Option<u32>,
    pub override_diff: Option<u32>,
    pub board_mask: u64,
    pub per_board_clk_khz: Vec<u64>,
    pub per_board_wiper: Vec<u64>,
    pub per_board_chip_mask: Vec<u64>,
    pub per_board_spi_clk_hz: Vec<u64>,
}

impl CliOptions {
    /// Look up a per-board override, repeating the last listed entry for
    /// boards beyond what was spelled out. Returns `None` if no array was
    /// given at all.
    pub fn board_value(list: &[u64], board: usize) -> Option<u64> {
        if list.is_empty() {
            return None;
        }
        Some(*list.get(board).unwrap_or_else(|| list.last().unwrap()))
    }
}

fn none_if_zero(v: u32) -> Option<u32> {
    if v == 0 {
        None
    } else {
        Some(v)
    }
}

fn parse_dash_list(s: &str, radix: u32) -> error::Result<Vec<u64>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split('-')
        .map(|tok| {
            u64::from_str_radix(tok, radix)
                .map_err(|_| ErrorKind::Config(format!("invalid array element {:?}", tok)).into())
        })
        .collect()
}

/// Parse the `--bitmine-a1-options` argument:
/// `"ref:sys:spi:chipnum:wiper:override_diff:board_mask clk_tmp wiper_tmp cmask_tmp sclk_tmp"`.
pub fn parse_cli_options(s: &str) -> error::Result<CliOptions> {
    let mut top = s.splitn(2, ' ');
    let head = top.next().unwrap_or("");
    let tail = top.next().unwrap_or("");

    let fields: Vec<&str> = head.split(':').collect();
    if fields.len() != 7 {
        return Err(ErrorKind::Config(format!(
            "expected 7 colon-separated fields, got {}: {:?}",
            fields.len(),
            head
        ))
        .into());
    }

    let parse_dec = |tok: &str| -> error::Result<u32> {
        tok.parse()
            .map_err(|_| ErrorKind::Config(format!("invalid integer {:?}", tok)).into())
    };

    let ref_raw = parse_dec(fields[0])?;
    let sys_raw = parse_dec(fields[1])?;
    let spi_raw = parse_dec(fields[2])?;
    let chipnum_raw = parse_dec(fields[3])?;
    let wiper_raw = parse_dec(fields[4])?;
    let diff_raw = parse_dec(fields[5])?;
    let board_mask_str = fields[6].trim_start_matches("0x");
    let board_mask = u64::from_str_radix(board_mask_str, 16)
        .map_err(|_| ErrorKind::Config(format!("invalid hex board_mask {:?}", fields[6])))?;

    let mut rest = tail.split_whitespace();
    let clk_tmp = parse_dash_list(rest.next().unwrap_or(""), 10)?;
    let wiper_tmp = parse_dash_list(rest.next().unwrap_or(""), 10)?;
    let cmask_tmp = parse_dash_list(rest.next().unwrap_or(""), 16)?;
    let sclk_tmp = parse_dash_list(rest.next().unwrap_or(""), 10)?;

    Ok(CliOptions {
        ref_clk_khz: none_if_zero(ref_raw),
        sys_clk_khz: none_if_zero(sys_raw),
        spi_clk_hz: none_if_zero(spi_raw),
        chip_num: none_if_zero(chipnum_raw),
        wiper: none_if_zero(wiper_raw),
        override_diff: none_if_zero(diff_raw),
        board_mask,
        per_board_clk_khz: clk_tmp,
        per_board_wiper: wiper_tmp,
        per_board_chip_mask: cmask_tmp,
        per_board_spi_clk_hz: sclk_tmp,
    })
}
