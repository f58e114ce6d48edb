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

//! PLL divider search for the A1 chip: `sys = ref * fb_div / (pre_div * 2^(post_div-1))`.

/// Six raw bytes written to the chip's PLL configuration register.
pub type PllBytes = [u8; 6];

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Search PLL dividers that approximate `sys_khz` from `ref_khz` and encode the
/// six configuration bytes the chip expects.
///
/// This mirrors the divider-search style of the chip's PLL register (compare
/// `bm1387::PllReg::find_divider`) but follows the distinct fb/pre/post divider
/// scheme and approximation fallback this chip generation actually uses.
pub fn get_pll_reg(ref_khz: u32, sys_khz: u32) -> PllBytes {
    let g = gcd(ref_khz, sys_khz);
    let mut fb_div = sys_khz / g;
    let mut n = ref_khz / g;

    if fb_div > 511 {
        let ratio = fb_div / n;
        let m: u32 = if ratio < 32 {
            16
        } else if ratio < 64 {
            8
        } else if ratio < 128 {
            4
        } else {
            1
        };
        fb_div = m * fb_div / n;
        n = m;
    }

    let post_div: u32 = if n % 4 == 0 {
        3
    } else if n % 2 == 0 {
        2
    } else {
        1
    };

    let mut pre_div = n / (1 << (post_div - 1));
    if pre_div > 31 {
        fb_div = 31 * fb_div / pre_div;
        pre_div = 31;
    }

    let mut reg = [0u8; 6];
    reg[0] = ((post_div as u8) << 6) | ((pre_div as u8) << 1) | ((fb_div >> 8) as u8);
    reg[1] = (fb_div & 0xff) as u8;
    reg[2] = 0x21;
    reg[3] = 0x84;
    reg[4] = 0x00;
    reg[5] = 0x00;
    reg
}

/// Recompute the frequency a set of dividers produces, for round-trip bound checks.
pub fn pll_to_sys_khz(ref_khz: u32, reg: &PllBytes) -> u32 {
    let post_div = (reg[0] >> 6) as u32;
    let pre_div = ((reg[0] >> 1) & 0x1f) as u32;
    let fb_div = (((reg[0] & 1) as u32) << 8) | reg[1] as u32;
    ref_khz * fb_div / (pre_div * (1 << (post_div.saturating_sub(1))))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_frequency() {
        // 16 MHz reference, 800 MHz system clock: fb_div=50, pre_div=1, post_div=1
        let reg = get_pll_reg(16_000, 800_000);
        assert_eq!(reg[1], 0x32); // fb_div & 0xff == 50
        assert_eq!(reg[0], (1 << 6) | (1 << 1) | 0); // post_div=1, pre_div=1, fb_div>>8=0
        assert_eq!(&reg[2..], &[0x21, 0x84, 0x00, 0x00]);
    }

    #[test]
    fn round_trip_within_bound_when_exact() {
        for sys_khz in &[400_000u32, 600_000, 800_000, 1_000_000] {
            let reg = get_pll_reg(16_000, *sys_khz);
            let back = pll_to_sys_khz(16_000, &reg);
            // sys / gcd(ref, sys) <= 511 for these inputs, so the search is exact
            assert_eq!(back, *sys_khz, "sys_khz={}", sys_khz);
        }
    }

    #[test]
    fn huge_ratio_triggers_approximation() {
        // gcd(5000, 601000) = 1000 -> fb_div=601 (>511), n=5, ratio=120 -> m=4 branch
        let reg = get_pll_reg(5_000, 601_000);
        let fb_div = (((reg[0] & 1) as u32) << 8) | reg[1] as u32;
        assert!(fb_div <= 511, "approximation should bring fb_div back in range: {}", fb_div);
        let back = pll_to_sys_khz(5_000, &reg);
        let diff = (back as i64 - 601_000i64).abs();
        assert!(diff < 601_000 / 8, "approximated clock too far off: {}", back);
    }

    #[test]
    fn pre_div_clamped_to_31() {
        // n = ref/gcd = 33 (odd, >31) forces the pre_div>31 clamp branch
        let reg = get_pll_reg(528_000, 80_000);
        let pre_div = (reg[0] >> 1) & 0x1f;
        assert_eq!(pre_div, 31);
    }
}
