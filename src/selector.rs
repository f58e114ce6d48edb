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

//! Board selector (C5): arbitrates shared SPI access across chains on
//! multi-board products via an I²C GPIO expander, and reads per-chain
//! temperature sensors over the same bus.

use std::cell::{Cell, RefCell};
use std::sync::{Mutex, MutexGuard};

use crate::error::{self, ErrorKind};
use crate::host::{Clock, I2cTransport};

const RESET_LOW_TIME_MS: u64 = 10;
const RESET_HI_TIME_MS: u64 = 50;

const DESK_EXPANDER_ADDR: u8 = 0x20;
const BLADE_EXPANDER_ADDR: u8 = 0x27;
const TEMP_SENSOR_BASE_ADDR: u8 = 0x48;
const TEMP_OVERRANGE_C: f32 = 100.0;

/// A proof that the selector's mutex is held, required by every API that
/// touches the expander while the SPI bus is routed to a chain.
pub struct SelectorGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl<'a> SelectorGuard<'a> {
    pub(crate) fn new(guard: MutexGuard<'a, ()>) -> Self {
        SelectorGuard { _guard: guard }
    }
}

/// Common capability surface shared by every product's selector.
///
/// Every method but `exit` takes `&self`: the mutex is the sole source of
/// exclusivity (mirroring `std::sync::Mutex::lock`), so a held
/// [`SelectorGuard`] never has to keep borrowing the selector itself. That
/// lets a caller hold the guard across several further calls (`get_temp`,
/// then `release`) without fighting the borrow checker.
pub trait BoardSelector: Send {
    /// Route the shared SPI bus to `chain`. Returns `false` if `chain` is
    /// out of range for this product. Acquires and holds the selector mutex;
    /// the returned guard must be passed to every subsequent call.
    fn select(&self, chain: usize) -> error::Result<Option<SelectorGuard<'_>>>;

    /// Release the mutex. Does not change expander state.
    fn release(&self, guard: SelectorGuard<'_>);

    /// Assert `chain`'s reset line low then high, holding each state for its
    /// mandated pulse width. Requires the mutex held.
    fn reset(&self, guard: &SelectorGuard<'_>, clock: &dyn Clock, chain: usize) -> error::Result<()>;

    /// Broadcast reset; acquires and releases the mutex itself.
    fn reset_all(&self, clock: &dyn Clock) -> error::Result<()>;

    /// Read the per-chain temperature sensor, sanitising overrange values.
    fn get_temp(&self, guard: &SelectorGuard<'_>, chain: usize) -> error::Result<f32>;

    /// Release the expander.
    fn exit(&mut self);

    fn max_chains(&self) -> usize;
}

fn sanitize_temp(raw: u8) -> f32 {
    let value = raw as f32;
    if value > TEMP_OVERRANGE_C {
        let cleared = raw & !0x80;
        let retried = cleared as f32;
        if retried > TEMP_OVERRANGE_C {
            0.0
        } else {
            retried
        }
    } else {
        value
    }
}

/// Single-chain products: no expander, no-op selector.
pub struct DummySelector {
    mutex: Mutex<()>,
}

impl DummySelector {
    pub fn new() -> Self {
        DummySelector { mutex: Mutex::new(()) }
    }
}

impl BoardSelector for DummySelector {
    fn select(&self, chain: usize) -> error::Result<Option<SelectorGuard<'_>>> {
        if chain >= self.max_chains() {
            return Ok(None);
        }
        let guard = self.mutex.lock().expect("selector mutex poisoned");
        Ok(Some(SelectorGuard::new(guard)))
    }

    fn release(&self, _guard: SelectorGuard<'_>) {}

    fn reset(&self, _guard: &SelectorGuard<'_>, _clock: &dyn Clock, _chain: usize) -> error::Result<()> {
        Ok(())
    }

    fn reset_all(&self, _clock: &dyn Clock) -> error::Result<()> {
        Ok(())
    }

    fn get_temp(&self, _guard: &SelectorGuard<'_>, _chain: usize) -> error::Result<f32> {
        Ok(0.0)
    }

    fn exit(&mut self) {}

    fn max_chains(&self) -> usize {
        1
    }
}

/// Desk: PCA9555-class expander at a fixed address driving a 1-of-5 chain
/// select, with per-board MCP4x trimpots for voltage control.
pub struct DeskSelector {
    i2c: RefCell<Box<dyn I2cTransport>>,
    mutex: Mutex<()>,
    active_chain: Cell<Option<usize>>,
}

impl DeskSelector {
    const MAX_CHAINS: usize = 5;

    pub fn new(mut i2c: Box<dyn I2cTransport>) -> error::Result<Self> {
        i2c.slave_open(DESK_EXPANDER_ADDR)
            .map_err(|_| ErrorKind::Selector("Desk expander not present".to_string()))?;
        Ok(DeskSelector {
            i2c: RefCell::new(i2c),
            mutex: Mutex::new(()),
            active_chain: Cell::new(None),
        })
    }
}

impl BoardSelector for DeskSelector {
    fn select(&self, chain: usize) -> error::Result<Option<SelectorGuard<'_>>> {
        if chain >= Self::MAX_CHAINS {
            return Ok(None);
        }
        let guard = self.mutex.lock().expect("selector mutex poisoned");
        if self.active_chain.get() != Some(chain) {
            self.i2c.borrow_mut().write(0x02, 1u8 << chain)?;
            self.active_chain.set(Some(chain));
        }
        Ok(Some(SelectorGuard::new(guard)))
    }

    fn release(&self, _guard: SelectorGuard<'_>) {}

    fn reset(&self, _guard: &SelectorGuard<'_>, clock: &dyn Clock, chain: usize) -> error::Result<()> {
        self.i2c.borrow_mut().write(0x03, !(1u8 << chain))?;
        clock.sleep_ms(RESET_LOW_TIME_MS);
        self.i2c.borrow_mut().write(0x03, 0xff)?;
        clock.sleep_ms(RESET_HI_TIME_MS);
        Ok(())
    }

    fn reset_all(&self, clock: &dyn Clock) -> error::Result<()> {
        let _guard = self.mutex.lock().expect("selector mutex poisoned");
        self.i2c.borrow_mut().write(0x03, 0x00)?;
        clock.sleep_ms(RESET_LOW_TIME_MS);
        self.i2c.borrow_mut().write(0x03, 0xff)?;
        clock.sleep_ms(RESET_HI_TIME_MS);
        Ok(())
    }

    fn get_temp(&self, _guard: &SelectorGuard<'_>, chain: usize) -> error::Result<f32> {
        let mut i2c = self.i2c.borrow_mut();
        i2c.slave_open(TEMP_SENSOR_BASE_ADDR + chain as u8)?;
        let raw = i2c.read(0x00)?;
        Ok(sanitize_temp(raw))
    }

    fn exit(&mut self) {}

    fn max_chains(&self) -> usize {
        Self::MAX_CHAINS
    }
}

/// Blade: TCA9535 at 0x27 selecting one of 8 chains, packed two per board;
/// odd chains route to `spi1`. Temperature sensors are shared per board pair.
pub struct BladeSelector {
    i2c: RefCell<Box<dyn I2cTransport>>,
    mutex: Mutex<()>,
    active_board: Cell<Option<usize>>,
    temp_cache: RefCell<[Option<f32>; Self::MAX_CHAINS / 2]>,
}

impl BladeSelector {
    const MAX_CHAINS: usize = 8;

    pub fn new(mut i2c: Box<dyn I2cTransport>) -> error::Result<Self> {
        i2c.slave_open(BLADE_EXPANDER_ADDR)
            .map_err(|_| ErrorKind::Selector("Blade expander not present".to_string()))?;
        Ok(BladeSelector {
            i2c: RefCell::new(i2c),
            mutex: Mutex::new(()),
            active_board: Cell::new(None),
            temp_cache: RefCell::new(Default::default()),
        })
    }

    /// The expander line for board `board` is driven by bit `0x80 >> board`.
    fn board_select_mask(board: usize) -> u8 {
        0x80u8 >> board
    }
}

impl BoardSelector for BladeSelector {
    fn select(&self, chain: usize) -> error::Result<Option<SelectorGuard<'_>>> {
        if chain >= Self::MAX_CHAINS {
            return Ok(None);
        }
        let board = chain / 2;
        let guard = self.mutex.lock().expect("selector mutex poisoned");
        if self.active_board.get() != Some(board) {
            let mask = Self::board_select_mask(board);
            self.i2c.borrow_mut().write(0x03, 0xff)?;
            self.i2c.borrow_mut().write(0x03, !mask)?;
            self.active_board.set(Some(board));
        }
        Ok(Some(SelectorGuard::new(guard)))
    }

    fn release(&self, _guard: SelectorGuard<'_>) {}

    fn reset(&self, _guard: &SelectorGuard<'_>, clock: &dyn Clock, chain: usize) -> error::Result<()> {
        let board = chain / 2;
        let mask = Self::board_select_mask(board);
        self.i2c.borrow_mut().write(0x03, !mask)?;
        clock.sleep_ms(RESET_LOW_TIME_MS);
        self.i2c.borrow_mut().write(0x03, 0xff)?;
        clock.sleep_ms(RESET_HI_TIME_MS);
        Ok(())
    }

    fn reset_all(&self, clock: &dyn Clock) -> error::Result<()> {
        let _guard = self.mutex.lock().expect("selector mutex poisoned");
        self.i2c.borrow_mut().write(0x03, 0x00)?;
        clock.sleep_ms(RESET_LOW_TIME_MS);
        self.i2c.borrow_mut().write(0x03, 0xff)?;
        clock.sleep_ms(RESET_HI_TIME_MS);
        Ok(())
    }

    fn get_temp(&self, _guard: &SelectorGuard<'_>, chain: usize) -> error::Result<f32> {
        let board = chain / 2;
        if let Some(cached) = self.temp_cache.borrow()[board] {
            return Ok(cached);
        }
        let mut i2c = self.i2c.borrow_mut();
        i2c.slave_open(TEMP_SENSOR_BASE_ADDR + board as u8)?;
        let raw = i2c.read(0x00)?;
        let temp = sanitize_temp(raw);
        self.temp_cache.borrow_mut()[board] = Some(temp);
        Ok(temp)
    }

    fn exit(&mut self) {}

    fn max_chains(&self) -> usize {
        Self::MAX_CHAINS
    }
}
