//! Register access and the register cache.

use std::ops::{Deref, DerefMut};

use crate::avr::{self, NUM_REGISTERS};
use crate::{DebugWire, DebugWireError};

impl DebugWire {
    fn check_registers(start: u8, len: usize) -> Result<(), DebugWireError> {
        if usize::from(start) + len > usize::from(NUM_REGISTERS) {
            return Err(DebugWireError::RegisterRange { start, len });
        }
        Ok(())
    }

    /// Writes general purpose registers, starting at `start`.
    pub fn write_registers(&mut self, start: u8, registers: &[u8]) -> Result<(), DebugWireError> {
        Self::check_registers(start, registers.len())?;
        Ok(self.adapter.write_registers(start, registers)?)
    }

    /// Reads general purpose registers, starting at `start`.
    pub fn read_registers(&mut self, start: u8, registers: &mut [u8]) -> Result<(), DebugWireError> {
        Self::check_registers(start, registers.len())?;
        Ok(self.adapter.read_registers(start, registers)?)
    }

    /// Writes data space memory. This clobbers Z.
    pub fn write_sram(&mut self, address: u16, data: &[u8]) -> Result<(), DebugWireError> {
        Ok(self.adapter.write_sram(address, data)?)
    }

    /// Reads data space memory. This clobbers Z.
    pub fn read_sram(&mut self, address: u16, data: &mut [u8]) -> Result<(), DebugWireError> {
        Ok(self.adapter.read_sram(address, data)?)
    }

    /// Reads the status register.
    pub fn sreg(&mut self) -> Result<u8, DebugWireError> {
        let mut sreg = [0];
        self.read_sram(avr::SREG, &mut sreg)?;
        Ok(sreg[0])
    }

    /// Writes the status register.
    pub fn set_sreg(&mut self, sreg: u8) -> Result<(), DebugWireError> {
        self.write_sram(avr::SREG, &[sreg])
    }

    /// Reads the stack pointer.
    pub fn sp(&mut self) -> Result<u16, DebugWireError> {
        let mut sp = [0; 2];
        self.read_sram(avr::SPL, &mut sp)?;
        Ok(u16::from_le_bytes(sp))
    }

    /// Writes the stack pointer.
    pub fn set_sp(&mut self, sp: u16) -> Result<(), DebugWireError> {
        self.write_sram(avr::SPL, &sp.to_le_bytes())
    }

    /// Saves PC and the given registers, to be restored when the returned guard goes away.
    pub fn cache(&mut self, registers: &[u8]) -> Result<RegisterCache<'_>, DebugWireError> {
        let ranges = register_ranges(registers);
        RegisterCache::capture(self, ranges, false)
    }

    /// Saves every register GDB knows about: R0-R31, SREG, SP and PC.
    pub fn cache_all(&mut self) -> Result<RegisterCache<'_>, DebugWireError> {
        RegisterCache::capture(self, vec![(0, NUM_REGISTERS)], true)
    }
}

/// Merges register indices into `(start, len)` runs of adjacent registers.
fn register_ranges(registers: &[u8]) -> Vec<(u8, u8)> {
    let mut sorted = registers.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<(u8, u8)> = Vec::new();
    for register in sorted {
        match ranges.last_mut() {
            Some((start, len)) if *start + *len == register => *len += 1,
            _ => ranges.push((register, 1)),
        }
    }
    ranges
}

/// Saved target registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSnapshot {
    /// Program counter as a byte address.
    pub pc: u16,
    /// Saved `(start, values)` runs of general purpose registers.
    pub ranges: Vec<(u8, Vec<u8>)>,
    /// Status register, in full snapshots.
    pub sreg: Option<u8>,
    /// Stack pointer, in full snapshots.
    pub sp: Option<u16>,
}

impl RegisterSnapshot {
    /// The saved value of general purpose register `index`, if it is part of the snapshot.
    pub fn register(&self, index: u8) -> Option<u8> {
        self.ranges.iter().find_map(|(start, values)| {
            let offset = usize::from(index.checked_sub(*start)?);
            values.get(offset).copied()
        })
    }

    /// Mutable access to a saved general purpose register.
    pub fn register_mut(&mut self, index: u8) -> Option<&mut u8> {
        self.ranges.iter_mut().find_map(|(start, values)| {
            let offset = usize::from(index.checked_sub(*start)?);
            values.get_mut(offset)
        })
    }
}

/// Guard that restores registers on release.
///
/// Any code that injects instructions or goes through Z clobbers registers the user
/// program owns. Wrapping it in a cache scope puts them back afterwards. The session is
/// reachable through the guard while it is alive.
///
/// Restore order matters: SREG and SP go through SRAM writes, which clobber Z, so they
/// come first. PC comes last, because writing it also clears the post-break correction.
///
/// Dropping the guard restores too, but can only log a failure. Call
/// [`RegisterCache::release`] to see it.
#[derive(Debug)]
pub struct RegisterCache<'a> {
    dw: &'a mut DebugWire,
    snapshot: Option<RegisterSnapshot>,
}

impl<'a> RegisterCache<'a> {
    fn capture(
        dw: &'a mut DebugWire,
        ranges: Vec<(u8, u8)>,
        special: bool,
    ) -> Result<Self, DebugWireError> {
        let pc = dw.pc()?;

        let mut saved = Vec::with_capacity(ranges.len());
        for (start, len) in ranges {
            let mut values = vec![0; usize::from(len)];
            dw.read_registers(start, &mut values)?;
            saved.push((start, values));
        }

        let (sreg, sp) = if special {
            (Some(dw.sreg()?), Some(dw.sp()?))
        } else {
            (None, None)
        };

        let snapshot = RegisterSnapshot {
            pc,
            ranges: saved,
            sreg,
            sp,
        };
        tracing::trace!("Cached registers: {:x?}", snapshot);

        Ok(Self {
            dw,
            snapshot: Some(snapshot),
        })
    }

    /// The saved values. They get written back on release.
    pub fn snapshot(&self) -> Option<&RegisterSnapshot> {
        self.snapshot.as_ref()
    }

    /// Changes to the saved values reach the target on release.
    pub fn snapshot_mut(&mut self) -> Option<&mut RegisterSnapshot> {
        self.snapshot.as_mut()
    }

    /// Restores the saved registers now and reports a failure.
    pub fn release(mut self) -> Result<(), DebugWireError> {
        self.restore()
    }

    fn restore(&mut self) -> Result<(), DebugWireError> {
        let Some(snapshot) = self.snapshot.take() else {
            return Ok(());
        };

        if let Some(sreg) = snapshot.sreg {
            self.dw.set_sreg(sreg)?;
        }
        if let Some(sp) = snapshot.sp {
            self.dw.set_sp(sp)?;
        }
        for (start, values) in &snapshot.ranges {
            self.dw.write_registers(*start, values)?;
        }
        self.dw.set_pc(snapshot.pc)
    }
}

impl Deref for RegisterCache<'_> {
    type Target = DebugWire;

    fn deref(&self) -> &Self::Target {
        &*self.dw
    }
}

impl DerefMut for RegisterCache<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.dw
    }
}

impl Drop for RegisterCache<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::error!("Failed to restore cached registers: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::{FakeAdapter, FakeHandle, FakeOp};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn session() -> (DebugWire, FakeHandle) {
        let mcu = dwtk_target::Registry::from_builtin_families()
            .unwrap()
            .get_by_name("ATmega328P")
            .unwrap()
            .clone();
        let adapter = FakeAdapter::new(mcu.clone());
        let target = adapter.target();
        (DebugWire::new(Box::new(adapter), mcu), target)
    }

    #[test_case(&[0, 1, 29, 30, 31], &[(0, 2), (29, 3)]; "two runs")]
    #[test_case(&[31, 30, 29], &[(29, 3)]; "unordered")]
    #[test_case(&[5, 5, 6], &[(5, 2)]; "duplicates")]
    #[test_case(&[], &[]; "empty")]
    fn ranges(registers: &[u8], expected: &[(u8, u8)]) {
        assert_eq!(register_ranges(registers), expected);
    }

    #[test]
    fn register_range_is_checked() {
        let (mut dw, _) = session();
        let mut regs = [0; 3];
        assert!(matches!(
            dw.read_registers(30, &mut regs),
            Err(DebugWireError::RegisterRange { start: 30, len: 3 })
        ));
    }

    #[test]
    fn sp_is_little_endian() {
        let (mut dw, target) = session();
        dw.set_sp(0x08ff).unwrap();
        assert_eq!(target.lock().data[0x5d..0x5f], [0xff, 0x08]);
        assert_eq!(dw.sp().unwrap(), 0x08ff);
    }

    #[test]
    fn cache_restores_clobbered_registers() {
        let (mut dw, target) = session();
        dw.set_sreg(0x80).unwrap();
        dw.write_registers(28, &[1, 2, 3, 4]).unwrap();
        dw.set_pc(0x100).unwrap();

        {
            let mut cache = dw.cache_all().unwrap();
            cache.write_registers(28, &[0xff; 4]).unwrap();
            cache.write_instruction(avr::adiw(30, 1)).unwrap();
            cache.set_pc(0).unwrap();
        }

        let target = target.lock();
        assert_eq!(target.data[28..32], [1, 2, 3, 4]);
        assert_eq!(target.sreg(), 0x80);
        assert_eq!(target.pc, 0x80);
    }

    #[test]
    fn snapshot_edits_are_written_back() {
        let (mut dw, target) = session();
        dw.set_pc(0).unwrap();

        let mut cache = dw.cache_all().unwrap();
        let snapshot = cache.snapshot_mut().unwrap();
        *snapshot.register_mut(7).unwrap() = 0x77;
        snapshot.sreg = Some(0x02);
        snapshot.pc = 0x200;
        cache.release().unwrap();

        let target = target.lock();
        assert_eq!(target.register(7), 0x77);
        assert_eq!(target.sreg(), 0x02);
        assert_eq!(target.pc, 0x100);
    }

    #[test]
    fn partial_cache_keeps_pc() {
        let (mut dw, target) = session();
        dw.set_pc(0x44).unwrap();

        let cache = dw.cache(&[0, 1]).unwrap();
        assert_eq!(cache.snapshot().unwrap().register(1), Some(0));
        assert_eq!(cache.snapshot().unwrap().register(2), None);
        assert_eq!(cache.snapshot().unwrap().sreg, None);
        drop(cache);

        assert_eq!(target.lock().pc, 0x22);
    }

    #[test]
    fn release_reports_restore_failure() {
        let (mut dw, target) = session();
        let cache = dw.cache(&[0]).unwrap();
        target.lock().fail_next(FakeOp::WritePc);

        assert!(cache.release().is_err());
    }
}
