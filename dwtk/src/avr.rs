//! AVR instruction encoders and register bits used to drive the target.
//!
//! debugWIRE has no native commands for I/O space, flash programming or fuse
//! access, so these are done by injecting single instructions for execution.

/// `SPMCSR` bits.
pub mod spmcsr {
    /// Self programming enable. Called `SPMEN` on some devices.
    pub const SELFPRGEN: u8 = 1 << 0;
    /// Page erase.
    pub const PGERS: u8 = 1 << 1;
    /// Page write.
    pub const PGWRT: u8 = 1 << 2;
    /// Read fuse and lock bits.
    pub const RFLB: u8 = 1 << 3;
    /// Clear temporary page buffer.
    pub const CTPB: u8 = 1 << 4;
}

/// `EECR` bits.
pub mod eecr {
    /// EEPROM read enable.
    pub const EERE: u8 = 1 << 0;
    /// EEPROM program enable.
    pub const EEPE: u8 = 1 << 1;
    /// EEPROM master program enable.
    pub const EEMPE: u8 = 1 << 2;
}

/// Data space address of `SPL`. `SPH` follows it.
pub const SPL: u16 = 0x5d;
/// Data space address of `SREG`.
pub const SREG: u16 = 0x5f;

/// Number of general purpose registers.
pub const NUM_REGISTERS: u8 = 32;

/// The `BREAK` opcode.
pub const BREAK: u16 = 0b1001_0101_1001_1000;
/// The `SPM` opcode.
pub const SPM: u16 = 0b1001_0101_1110_1000;

/// `IN Rd, A`: 1011 0AAd dddd AAAA
pub const fn in_(addr: u8, reg: u8) -> u16 {
    0b1011_0000_0000_0000 | io_operands(addr, reg)
}

/// `OUT A, Rr`: 1011 1AAr rrrr AAAA
pub const fn out(addr: u8, reg: u8) -> u16 {
    0b1011_1000_0000_0000 | io_operands(addr, reg)
}

const fn io_operands(addr: u8, reg: u8) -> u16 {
    let addr = addr as u16;
    ((addr & 0x30) << 5) | (addr & 0x0f) | (((reg & 0x1f) as u16) << 4)
}

/// `ADIW Rd+1:Rd, K`: 1001 0110 KKdd KKKK, for `Rd` in {24, 26, 28, 30}.
pub const fn adiw(reg: u8, value: u8) -> u16 {
    let value = value as u16;
    let pair = ((reg.wrapping_sub(24) >> 1) & 0b11) as u16;
    0b1001_0110_0000_0000 | ((value & 0x30) << 2) | (value & 0x0f) | (pair << 4)
}

/// `LPM Rd, Z` or `LPM Rd, Z+`: 1001 000d dddd 010i
pub const fn lpm(reg: u8, post_increment: bool) -> u16 {
    0b1001_0000_0000_0100 | (post_increment as u16) | (((reg & 0x1f) as u16) << 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(out(0x37, 29), 0xbfd7; "out spmcsr r29")]
    #[test_case(out(0x1e, 30), 0xbbee; "out eearl r30")]
    #[test_case(out(0x1f, 28), 0xbbcf; "out eecr r28")]
    #[test_case(in_(0x1d, 0), 0xb20d; "in r0 eedr")]
    #[test_case(adiw(30, 2), 0x9632; "adiw z 2")]
    #[test_case(adiw(30, 1), 0x9631; "adiw z 1")]
    #[test_case(adiw(24, 63), 0x96cf; "adiw r24 63")]
    #[test_case(lpm(28, true), 0x91c5; "lpm r28 z+")]
    #[test_case(lpm(0, false), 0x9004; "lpm r0 z")]
    fn encodings(got: u16, expected: u16) {
        assert_eq!(got, expected, "{got:#06x} != {expected:#06x}");
    }

    #[test]
    fn fixed_opcodes() {
        assert_eq!(BREAK, 0x9598);
        assert_eq!(SPM, 0x95e8);
    }
}
