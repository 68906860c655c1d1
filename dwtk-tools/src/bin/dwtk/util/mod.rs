pub mod common_options;
pub mod firmware;
pub mod flash;
pub mod logging;

use std::num::ParseIntError;

/// Parses decimal, `0x` hex, `0o` octal or `0b` binary.
pub fn parse_u8(input: &str) -> Result<u8, ParseIntError> {
    parse_int::parse(input)
}

pub fn parse_u16(input: &str) -> Result<u16, ParseIntError> {
    parse_int::parse(input)
}

pub fn parse_u32(input: &str) -> Result<u32, ParseIntError> {
    parse_int::parse(input)
}
