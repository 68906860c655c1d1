//! Parsing and execution of the RSP commands AVR GDB needs.

use dwtk::avr::NUM_REGISTERS;
use dwtk::{DebugWire, DebugWireError, RegisterCache, RegisterSnapshot};

/// GDB addresses data space with this offset.
const SRAM_OFFSET: u32 = 0x80_0000;
/// GDB addresses EEPROM with this offset.
const EEPROM_OFFSET: u32 = 0x81_0000;
/// Each space is addressed with 16 bits.
const SPACE_SIZE: u64 = 0x1_0000;

/// R0-R31, SREG, SP and a 32 bit PC.
const REGISTERS_LEN: usize = NUM_REGISTERS as usize + 1 + 2 + 4;

/// The only breakpoint kind AVR GDB uses: one instruction word.
const BREAKPOINT_KIND: u32 = 2;

#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum CommandError {
    /// Malformed packet {0:?}
    Malformed(String),

    /// Invalid hex data
    Hex(#[from] hex::FromHexError),

    /// Register {0} does not exist
    UnknownRegister(u32),

    /// {len:#x} byte(s) at {address:#x} do not fit in one address space
    OutOfRange { address: u32, len: u32 },

    /// Expected {expected} byte(s) of data, got {got}
    LengthMismatch { expected: usize, got: usize },

    /// The hardware breakpoint is already in use
    HardwareBreakpointInUse,

    /// EEPROM access is disabled
    EepromAccessDisabled,

    /// The register snapshot is gone
    SnapshotReleased,

    /// The target failed
    DebugWire(#[from] DebugWireError),
}

/// Server settings that change how commands behave.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Whether `m`/`M` may reach EEPROM.
    pub eeprom_access: bool,
}

/// What the server loop has to do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Response {
    /// Send this payload.
    Reply(Vec<u8>),
    /// The target is running. The reply comes once it stops.
    Continue,
    /// Reply `OK` and end the session.
    Detach,
}

impl Response {
    fn reply(payload: impl Into<Vec<u8>>) -> Self {
        Self::Reply(payload.into())
    }

    fn error() -> Self {
        Self::reply("E01")
    }

    fn ok() -> Self {
        Self::reply("OK")
    }
}

/// Registers as GDB numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    General(u8),
    Sreg,
    Sp,
    Pc,
}

impl Register {
    fn from_number(number: u32) -> Result<Self, CommandError> {
        match number {
            0..=31 => Ok(Self::General(number as u8)),
            32 => Ok(Self::Sreg),
            33 => Ok(Self::Sp),
            34 => Ok(Self::Pc),
            _ => Err(CommandError::UnknownRegister(number)),
        }
    }

    fn size(self) -> usize {
        match self {
            Self::General(_) | Self::Sreg => 1,
            Self::Sp => 2,
            Self::Pc => 4,
        }
    }

    fn read(self, snapshot: &RegisterSnapshot) -> Vec<u8> {
        match self {
            Self::General(index) => vec![snapshot.register(index).unwrap_or_default()],
            Self::Sreg => vec![snapshot.sreg.unwrap_or_default()],
            Self::Sp => snapshot.sp.unwrap_or_default().to_le_bytes().to_vec(),
            Self::Pc => u32::from(snapshot.pc).to_le_bytes().to_vec(),
        }
    }

    fn write(self, snapshot: &mut RegisterSnapshot, value: &[u8]) -> Result<(), CommandError> {
        if value.len() != self.size() {
            return Err(CommandError::LengthMismatch {
                expected: self.size(),
                got: value.len(),
            });
        }

        match self {
            Self::General(index) => {
                if let Some(register) = snapshot.register_mut(index) {
                    *register = value[0];
                }
            }
            Self::Sreg => snapshot.sreg = Some(value[0]),
            Self::Sp => snapshot.sp = Some(u16::from_le_bytes([value[0], value[1]])),
            // Flash never exceeds 64 KiB, the upper half is always zero.
            Self::Pc => snapshot.pc = u16::from_le_bytes([value[0], value[1]]),
        }
        Ok(())
    }
}

/// Address spaces behind the flat GDB address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Flash(u16),
    Sram(u16),
    Eeprom(u16),
}

impl Space {
    /// Splits a GDB address. `len` bytes from there must stay inside the space.
    fn from_gdb(address: u32, len: u32) -> Result<Self, CommandError> {
        let (offset, space): (u32, fn(u16) -> Self) = if address < SRAM_OFFSET {
            (address, Self::Flash)
        } else if address < EEPROM_OFFSET {
            (address - SRAM_OFFSET, Self::Sram)
        } else {
            (address - EEPROM_OFFSET, Self::Eeprom)
        };

        let out_of_range = CommandError::OutOfRange { address, len };
        if u64::from(offset) + u64::from(len) > SPACE_SIZE {
            return Err(out_of_range);
        }
        let offset = u16::try_from(offset).map_err(|_| out_of_range)?;
        Ok(space(offset))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakpoint {
    Software(u16),
    Hardware(u16),
}

/// Commands that run inside a full register cache scope.
#[derive(Debug, PartialEq, Eq)]
pub enum Access {
    ReadRegisters,
    WriteRegisters(Vec<u8>),
    ReadRegister(Register),
    WriteRegister(Register, Vec<u8>),
    ReadMemory { space: Space, len: usize },
    WriteMemory { space: Space, data: Vec<u8> },
    InsertBreakpoint(Breakpoint),
    RemoveBreakpoint(Breakpoint),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    QueryAttached,
    HaltReason,
    Step,
    Continue,
    Detach,
    Access(Access),
    Unsupported,
}

fn hex_u32(field: &str) -> Result<u32, CommandError> {
    u32::from_str_radix(field, 16).map_err(|_| CommandError::Malformed(field.to_string()))
}

fn malformed(packet: &str) -> CommandError {
    CommandError::Malformed(packet.to_string())
}

impl Command {
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let packet = std::str::from_utf8(payload)
            .map_err(|_| malformed(&String::from_utf8_lossy(payload)))?;
        let Some(kind) = packet.chars().next() else {
            return Ok(Self::Unsupported);
        };
        let args = &packet[kind.len_utf8()..];

        let command = match kind {
            'q' if args == "Attached" || args.starts_with("Attached:") => Self::QueryAttached,
            '?' => Self::HaltReason,
            's' => Self::Step,
            'c' => Self::Continue,
            'D' => Self::Detach,
            'g' => Self::Access(Access::ReadRegisters),
            'G' => Self::Access(Access::WriteRegisters(hex::decode(args)?)),
            'p' => Self::Access(Access::ReadRegister(Register::from_number(hex_u32(args)?)?)),
            'P' => {
                let (number, value) = args.split_once('=').ok_or_else(|| malformed(packet))?;
                Self::Access(Access::WriteRegister(
                    Register::from_number(hex_u32(number)?)?,
                    hex::decode(value)?,
                ))
            }
            'm' => {
                let (address, len) = args.split_once(',').ok_or_else(|| malformed(packet))?;
                let len = hex_u32(len)?;
                Self::Access(Access::ReadMemory {
                    space: Space::from_gdb(hex_u32(address)?, len)?,
                    len: len as usize,
                })
            }
            'M' => {
                let (header, data) = args.split_once(':').ok_or_else(|| malformed(packet))?;
                let (address, len) = header.split_once(',').ok_or_else(|| malformed(packet))?;
                let len = hex_u32(len)?;
                let space = Space::from_gdb(hex_u32(address)?, len)?;
                let data = hex::decode(data)?;
                if data.len() != len as usize {
                    return Err(CommandError::LengthMismatch {
                        expected: len as usize,
                        got: data.len(),
                    });
                }
                Self::Access(Access::WriteMemory { space, data })
            }
            'Z' | 'z' => match Self::parse_breakpoint(packet, args)? {
                Some(breakpoint) if kind == 'Z' => {
                    Self::Access(Access::InsertBreakpoint(breakpoint))
                }
                Some(breakpoint) => Self::Access(Access::RemoveBreakpoint(breakpoint)),
                None => Self::Unsupported,
            },
            _ => Self::Unsupported,
        };

        Ok(command)
    }

    /// Parses `<type>,<addr>,<kind>`. Watchpoints are not supported and yield `None`.
    fn parse_breakpoint(packet: &str, args: &str) -> Result<Option<Breakpoint>, CommandError> {
        let mut fields = args.split(',');
        let (Some(kind), Some(address), Some(size), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed(packet));
        };

        let address = hex_u32(address)?;
        let address = u16::try_from(address)
            .map_err(|_| CommandError::OutOfRange { address, len: BREAKPOINT_KIND })?;
        let breakpoint = match kind {
            "0" => Breakpoint::Software(address),
            "1" => Breakpoint::Hardware(address),
            _ => return Ok(None),
        };

        if hex_u32(size)? != BREAKPOINT_KIND {
            return Err(malformed(packet));
        }
        Ok(Some(breakpoint))
    }

    fn execute(self, dw: &mut DebugWire, options: &Options) -> Result<Response, CommandError> {
        let response = match self {
            Self::QueryAttached => Response::reply("1"),
            Self::HaltReason => Response::reply("S00"),
            Self::Detach => Response::Detach,
            Self::Unsupported => Response::reply(""),
            Self::Step => match dw.step() {
                Ok(()) => Response::reply("S05"),
                Err(e) => {
                    tracing::warn!("Step failed: {}", e);
                    Response::reply("S00")
                }
            },
            Self::Continue => match dw.resume() {
                Ok(()) => Response::Continue,
                Err(e) => {
                    tracing::warn!("Continue failed: {}", e);
                    Response::reply("S00")
                }
            },
            Self::Access(access) => {
                let mut cache = dw.cache_all()?;
                let result = access.execute(&mut cache, options);
                if let Err(e) = cache.release() {
                    tracing::error!("Failed to restore registers: {}", e);
                }
                result?
            }
        };

        Ok(response)
    }
}

impl Access {
    fn execute(self, cache: &mut RegisterCache<'_>, options: &Options) -> Result<Response, CommandError> {
        match self {
            Self::ReadRegisters => {
                let snapshot = cache.snapshot().ok_or(CommandError::SnapshotReleased)?;
                let mut registers = Vec::with_capacity(REGISTERS_LEN);
                for number in 0..35 {
                    registers.extend(Register::from_number(number)?.read(snapshot));
                }
                Ok(Response::reply(hex::encode(registers)))
            }
            Self::WriteRegisters(values) => {
                if values.len() != REGISTERS_LEN {
                    return Err(CommandError::LengthMismatch {
                        expected: REGISTERS_LEN,
                        got: values.len(),
                    });
                }

                let snapshot = cache.snapshot_mut().ok_or(CommandError::SnapshotReleased)?;
                let mut rest = values.as_slice();
                for number in 0..35 {
                    let register = Register::from_number(number)?;
                    let (value, tail) = rest.split_at(register.size());
                    register.write(snapshot, value)?;
                    rest = tail;
                }
                Ok(Response::ok())
            }
            Self::ReadRegister(register) => {
                let snapshot = cache.snapshot().ok_or(CommandError::SnapshotReleased)?;
                Ok(Response::reply(hex::encode(register.read(snapshot))))
            }
            Self::WriteRegister(register, value) => {
                let snapshot = cache.snapshot_mut().ok_or(CommandError::SnapshotReleased)?;
                register.write(snapshot, &value)?;
                Ok(Response::ok())
            }
            Self::ReadMemory { space, len } => {
                let mut data = vec![0; len];
                match space {
                    Space::Flash(address) => cache.read_flash(address, &mut data)?,
                    Space::Sram(address) => cache.read_sram(address, &mut data)?,
                    Space::Eeprom(address) => {
                        check_eeprom_access(options)?;
                        cache.read_eeprom(address, &mut data)?;
                    }
                }
                Ok(Response::reply(hex::encode(data)))
            }
            Self::WriteMemory { space, data } => {
                match space {
                    Space::Flash(address) => cache.write_flash(address, &data)?,
                    Space::Sram(address) => cache.write_sram(address, &data)?,
                    Space::Eeprom(address) => {
                        check_eeprom_access(options)?;
                        cache.update_eeprom(address, &data)?;
                    }
                }
                Ok(Response::ok())
            }
            Self::InsertBreakpoint(Breakpoint::Software(address)) => {
                cache.set_sw_breakpoint(address)?;
                Ok(Response::ok())
            }
            Self::InsertBreakpoint(Breakpoint::Hardware(address)) => {
                if !cache.set_hw_breakpoint(address) {
                    return Err(CommandError::HardwareBreakpointInUse);
                }
                Ok(Response::ok())
            }
            Self::RemoveBreakpoint(Breakpoint::Software(address)) => {
                cache.clear_sw_breakpoint(address)?;
                Ok(Response::ok())
            }
            Self::RemoveBreakpoint(Breakpoint::Hardware(_)) => {
                cache.clear_hw_breakpoint();
                Ok(Response::ok())
            }
        }
    }
}

fn check_eeprom_access(options: &Options) -> Result<(), CommandError> {
    if options.eeprom_access {
        Ok(())
    } else {
        Err(CommandError::EepromAccessDisabled)
    }
}

/// Runs one packet against the target. Every failure becomes an `E01` reply.
pub fn dispatch(dw: &mut DebugWire, options: &Options, payload: &[u8]) -> Response {
    let command = match Command::parse(payload) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!("Rejecting packet: {}", e);
            return Response::error();
        }
    };
    tracing::debug!("GDB command: {:?}", command);

    command.execute(dw, options).unwrap_or_else(|e| {
        tracing::warn!("Command failed: {}", e);
        Response::error()
    })
}
