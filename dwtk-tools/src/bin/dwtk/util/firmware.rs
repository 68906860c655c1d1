//! Firmware files: Intel HEX and AVR ELF in, flat memory images out.

use std::path::Path;

use ihex::Record;
use object::elf::{FileHeader32, EM_AVR, PT_LOAD};
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;

/// Memory images are addressed with 16 bits.
const MAX_IMAGE_SIZE: usize = 0x1_0000;
/// Flash ends here in the AVR ELF address space. SRAM and EEPROM follow.
const FLASH_SPACE_END: u32 = 0x80_0000;
/// Bytes per data record of written HEX files.
const HEX_RECORD_LEN: usize = 16;

#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum FirmwareFileError {
    /// Failed to read the firmware file
    Io(#[from] std::io::Error),

    /// Invalid Intel HEX
    Hex(#[from] ihex::ReaderError),

    /// Failed to write Intel HEX
    HexWrite(#[from] ihex::WriterError),

    /// Invalid ELF file
    Elf(#[from] object::read::Error),

    /// Failed to read the data of an ELF segment
    SegmentData,

    /// The ELF file is not for AVR (machine {0})
    WrongMachine(u16),

    /// Intel HEX must be ASCII text
    NotText,

    /// Unknown firmware format of {0}, expected Intel HEX or ELF
    UnknownFormat(String),

    /// Image data reaches {end:#x}, past the 64 KiB address space
    TooLarge { end: usize },

    /// No loadable segments in the ELF file
    NoLoadableSegments,
}

/// Loads a firmware file, going by its extension or else by its content.
pub fn load(path: &Path) -> Result<Vec<u8>, FirmwareFileError> {
    let content = std::fs::read(path)?;

    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("hex" | "ihex" | "ihx") => decode_hex(&content),
        Some("elf") => decode_elf(&content),
        _ if content.starts_with(b"\x7fELF") => decode_elf(&content),
        _ if content.trim_ascii_start().starts_with(b":") => decode_hex(&content),
        _ => Err(FirmwareFileError::UnknownFormat(path.display().to_string())),
    }
}

/// Loads an Intel HEX file.
pub fn load_hex(path: &Path) -> Result<Vec<u8>, FirmwareFileError> {
    decode_hex(&std::fs::read(path)?)
}

/// Copies `data` into `image` at `address`, growing it with erased bytes as needed.
fn place(image: &mut Vec<u8>, address: usize, data: &[u8]) -> Result<(), FirmwareFileError> {
    let end = address + data.len();
    if end > MAX_IMAGE_SIZE {
        return Err(FirmwareFileError::TooLarge { end });
    }
    if image.len() < end {
        image.resize(end, 0xff);
    }
    image[address..end].copy_from_slice(data);
    Ok(())
}

pub fn decode_hex(content: &[u8]) -> Result<Vec<u8>, FirmwareFileError> {
    let text = std::str::from_utf8(content).map_err(|_| FirmwareFileError::NotText)?;

    let mut image = Vec::new();
    let mut base_address = 0;

    for record in ihex::Reader::new(text) {
        match record? {
            Record::Data { offset, value } => {
                place(&mut image, base_address + usize::from(offset), &value)?;
            }
            Record::ExtendedSegmentAddress(address) => {
                base_address = usize::from(address) * 16;
            }
            Record::ExtendedLinearAddress(address) => {
                base_address = usize::from(address) << 16;
            }
            Record::EndOfFile
            | Record::StartSegmentAddress { .. }
            | Record::StartLinearAddress(_) => {}
        }
    }

    Ok(image)
}

pub fn decode_elf(content: &[u8]) -> Result<Vec<u8>, FirmwareFileError> {
    let header = FileHeader32::<Endianness>::parse(content)?;
    let endian = header.endian()?;

    let machine = header.e_machine(endian);
    if machine != EM_AVR {
        return Err(FirmwareFileError::WrongMachine(machine));
    }

    let mut image = Vec::new();
    let mut loaded = false;

    for segment in header.program_headers(endian, content)? {
        if segment.p_type(endian) != PT_LOAD {
            continue;
        }

        // Initial values of .data live in flash, at the physical address.
        let address = segment.p_paddr(endian);
        let data = segment
            .data(endian, content)
            .map_err(|()| FirmwareFileError::SegmentData)?;
        if data.is_empty() {
            continue;
        }
        if address >= FLASH_SPACE_END {
            tracing::debug!("Skipping segment at {:#x}, outside of flash", address);
            continue;
        }

        tracing::info!(
            "Found loadable segment at {:#06x} ({} bytes)",
            address,
            data.len()
        );
        place(&mut image, address as usize, data)?;
        loaded = true;
    }

    if !loaded {
        return Err(FirmwareFileError::NoLoadableSegments);
    }
    Ok(image)
}

/// Encodes a memory image starting at address 0 as Intel HEX.
pub fn encode_hex(data: &[u8]) -> Result<String, FirmwareFileError> {
    if data.len() > MAX_IMAGE_SIZE {
        return Err(FirmwareFileError::TooLarge { end: data.len() });
    }

    let mut records: Vec<Record> = data
        .chunks(HEX_RECORD_LEN)
        .enumerate()
        .map(|(i, chunk)| Record::Data {
            offset: (i * HEX_RECORD_LEN) as u16,
            value: chunk.to_vec(),
        })
        .collect();
    records.push(Record::EndOfFile);

    Ok(ihex::create_object_file_representation(&records)?)
}
