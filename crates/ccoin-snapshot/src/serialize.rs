use std::io::{self, Read, Write};

// https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/serialize.h#L305
pub fn write_compact_size<W: Write>(writer: &mut W, size: u64) -> io::Result<()> {
    if size < 253 {
        writer.write_all(&[size as u8])?;
    } else if size <= 0xFFFF {
        writer.write_all(&[253])?;
        writer.write_all(&(size as u16).to_le_bytes())?;
    } else if size <= 0xFFFF_FFFF {
        writer.write_all(&[254])?;
        writer.write_all(&(size as u32).to_le_bytes())?;
    } else {
        writer.write_all(&[255])?;
        writer.write_all(&size.to_le_bytes())?;
    }
    Ok(())
}

pub fn read_compact_size<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;
    match tag[0] {
        253 => {
            let mut bytes = [0u8; 2];
            reader.read_exact(&mut bytes)?;
            let value = u64::from(u16::from_le_bytes(bytes));
            check_canonical(value, 253)?;
            Ok(value)
        }
        254 => {
            let mut bytes = [0u8; 4];
            reader.read_exact(&mut bytes)?;
            let value = u64::from(u32::from_le_bytes(bytes));
            check_canonical(value, 0x1_0000)?;
            Ok(value)
        }
        255 => {
            let mut bytes = [0u8; 8];
            reader.read_exact(&mut bytes)?;
            let value = u64::from_le_bytes(bytes);
            check_canonical(value, 0x1_0000_0000)?;
            Ok(value)
        }
        short => Ok(u64::from(short)),
    }
}

// Reject non-minimal encodings so that serialization stays canonical.
fn check_canonical(value: u64, min: u64) -> io::Result<()> {
    if value < min {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Non-canonical compact size encoding of {value}"),
        ));
    }
    Ok(())
}

pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_compact_size(writer, bytes.len() as u64)?;
    writer.write_all(bytes)
}

pub fn read_bytes<R: Read>(reader: &mut R, max_len: u64) -> io::Result<Vec<u8>> {
    let len = read_compact_size(reader)?;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Byte string length {len} exceeds the limit of {max_len}"),
        ));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}
