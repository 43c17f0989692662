// Checkpoint — binary persistence for the model weight store.
//
// Format (.stw), little-endian throughout:
//
//   Header:
//     magic:   [u8; 4] = b"STWS"
//     version: u32     = 1
//     mode:    u8      (0 = raw, 1 = int8, 2 = int4 — the store's mode)
//     count:   u32     = number of entries
//
//   Per entry:
//     name_len: u32, name: [u8] (UTF-8)
//     kind:     u8   (0 = raw, 1 = int8, 2 = int4)
//     raw payload:        count u64, values [f32 LE]
//     quantized payload:  value_count u64,
//                         codebook_len u32, codebook [f32 LE],
//                         codes_len u64, codes [u8]

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use stoat_core::{Error, Result};

use crate::store::{ModelStore, QuantEntry, QuantMode};

const MAGIC: &[u8; 4] = b"STWS";
const VERSION: u32 = 1;

fn io_err(e: std::io::Error) -> Error {
    Error::msg(format!("checkpoint io error: {e}"))
}

// LE primitives

fn write_u8(w: &mut impl Write, v: u8) -> std::io::Result<()> {
    w.write_all(&[v])
}

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f32s(w: &mut impl Write, values: &[f32]) -> std::io::Result<()> {
    for &v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_f32s(r: &mut impl Read, count: usize) -> std::io::Result<Vec<f32>> {
    let bytes = read_bytes(r, count * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn mode_tag(mode: QuantMode) -> u8 {
    match mode {
        QuantMode::None => 0,
        QuantMode::Int8 => 1,
        QuantMode::Int4 => 2,
    }
}

fn tag_mode(tag: u8) -> Result<QuantMode> {
    match tag {
        0 => Ok(QuantMode::None),
        1 => Ok(QuantMode::Int8),
        2 => Ok(QuantMode::Int4),
        _ => Err(Error::msg(format!("unknown quantization tag {tag}"))),
    }
}

// Write

pub fn write_store(writer: &mut impl Write, store: &ModelStore) -> Result<()> {
    writer.write_all(MAGIC).map_err(io_err)?;
    write_u32(writer, VERSION).map_err(io_err)?;
    write_u8(writer, mode_tag(store.mode())).map_err(io_err)?;
    write_u32(writer, store.len() as u32).map_err(io_err)?;

    for (name, values) in store.raw_entries() {
        write_entry_header(writer, name, 0)?;
        write_u64(writer, values.len() as u64).map_err(io_err)?;
        write_f32s(writer, values).map_err(io_err)?;
    }
    for (name, entry) in store.int8_entries() {
        write_entry_header(writer, name, 1)?;
        write_quant_entry(writer, entry)?;
    }
    for (name, entry) in store.int4_entries() {
        write_entry_header(writer, name, 2)?;
        write_quant_entry(writer, entry)?;
    }
    Ok(())
}

fn write_entry_header(writer: &mut impl Write, name: &str, kind: u8) -> Result<()> {
    let bytes = name.as_bytes();
    write_u32(writer, bytes.len() as u32).map_err(io_err)?;
    writer.write_all(bytes).map_err(io_err)?;
    write_u8(writer, kind).map_err(io_err)?;
    Ok(())
}

fn write_quant_entry(writer: &mut impl Write, entry: &QuantEntry) -> Result<()> {
    write_u64(writer, entry.value_count as u64).map_err(io_err)?;
    write_u32(writer, entry.codebook.len() as u32).map_err(io_err)?;
    write_f32s(writer, &entry.codebook).map_err(io_err)?;
    write_u64(writer, entry.codes.len() as u64).map_err(io_err)?;
    writer.write_all(&entry.codes).map_err(io_err)?;
    Ok(())
}

// Read

pub fn read_store(reader: &mut impl Read) -> Result<ModelStore> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(io_err)?;
    if &magic != MAGIC {
        return Err(Error::msg(format!(
            "not a stoat checkpoint: magic {magic:?}"
        )));
    }
    let version = read_u32(reader).map_err(io_err)?;
    if version != VERSION {
        return Err(Error::msg(format!(
            "unsupported checkpoint version {version} (expected {VERSION})"
        )));
    }
    let mode = tag_mode(read_u8(reader).map_err(io_err)?)?;
    let count = read_u32(reader).map_err(io_err)? as usize;

    let mut store = ModelStore::new(mode);
    for _ in 0..count {
        let name_len = read_u32(reader).map_err(io_err)? as usize;
        let name_bytes = read_bytes(reader, name_len).map_err(io_err)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|e| Error::msg(format!("invalid entry name: {e}")))?;
        let kind = read_u8(reader).map_err(io_err)?;
        match kind {
            0 => {
                let count = read_u64(reader).map_err(io_err)? as usize;
                let values = read_f32s(reader, count).map_err(io_err)?;
                store.insert_raw(name, values);
            }
            1 | 2 => {
                let value_count = read_u64(reader).map_err(io_err)? as usize;
                let cb_len = read_u32(reader).map_err(io_err)? as usize;
                let codebook = read_f32s(reader, cb_len).map_err(io_err)?;
                let codes_len = read_u64(reader).map_err(io_err)? as usize;
                let codes = read_bytes(reader, codes_len).map_err(io_err)?;
                let entry = QuantEntry {
                    codes,
                    codebook,
                    value_count,
                };
                if kind == 1 {
                    store.insert_int8(name, entry);
                } else {
                    store.insert_int4(name, entry);
                }
            }
            other => return Err(Error::msg(format!("unknown entry kind {other}"))),
        }
    }
    Ok(store)
}

/// Save a weight store to disk.
pub fn save(path: impl AsRef<Path>, store: &ModelStore) -> Result<()> {
    let file = File::create(path.as_ref()).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    write_store(&mut writer, store)?;
    writer.flush().map_err(io_err)?;
    Ok(())
}

/// Load a weight store from disk.
pub fn load(path: impl AsRef<Path>) -> Result<ModelStore> {
    let file = File::open(path.as_ref()).map_err(io_err)?;
    let mut reader = BufReader::new(file);
    read_store(&mut reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_representations() {
        let mut store = ModelStore::new(QuantMode::Int8);
        store.add_weights("enc.w", (0..400).map(|i| i as f32 / 400.0).collect());
        store.insert_raw("dec.b".to_string(), vec![1.0, -2.0, 3.0]);
        store.insert_int4(
            "ffn.w".to_string(),
            QuantEntry {
                codes: vec![0x10, 0x02],
                codebook: (0..16).map(|i| i as f32).collect(),
                value_count: 3,
            },
        );

        let mut buf = Vec::new();
        write_store(&mut buf, &store).unwrap();
        let loaded = read_store(&mut buf.as_slice()).unwrap();

        assert_eq!(loaded.mode(), QuantMode::Int8);
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.get_weights("dec.b").unwrap(), vec![1.0, -2.0, 3.0]);
        assert_eq!(
            loaded.get_weights("ffn.w").unwrap(),
            vec![0.0, 1.0, 2.0] // low nibble 0, high nibble 1, low nibble 2
        );
        let original = store.get_weights("enc.w").unwrap();
        assert_eq!(loaded.get_weights("enc.w").unwrap(), original);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        assert!(read_store(&mut &b"NOPE\x01\x00\x00\x00"[..]).is_err());

        let mut buf = Vec::new();
        write_store(&mut buf, &ModelStore::new(QuantMode::None)).unwrap();
        buf[4] = 9; // corrupt the version field
        assert!(read_store(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn file_roundtrip() {
        let dir = std::env::temp_dir().join("stoat-checkpoint-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.stw");

        let mut store = ModelStore::new(QuantMode::None);
        store.add_weights("w", vec![0.25, 0.5]);
        save(&path, &store).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.get_weights("w").unwrap(), vec![0.25, 0.5]);

        std::fs::remove_file(&path).ok();
    }
}
