// Model weight store — name → flat weights, optionally VQ-compressed.
//
// The quantization mode is fixed when the store is built; every
// `add_weights` routes through it once, no per-call mode probing:
//
//   None — raw f32 arrays
//   Int8 — 256-entry codebook, one code byte per value
//   Int4 — 16-entry codebook, two codes per byte; if the fitted codebook's
//          distortion crosses the quality gate the entry silently falls
//          back to raw storage (logged at info)
//
// A name lives in exactly one of the three backing maps at any time:
// insertion clears it from the other two first. Reads of absent names
// return None with a warning, never a hard failure — incremental model
// surgery legitimately asks for weights that do not exist yet.

use std::collections::HashMap;

use half::f16;
use stoat_core::weight::WeightIo;
use tracing::{info, warn};

use crate::vq::VectorQuantizer;

/// Distortion at or above this rejects INT4 compression for an entry.
const INT4_DISTORTION_GATE: f64 = 0.1;

/// Compression applied to stored weights, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantMode {
    #[default]
    None,
    Int8,
    Int4,
}

/// One compressed entry: codes plus the codebook to decode them.
#[derive(Debug, Clone)]
pub struct QuantEntry {
    /// Code stream. INT8: one byte per value. INT4: two values per byte,
    /// even index in the low nibble.
    pub codes: Vec<u8>,
    pub codebook: Vec<f32>,
    /// Original value count (needed for INT4, where the final byte may
    /// carry only one value).
    pub value_count: usize,
}

/// Name-keyed weight storage with optional vector-quantized compression.
#[derive(Debug, Default)]
pub struct ModelStore {
    mode: QuantMode,
    raw: HashMap<String, Vec<f32>>,
    int8: HashMap<String, QuantEntry>,
    int4: HashMap<String, QuantEntry>,
}

impl ModelStore {
    pub fn new(mode: QuantMode) -> Self {
        ModelStore {
            mode,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> QuantMode {
        self.mode
    }

    /// Store a weight array under `name`, replacing any previous entry in
    /// any representation.
    pub fn add_weights(&mut self, name: &str, values: Vec<f32>) {
        self.delete_weights(name);
        match self.mode {
            QuantMode::None => {
                self.raw.insert(name.to_string(), values);
            }
            QuantMode::Int8 => match quantize_int8(&values) {
                Ok(entry) => {
                    self.int8.insert(name.to_string(), entry);
                }
                Err(err) => {
                    info!(name, %err, "int8 quantization unavailable, storing raw");
                    self.raw.insert(name.to_string(), values);
                }
            },
            QuantMode::Int4 => match quantize_int4(&values) {
                Ok(Some(entry)) => {
                    self.int4.insert(name.to_string(), entry);
                }
                Ok(None) => {
                    info!(
                        name,
                        gate = INT4_DISTORTION_GATE,
                        "int4 distortion over the quality gate, storing raw"
                    );
                    self.raw.insert(name.to_string(), values);
                }
                Err(err) => {
                    info!(name, %err, "int4 quantization unavailable, storing raw");
                    self.raw.insert(name.to_string(), values);
                }
            },
        }
    }

    /// Reconstruct a weight array. Absent names warn and return None.
    pub fn get_weights(&self, name: &str) -> Option<Vec<f32>> {
        if let Some(values) = self.raw.get(name) {
            return Some(values.clone());
        }
        if let Some(entry) = self.int8.get(name) {
            return Some(decode_int8(entry));
        }
        if let Some(entry) = self.int4.get(name) {
            return Some(decode_int4(entry));
        }
        warn!(name, "weight entry not found in any store");
        None
    }

    /// Reconstruct as half precision (for f16 model loads).
    pub fn get_weights_half(&self, name: &str) -> Option<Vec<f16>> {
        self.get_weights(name)
            .map(|v| v.into_iter().map(f16::from_f32).collect())
    }

    /// Remove `name` from every backing map.
    pub fn delete_weights(&mut self, name: &str) {
        self.raw.remove(name);
        self.int8.remove(name);
        self.int4.remove(name);
    }

    pub fn clear_weights(&mut self) {
        self.raw.clear();
        self.int8.clear();
        self.int4.clear();
    }

    pub fn len(&self) -> usize {
        self.raw.len() + self.int8.len() + self.int4.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.raw.contains_key(name)
            || self.int8.contains_key(name)
            || self.int4.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .raw
            .keys()
            .chain(self.int8.keys())
            .chain(self.int4.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names
    }

    // Persistence hooks used by the checkpoint module.

    pub(crate) fn raw_entries(&self) -> &HashMap<String, Vec<f32>> {
        &self.raw
    }

    pub(crate) fn int8_entries(&self) -> &HashMap<String, QuantEntry> {
        &self.int8
    }

    pub(crate) fn int4_entries(&self) -> &HashMap<String, QuantEntry> {
        &self.int4
    }

    pub(crate) fn insert_raw(&mut self, name: String, values: Vec<f32>) {
        self.delete_weights(&name);
        self.raw.insert(name, values);
    }

    pub(crate) fn insert_int8(&mut self, name: String, entry: QuantEntry) {
        self.delete_weights(&name);
        self.int8.insert(name, entry);
    }

    pub(crate) fn insert_int4(&mut self, name: String, entry: QuantEntry) {
        self.delete_weights(&name);
        self.int4.insert(name, entry);
    }
}

impl WeightIo for ModelStore {
    fn add_weights(&mut self, name: &str, values: Vec<f32>) {
        ModelStore::add_weights(self, name, values);
    }

    fn get_weights(&self, name: &str) -> Option<Vec<f32>> {
        ModelStore::get_weights(self, name)
    }
}

// Quantized encode/decode

fn quantize_int8(values: &[f32]) -> stoat_core::Result<QuantEntry> {
    // Pad the sample stream with zeros up to the codebook size so small
    // arrays still train a full 256-entry book (zero is always
    // representable).
    let mut samples = values.to_vec();
    if samples.len() < 256 {
        samples.resize(256, 0.0);
    }
    let vq = VectorQuantizer::fit(&samples, 256)?;
    let codes: Vec<u8> = values.iter().map(|&v| vq.quantize(v) as u8).collect();
    Ok(QuantEntry {
        codes,
        codebook: vq.codebook().to_vec(),
        value_count: values.len(),
    })
}

fn decode_int8(entry: &QuantEntry) -> Vec<f32> {
    entry
        .codes
        .iter()
        .map(|&c| entry.codebook[c as usize])
        .collect()
}

/// Returns Ok(None) when the fitted codebook misses the quality gate.
fn quantize_int4(values: &[f32]) -> stoat_core::Result<Option<QuantEntry>> {
    let mut samples = values.to_vec();
    if samples.len() < 16 {
        samples.resize(16, 0.0);
    }
    let vq = VectorQuantizer::fit(&samples, 16)?;
    if vq.distortion() >= INT4_DISTORTION_GATE {
        return Ok(None);
    }

    // Two 4-bit codes per byte: even value in the low nibble, odd in the
    // high nibble.
    let mut codes = Vec::with_capacity(values.len().div_ceil(2));
    for pair in values.chunks(2) {
        let low = vq.quantize(pair[0]) as u8;
        let high = if pair.len() > 1 {
            vq.quantize(pair[1]) as u8
        } else {
            0
        };
        codes.push(low | (high << 4));
    }
    Ok(Some(QuantEntry {
        codes,
        codebook: vq.codebook().to_vec(),
        value_count: values.len(),
    }))
}

fn decode_int4(entry: &QuantEntry) -> Vec<f32> {
    let mut out = Vec::with_capacity(entry.value_count);
    for &byte in &entry.codes {
        out.push(entry.codebook[(byte & 0x0f) as usize]);
        if out.len() < entry.value_count {
            out.push(entry.codebook[(byte >> 4) as usize]);
        }
    }
    out.truncate(entry.value_count);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_mode_roundtrips_exactly() {
        let mut store = ModelStore::new(QuantMode::None);
        let values = vec![0.1f32, -0.5, 2.0];
        store.add_weights("w", values.clone());
        assert_eq!(store.get_weights("w").unwrap(), values);
    }

    #[test]
    fn int8_roundtrip_within_codebook_spacing() {
        let mut store = ModelStore::new(QuantMode::Int8);
        let values: Vec<f32> = (0..1000).map(|i| (i as f32 / 999.0) - 0.5).collect();
        store.add_weights("w", values.clone());
        let back = store.get_weights("w").unwrap();
        // With 256 entries over a unit range the cells are ~1/256 wide;
        // allow a full cell of slack for uneven Lloyd partitions.
        for (a, b) in values.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 1.0 / 255.0, "{a} vs {b}");
        }
    }

    #[test]
    fn int8_constant_array_is_exact() {
        let mut store = ModelStore::new(QuantMode::Int8);
        store.add_weights("ones", vec![1.0f32; 500]);
        let back = store.get_weights("ones").unwrap();
        assert!(back.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn int4_packs_two_values_per_byte() {
        let mut store = ModelStore::new(QuantMode::Int4);
        // 5 distinct values: fits a 16-entry codebook losslessly.
        let values = vec![0.0f32, 0.25, 0.5, 0.75, 1.0];
        store.add_weights("w", values.clone());
        let entry = store.int4_entries().get("w").unwrap();
        assert_eq!(entry.codes.len(), 3); // ceil(5 / 2)
        assert_eq!(store.get_weights("w").unwrap(), values);
    }

    #[test]
    fn int4_quality_gate_falls_back_to_raw() {
        let mut store = ModelStore::new(QuantMode::Int4);
        // Spread far beyond what 16 centroids can cover tightly.
        let values: Vec<f32> = (0..4096).map(|i| (i % 512) as f32).collect();
        store.add_weights("wild", values.clone());
        assert!(store.int4_entries().is_empty());
        assert_eq!(store.raw_entries().get("wild").unwrap(), &values);
        // Reads stay transparent.
        assert_eq!(store.get_weights("wild").unwrap(), values);
    }

    #[test]
    fn one_name_one_representation() {
        let mut store = ModelStore::new(QuantMode::Int8);
        store.add_weights("w", vec![1.0; 300]);
        assert!(store.int8_entries().contains_key("w"));
        // Re-adding through a raw insert must evict the quantized entry.
        store.insert_raw("w".to_string(), vec![2.0]);
        assert!(!store.int8_entries().contains_key("w"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_weights("w").unwrap(), vec![2.0]);
    }

    #[test]
    fn missing_name_returns_none() {
        let store = ModelStore::new(QuantMode::None);
        assert!(store.get_weights("ghost").is_none());
        assert!(store.get_weights_half("ghost").is_none());
    }

    #[test]
    fn half_read_matches_f32_read() {
        let mut store = ModelStore::new(QuantMode::None);
        store.add_weights("w", vec![0.5f32, -1.25]);
        let half = store.get_weights_half("w").unwrap();
        assert_eq!(half[0].to_f32(), 0.5);
        assert_eq!(half[1].to_f32(), -1.25);
    }

    #[test]
    fn delete_and_clear() {
        let mut store = ModelStore::new(QuantMode::None);
        store.add_weights("a", vec![1.0]);
        store.add_weights("b", vec![2.0]);
        assert_eq!(store.names(), vec!["a", "b"]);
        store.delete_weights("a");
        assert!(!store.contains("a"));
        store.clear_weights();
        assert!(store.is_empty());
    }
}
