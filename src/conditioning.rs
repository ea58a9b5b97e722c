//! Conditioning bundles: a `(data, meta)` pair where meta values are either
//! tensors or plain scalars, carried as one base64 blob.
//!
//! The blob wraps a deflate-compressed archive with these members:
//!
//! - `cond_data.npy`: the data tensor
//! - `cond_meta.json`: one tagged record per meta key
//! - `cond_meta.<n>.npy`: one array per tensor-valued meta key, referenced
//!   from its record
//!
//! Tensors keep their dtype, except bf16, which npy cannot describe and is
//! stored widened to f32.
//!
//! Any structural problem on decode (bad base64, corrupt archive, missing
//! member, unparsable record) surfaces as a single [`Error::Format`] whose
//! source is the stage that failed.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::envelope;
use crate::error::{Error, Result};
use crate::tensor::npz::{NpzReader, NpzWriter};
use crate::tensor::tensors_equal;

const DATA_MEMBER: &str = "cond_data";
const META_MEMBER: &str = "cond_meta.json";

/// Plain (non-tensor) meta value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// A conditioning meta value.
#[derive(Debug, Clone)]
pub enum MetaValue {
    Tensor(Tensor),
    Scalar(Scalar),
}

impl PartialEq for MetaValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Tensor(a), Self::Tensor(b)) => tensors_equal(a, b).unwrap_or(false),
            (Self::Scalar(a), Self::Scalar(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Tensor> for MetaValue {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        Self::Scalar(Scalar::Bool(v))
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        Self::Scalar(Scalar::Int(v))
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        Self::Scalar(Scalar::Float(v))
    }
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        Self::Scalar(Scalar::Text(v.to_string()))
    }
}

/// One conditioning entry.
#[derive(Debug, Clone)]
pub struct ConditioningEntry {
    pub data: Tensor,
    pub meta: BTreeMap<String, MetaValue>,
}

impl ConditioningEntry {
    pub fn new(data: Tensor) -> Self {
        Self {
            data,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

impl PartialEq for ConditioningEntry {
    fn eq(&self, other: &Self) -> bool {
        tensors_equal(&self.data, &other.data).unwrap_or(false) && self.meta == other.meta
    }
}

/// Serialized form of one meta value inside `cond_meta.json`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredMeta {
    Tensor { member: String },
    Bool { value: bool },
    Int { value: i64 },
    /// IEEE-754 bits, so NaN and infinities survive JSON.
    Float { bits: u64 },
    String { value: String },
}

/// Encode a single entry.
pub fn encode_entry(entry: &ConditioningEntry) -> Result<String> {
    let mut archive = NpzWriter::new(true);
    archive.add_array(DATA_MEMBER, &entry.data)?;

    let mut records = BTreeMap::new();
    for (index, (key, value)) in entry.meta.iter().enumerate() {
        let record = match value {
            MetaValue::Tensor(t) => {
                let member = format!("cond_meta.{index}");
                archive.add_array(&member, t)?;
                StoredMeta::Tensor { member }
            }
            MetaValue::Scalar(Scalar::Bool(v)) => StoredMeta::Bool { value: *v },
            MetaValue::Scalar(Scalar::Int(v)) => StoredMeta::Int { value: *v },
            MetaValue::Scalar(Scalar::Float(v)) => StoredMeta::Float { bits: v.to_bits() },
            MetaValue::Scalar(Scalar::Text(v)) => StoredMeta::String { value: v.clone() },
        };
        records.insert(key.as_str(), record);
    }
    archive.add_bytes(META_MEMBER, &serde_json::to_vec(&records)?)?;

    Ok(envelope::encode(&archive.finish()?))
}

/// Encode a conditioning sequence.
///
/// Only the first entry is carried; later entries are dropped. This matches
/// what the host pipeline has always stored.
pub fn encode_conditioning(conditioning: &[ConditioningEntry]) -> Result<String> {
    let first = conditioning
        .first()
        .ok_or_else(|| Error::format("conditioning sequence is empty"))?;
    if conditioning.len() > 1 {
        log::debug!(
            "Encoding first of {} conditioning entries, the rest are dropped",
            conditioning.len()
        );
    }
    encode_entry(first)
}

/// Decode a single entry.
pub fn decode_entry(blob: &str) -> Result<ConditioningEntry> {
    decode_stages(blob)
        .map_err(|e| Error::format_with(format!("Failed to load conditioning from base64: {e}"), e))
}

/// Decode a blob into a one-element conditioning sequence.
pub fn decode_conditioning(blob: &str) -> Result<Vec<ConditioningEntry>> {
    Ok(vec![decode_entry(blob)?])
}

fn decode_stages(blob: &str) -> Result<ConditioningEntry> {
    let bytes = envelope::decode(blob)?;
    let mut archive = NpzReader::from_bytes(&bytes)?;
    let data = archive.array(DATA_MEMBER)?;

    let records: BTreeMap<String, StoredMeta> = serde_json::from_slice(&archive.member_bytes(META_MEMBER)?)
        .map_err(|e| Error::format_with(format!("'{META_MEMBER}' is not a meta mapping"), e))?;

    let mut meta = BTreeMap::new();
    for (key, record) in records {
        let value = match record {
            StoredMeta::Tensor { member } => MetaValue::Tensor(archive.array(&member)?),
            StoredMeta::Bool { value } => MetaValue::Scalar(Scalar::Bool(value)),
            StoredMeta::Int { value } => MetaValue::Scalar(Scalar::Int(value)),
            StoredMeta::Float { bits } => MetaValue::Scalar(Scalar::Float(f64::from_bits(bits))),
            StoredMeta::String { value } => MetaValue::Scalar(Scalar::Text(value)),
        };
        meta.insert(key, value);
    }

    Ok(ConditioningEntry { data, meta })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn embeddings(shape: &[usize], seed: f32) -> Tensor {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|i| ((i as f32) * seed).cos() / 7.0).collect();
        Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
    }

    fn round_trip(entry: &ConditioningEntry) -> ConditioningEntry {
        decode_entry(&encode_entry(entry).unwrap()).unwrap()
    }

    // ── round trip ───────────────────────────────────────────────────

    #[test]
    fn empty_meta_round_trips() {
        let entry = ConditioningEntry::new(embeddings(&[1, 77, 768], 0.3));
        let back = round_trip(&entry);
        assert!(back.meta.is_empty());
        assert_eq!(back, entry);
    }

    #[test]
    fn single_tensor_meta_round_trips() {
        let entry = ConditioningEntry::new(embeddings(&[1, 77, 64], 0.1))
            .with_meta("pooled_output", embeddings(&[1, 1280], 0.9));
        assert_eq!(round_trip(&entry), entry);
    }

    #[test]
    fn mixed_meta_round_trips() {
        let entry = ConditioningEntry::new(embeddings(&[1, 4, 8], 1.3))
            .with_meta("pooled_output", embeddings(&[1, 16], 0.2))
            .with_meta("strength", 0.85f64)
            .with_meta("start_percent", f64::NAN)
            .with_meta("steps", 20i64)
            .with_meta("set_area_to_bounds", false)
            .with_meta("mask_strength", "full")
            .with_meta(
                "token_ids",
                Tensor::from_vec(vec![49406i64, 320, 49407], 3, &Device::Cpu).unwrap(),
            );
        let back = round_trip(&entry);

        assert_eq!(back.meta.len(), 7);
        assert_eq!(back.meta["strength"], MetaValue::Scalar(Scalar::Float(0.85)));
        assert_eq!(back.meta["steps"], MetaValue::Scalar(Scalar::Int(20)));
        assert_eq!(back.meta["mask_strength"], MetaValue::from("full"));
        match &back.meta["start_percent"] {
            MetaValue::Scalar(Scalar::Float(v)) => assert!(v.is_nan()),
            other => panic!("unexpected {other:?}"),
        }
        match &back.meta["token_ids"] {
            MetaValue::Tensor(t) => assert_eq!(t.dtype(), DType::I64),
            other => panic!("unexpected {other:?}"),
        }
        assert!(tensors_equal(&back.data, &entry.data).unwrap());
        assert_eq!(back.meta["pooled_output"], entry.meta["pooled_output"]);
    }

    #[test]
    fn half_precision_round_trips() {
        let entry = ConditioningEntry::new(embeddings(&[1, 4, 8], 0.6).to_dtype(DType::F16).unwrap())
            .with_meta("pooled_output", embeddings(&[1, 16], 0.2).to_dtype(DType::F16).unwrap())
            .with_meta(
                "token_ids",
                Tensor::new(&[(1i64 << 53) + 1, 7], &Device::Cpu).unwrap(),
            );
        let back = round_trip(&entry);
        assert_eq!(back.data.dtype(), DType::F16);
        assert_eq!(back, entry);
    }

    #[test]
    fn bf16_is_widened_to_f32() {
        let data = embeddings(&[1, 2, 4], 0.4).to_dtype(DType::BF16).unwrap();
        let back = round_trip(&ConditioningEntry::new(data.clone()));
        assert_eq!(back.data.dtype(), DType::F32);
        assert!(tensors_equal(&back.data, &data.to_dtype(DType::F32).unwrap()).unwrap());
    }

    #[test]
    fn scalar_and_tensor_are_not_equal() {
        let t = MetaValue::Tensor(Tensor::new(&[1.0f64], &Device::Cpu).unwrap());
        assert_ne!(t, MetaValue::from(1.0f64));
    }

    // ── sequences ────────────────────────────────────────────────────

    #[test]
    fn only_first_entry_is_encoded() {
        let first = ConditioningEntry::new(embeddings(&[1, 2, 2], 0.5)).with_meta("tag", "first");
        let second = ConditioningEntry::new(embeddings(&[1, 3, 3], 0.7)).with_meta("tag", "second");
        let blob = encode_conditioning(&[first.clone(), second]).unwrap();
        let decoded = decode_conditioning(&blob).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], first);
    }

    #[test]
    fn empty_sequence_fails() {
        assert!(encode_conditioning(&[]).unwrap_err().is_format());
    }

    // ── failures ─────────────────────────────────────────────────────

    #[test]
    fn invalid_base64_is_format_error() {
        let err = decode_entry("%%%").unwrap_err();
        assert!(err.is_format());
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("base64"));
    }

    #[test]
    fn non_archive_is_format_error() {
        let err = decode_entry(&envelope::encode(b"plain bytes")).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn missing_meta_member_is_format_error() {
        let mut archive = NpzWriter::new(true);
        archive.add_array(DATA_MEMBER, &embeddings(&[1, 2], 1.0)).unwrap();
        let blob = envelope::encode(&archive.finish().unwrap());

        let err = decode_entry(&blob).unwrap_err();
        assert!(err.is_format());
        assert!(err.to_string().contains(META_MEMBER));
    }

    #[test]
    fn missing_data_member_is_format_error() {
        let mut archive = NpzWriter::new(true);
        archive.add_bytes(META_MEMBER, b"{}").unwrap();
        let blob = envelope::encode(&archive.finish().unwrap());

        let err = decode_entry(&blob).unwrap_err();
        assert!(err.is_format());
        assert!(err.to_string().contains("cond_data"));
    }
}
