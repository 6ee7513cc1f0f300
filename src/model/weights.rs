//! SafeTensors weight files
//!
//! Weights are held as `f32` in memory whatever their on-disk dtype; the dtype
//! is remembered so that a model saved after merging keeps the precision it was
//! loaded with.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use half::{bf16, f16};
use ndarray::Array2;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::Deserialize;

use crate::{Error, Result};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Named 2-D weights, sorted by name
pub type StateDict = BTreeMap<String, Array2<f32>>;

/// Storage precision of a weight file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightDtype {
    #[default]
    F32,
    F16,
    BF16,
}

impl WeightDtype {
    pub fn from_safetensors(dtype: Dtype) -> Result<Self> {
        match dtype {
            Dtype::F32 => Ok(WeightDtype::F32),
            Dtype::F16 => Ok(WeightDtype::F16),
            Dtype::BF16 => Ok(WeightDtype::BF16),
            other => Err(Error::Model(format!("unsupported weight dtype {other:?}"))),
        }
    }

    pub fn to_safetensors(self) -> Dtype {
        match self {
            WeightDtype::F32 => Dtype::F32,
            WeightDtype::F16 => Dtype::F16,
            WeightDtype::BF16 => Dtype::BF16,
        }
    }

    /// Name used in `config.json` (`torch_dtype`)
    pub fn as_torch_str(self) -> &'static str {
        match self {
            WeightDtype::F32 => "float32",
            WeightDtype::F16 => "float16",
            WeightDtype::BF16 => "bfloat16",
        }
    }

    pub fn from_torch_str(s: &str) -> Option<Self> {
        match s {
            "float32" => Some(WeightDtype::F32),
            "float16" => Some(WeightDtype::F16),
            "bfloat16" => Some(WeightDtype::BF16),
            _ => None,
        }
    }

    pub fn is_half(self) -> bool {
        !matches!(self, WeightDtype::F32)
    }

    /// Tensor views inside a safetensors buffer carry no alignment guarantee,
    /// so bytes are copied out with `pod_collect_to_vec` rather than cast.
    fn decode(self, bytes: &[u8]) -> Vec<f32> {
        match self {
            WeightDtype::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
            WeightDtype::F16 => bytemuck::pod_collect_to_vec::<u8, f16>(bytes)
                .into_iter()
                .map(f16::to_f32)
                .collect(),
            WeightDtype::BF16 => bytemuck::pod_collect_to_vec::<u8, bf16>(bytes)
                .into_iter()
                .map(bf16::to_f32)
                .collect(),
        }
    }

    fn encode(self, values: &Array2<f32>) -> Vec<u8> {
        match self {
            WeightDtype::F32 => {
                let flat: Vec<f32> = values.iter().copied().collect();
                bytemuck::cast_slice(&flat).to_vec()
            }
            WeightDtype::F16 => {
                let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
                bytemuck::cast_slice(&halves).to_vec()
            }
            WeightDtype::BF16 => {
                let halves: Vec<bf16> = values.iter().map(|&v| bf16::from_f32(v)).collect();
                bytemuck::cast_slice(&halves).to_vec()
            }
        }
    }
}

/// Parse a safetensors buffer. 1-D tensors are returned as `[1, n]`.
///
/// Returns the dtype of the first tensor; mixed-dtype files are rejected.
pub fn deserialize(bytes: &[u8]) -> Result<(StateDict, WeightDtype)> {
    let tensors = SafeTensors::deserialize(bytes)?;
    let mut state = StateDict::new();
    let mut file_dtype: Option<WeightDtype> = None;

    for (name, view) in tensors.tensors() {
        let dtype = WeightDtype::from_safetensors(view.dtype())?;
        match file_dtype {
            None => file_dtype = Some(dtype),
            Some(d) if d != dtype => {
                return Err(Error::Model(format!(
                    "tensor {name} is {dtype:?} but the file is {d:?}"
                )))
            }
            Some(_) => {}
        }

        let (rows, cols) = match view.shape() {
            [n] => (1, *n),
            [r, c] => (*r, *c),
            other => {
                return Err(Error::Model(format!(
                    "tensor {name} has unsupported rank {} (shape {other:?})",
                    other.len()
                )))
            }
        };
        let values = dtype.decode(view.data());
        let array = Array2::from_shape_vec((rows, cols), values).map_err(|_| {
            Error::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![view.data().len()],
            }
        })?;
        state.insert(name, array);
    }

    Ok((state, file_dtype.unwrap_or_default()))
}

/// Encode weights in the given dtype with optional header metadata
pub fn serialize(
    state: &StateDict,
    dtype: WeightDtype,
    metadata: Option<HashMap<String, String>>,
) -> Result<Vec<u8>> {
    let encoded: Vec<(&str, Vec<u8>, Vec<usize>)> = state
        .iter()
        .map(|(name, arr)| {
            let (r, c) = arr.dim();
            (name.as_str(), dtype.encode(arr), vec![r, c])
        })
        .collect();

    let views = encoded
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(dtype.to_safetensors(), shape.clone(), bytes).map(|v| (*name, v))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(safetensors::serialize(views, metadata)?)
}

pub fn load_file(path: impl AsRef<Path>) -> Result<(StateDict, WeightDtype)> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    deserialize(&bytes)
}

pub fn save_file(
    path: impl AsRef<Path>,
    state: &StateDict,
    dtype: WeightDtype,
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    let bytes = serialize(state, dtype, metadata)?;
    fs::write(path, bytes)?;
    Ok(())
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: BTreeMap<String, String>,
}

/// Load the weights of a model directory, single-file or sharded
pub fn load_dir(dir: impl AsRef<Path>) -> Result<(StateDict, WeightDtype)> {
    let dir = dir.as_ref();
    let single = dir.join(WEIGHTS_FILE);
    if single.exists() {
        return load_file(single);
    }

    let index_path = dir.join(WEIGHTS_INDEX_FILE);
    if !index_path.exists() {
        return Err(Error::NotFound(single));
    }
    let index: ShardIndex = serde_json::from_str(&fs::read_to_string(&index_path)?)?;

    let mut shards: Vec<&String> = index.weight_map.values().collect();
    shards.sort();
    shards.dedup();

    let mut state = StateDict::new();
    let mut dtype = None;
    for shard in shards {
        let (part, part_dtype) = load_file(dir.join(shard))?;
        if dtype.is_some_and(|d| d != part_dtype) {
            return Err(Error::Model(format!("shard {shard} has a different dtype")));
        }
        dtype = Some(part_dtype);
        state.extend(part);
    }
    Ok((state, dtype.unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sample() -> StateDict {
        let mut state = StateDict::new();
        state.insert("a.weight".into(), array![[1.0, -2.5], [0.125, 3.0]]);
        state.insert("b.weight".into(), array![[0.5, 0.25, -1.0]]);
        state
    }

    #[test]
    fn test_decode_unaligned_bytes() {
        let values = array![[1.5f32, -0.25, 8.0]];
        for dtype in [WeightDtype::F32, WeightDtype::F16, WeightDtype::BF16] {
            let mut buf = vec![0u8];
            buf.extend(dtype.encode(&values));
            let decoded = dtype.decode(&buf[1..]);
            assert_eq!(decoded, vec![1.5, -0.25, 8.0], "{dtype:?}");
        }
    }

    #[test]
    fn test_f32_exact() {
        let bytes = serialize(&sample(), WeightDtype::F32, None).unwrap();
        let (state, dtype) = deserialize(&bytes).unwrap();
        assert_eq!(dtype, WeightDtype::F32);
        assert_eq!(state, sample());
    }

    #[test]
    fn test_half_precision_kept() {
        for dtype in [WeightDtype::F16, WeightDtype::BF16] {
            let bytes = serialize(&sample(), dtype, None).unwrap();
            let (state, loaded) = deserialize(&bytes).unwrap();
            assert_eq!(loaded, dtype);
            // Values chosen to be exactly representable
            assert_abs_diff_eq!(state["a.weight"][[0, 1]], -2.5);
            assert_abs_diff_eq!(state["b.weight"][[0, 2]], -1.0);
        }
    }

    #[test]
    fn test_half_rounding() {
        let mut state = StateDict::new();
        state.insert("w".into(), array![[0.1f32]]);
        let bytes = serialize(&state, WeightDtype::F16, None).unwrap();
        let (loaded, _) = deserialize(&bytes).unwrap();
        assert_abs_diff_eq!(loaded["w"][[0, 0]], 0.1, epsilon = 1e-3);
    }

    #[test]
    fn test_metadata_written() {
        let mut meta = HashMap::new();
        meta.insert("format".to_string(), "pt".to_string());
        let bytes = serialize(&sample(), WeightDtype::F32, Some(meta)).unwrap();
        let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
        let md = header.metadata().as_ref().unwrap();
        assert_eq!(md.get("format").map(String::as_str), Some("pt"));
    }

    #[test]
    fn test_torch_dtype_names() {
        for d in [WeightDtype::F32, WeightDtype::F16, WeightDtype::BF16] {
            assert_eq!(WeightDtype::from_torch_str(d.as_torch_str()), Some(d));
        }
        assert!(WeightDtype::BF16.is_half());
        assert!(!WeightDtype::F32.is_half());
    }

    #[test]
    fn test_load_dir_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let full = sample();
        let mut first = StateDict::new();
        first.insert("a.weight".into(), full["a.weight"].clone());
        let mut second = StateDict::new();
        second.insert("b.weight".into(), full["b.weight"].clone());
        save_file(dir.path().join("model-00001-of-00002.safetensors"), &first, WeightDtype::F32, None)
            .unwrap();
        save_file(dir.path().join("model-00002-of-00002.safetensors"), &second, WeightDtype::F32, None)
            .unwrap();
        let index = serde_json::json!({
            "metadata": {},
            "weight_map": {
                "a.weight": "model-00001-of-00002.safetensors",
                "b.weight": "model-00002-of-00002.safetensors"
            }
        });
        fs::write(dir.path().join(WEIGHTS_INDEX_FILE), index.to_string()).unwrap();

        let (state, _) = load_dir(dir.path()).unwrap();
        assert_eq!(state, full);
    }

    #[test]
    fn test_load_dir_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_dir(dir.path()), Err(Error::NotFound(_))));
    }
}
