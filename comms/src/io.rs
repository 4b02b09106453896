//! Persistence of checkpoint entries.
//!
//! A checkpoint is stored as a single safetensors container, every `Item`
//! becomes one tensor keeping its name, shape, precision and raw bytes.

use std::{fs, path::Path};

use log::debug;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{CommsErr, Item, Precision, Result};

fn dtype_of(precision: Precision) -> Dtype {
    match precision {
        Precision::Float16 => Dtype::F16,
        Precision::BFloat16 => Dtype::BF16,
        Precision::Float32 => Dtype::F32,
        Precision::Float64 => Dtype::F64,
    }
}

fn precision_of(dtype: Dtype) -> Result<Precision> {
    match dtype {
        Dtype::F16 => Ok(Precision::Float16),
        Dtype::BF16 => Ok(Precision::BFloat16),
        Dtype::F32 => Ok(Precision::Float32),
        Dtype::F64 => Ok(Precision::Float64),
        other => Err(CommsErr::UnsupportedDtype(format!("{other:?}"))),
    }
}

/// Encodes a list of checkpoint entries into a single container.
///
/// # Arguments
/// * `items` - The entries to encode, their names must be unique.
///
/// # Returns
/// The encoded bytes or an error if any entry is malformed.
pub fn serialize(items: &[Item]) -> Result<Vec<u8>> {
    let views = items
        .iter()
        .map(|item| {
            let view = TensorView::new(dtype_of(item.precision), item.shape.clone(), &item.bytes)?;
            Ok((item.name.as_str(), view))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(safetensors::serialize(views, &None)?)
}

/// Decodes a container produced by `serialize`.
///
/// # Arguments
/// * `bytes` - The encoded container.
///
/// # Returns
/// The stored entries sorted by name.
pub fn deserialize(bytes: &[u8]) -> Result<Vec<Item>> {
    let tensors = SafeTensors::deserialize(bytes)?;

    let mut items = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let precision = precision_of(view.dtype())?;
            Item::new(name, view.shape().to_vec(), precision, view.data().to_vec())
        })
        .collect::<Result<Vec<_>>>()?;

    items.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(items)
}

/// Writes a list of checkpoint entries to `path`.
pub fn save<P: AsRef<Path>>(path: P, items: &[Item]) -> Result<()> {
    let bytes = serialize(items)?;
    fs::write(&path, &bytes)?;
    debug!(
        "saved {} checkpoint entries ({} bytes) to {}",
        items.len(),
        bytes.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Reads the checkpoint entries stored at `path`.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<Item>> {
    let bytes = fs::read(&path)?;
    let items = deserialize(&bytes)?;
    debug!(
        "loaded {} checkpoint entries from {}",
        items.len(),
        path.as_ref().display()
    );
    Ok(items)
}
