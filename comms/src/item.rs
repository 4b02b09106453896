use crate::{CommsErr, Precision, Result};

/// A named, typed and shaped block of raw bytes.
///
/// It is the unit exchanged with persistent storage and between devices when
/// optimizer state gets gathered or scattered.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub name: String,
    pub shape: Vec<usize>,
    pub precision: Precision,
    pub bytes: Vec<u8>,
}

impl Item {
    /// Creates a new `Item`.
    ///
    /// # Arguments
    /// * `name` - The name under which this entry is stored.
    /// * `shape` - The dimensions of the entry.
    /// * `precision` - The numeric type of each element.
    /// * `bytes` - The raw little-endian element bytes.
    ///
    /// # Returns
    /// A new `Item` or a `SizeMismatch` error if `bytes` doesn't hold exactly
    /// the amount of elements described by `shape`.
    pub fn new(
        name: impl Into<String>,
        shape: Vec<usize>,
        precision: Precision,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let name = name.into();
        let expected = shape.iter().product::<usize>() * precision.size();

        if bytes.len() != expected {
            return Err(CommsErr::SizeMismatch {
                name,
                got: bytes.len(),
                expected,
            });
        }

        Ok(Self {
            name,
            shape,
            precision,
            bytes,
        })
    }

    /// Creates a new one dimensional `Item` out of a slice of plain numbers.
    ///
    /// The caller is responsible for `T` matching `precision`, the byte count is still checked.
    pub fn from_slice<T: bytemuck::Pod>(
        name: impl Into<String>,
        precision: Precision,
        data: &[T],
    ) -> Result<Self> {
        let bytes = bytemuck::cast_slice(data).to_vec();
        Self::new(name, vec![data.len()], precision, bytes)
    }

    /// Returns the amount of elements in this entry.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.precision.size()
    }

    /// Returns `true` if this entry holds no elements.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consolidates several equally typed entries into a single one dimensional entry.
    ///
    /// # Arguments
    /// * `name` - The name of the consolidated entry.
    /// * `items` - The entries to concatenate, in order.
    ///
    /// # Returns
    /// The consolidated entry, or an `UnsupportedDtype` error if the entries don't share a
    /// precision.
    pub fn concat(name: impl Into<String>, items: &[Item]) -> Result<Self> {
        let precision = items
            .first()
            .map(|item| item.precision)
            .unwrap_or(Precision::Float32);

        if let Some(item) = items.iter().find(|item| item.precision != precision) {
            return Err(CommsErr::UnsupportedDtype(format!(
                "cannot concatenate {} entry {} with {precision} entries",
                item.precision, item.name
            )));
        }

        let bytes: Vec<u8> = items.iter().flat_map(|item| &item.bytes).copied().collect();
        let len = bytes.len() / precision.size();
        Self::new(name, vec![len], precision, bytes)
    }

    /// Locates an entry by name.
    pub fn find<'a>(items: &'a [Item], name: &str) -> Option<&'a Item> {
        items.iter().find(|item| item.name == name)
    }
}
