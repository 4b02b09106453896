use std::{num::NonZeroUsize, ops::Range};

use comms::Item;
use log::{debug, warn};

use crate::{
    OptimErr, Result,
    optimization::{Optimizer, StateLayout},
};

/// Returns the range of elements device `i` out of `n` owns in a buffer of `len` elements.
///
/// Shard sizes differ by at most one element and no shard is empty while `n <= len`.
pub fn shard_range(len: usize, i: usize, n: usize) -> Range<usize> {
    len * i / n..len * (i + 1) / n
}

/// Consolidates a piece of per device state into a single checkpoint entry.
pub trait GatherState {
    /// Retrieves one entry per device through `get` and joins them.
    ///
    /// # Arguments
    /// * `get` - Returns the entry held by the given device index.
    fn gather(&self, get: &mut dyn FnMut(usize) -> Result<Item>) -> Result<Item>;
}

/// Redistributes a consolidated checkpoint entry over devices.
pub trait ScatterState {
    /// Invokes `set` once per device with the bytes that device must apply.
    ///
    /// # Arguments
    /// * `item` - The consolidated entry.
    /// * `set` - Applies a byte range to the given device index.
    fn scatter(&self, item: &Item, set: &mut dyn FnMut(usize, &[u8]) -> Result<()>) -> Result<()>;
}

impl<F> GatherState for F
where
    F: Fn(&mut dyn FnMut(usize) -> Result<Item>) -> Result<Item>,
{
    fn gather(&self, get: &mut dyn FnMut(usize) -> Result<Item>) -> Result<Item> {
        self(get)
    }
}

impl<F> ScatterState for F
where
    F: Fn(&Item, &mut dyn FnMut(usize, &[u8]) -> Result<()>) -> Result<()>,
{
    fn scatter(&self, item: &Item, set: &mut dyn FnMut(usize, &[u8]) -> Result<()>) -> Result<()> {
        self(item, set)
    }
}

/// Devices living in this process, addressed as `0..count`.
///
/// Gathering concatenates every device's entry in order and scattering splits an
/// entry with `shard_range`.
#[derive(Debug, Clone, Copy)]
pub struct LocalDevices {
    count: NonZeroUsize,
}

impl LocalDevices {
    pub fn new(count: NonZeroUsize) -> Self {
        Self { count }
    }

    pub fn count(&self) -> usize {
        self.count.get()
    }
}

impl GatherState for LocalDevices {
    fn gather(&self, get: &mut dyn FnMut(usize) -> Result<Item>) -> Result<Item> {
        let items = (0..self.count()).map(get).collect::<Result<Vec<_>>>()?;
        let name = items[0].name.clone();
        Ok(Item::concat(name, &items)?)
    }
}

impl ScatterState for LocalDevices {
    fn scatter(&self, item: &Item, set: &mut dyn FnMut(usize, &[u8]) -> Result<()>) -> Result<()> {
        let size = item.precision.size();
        let n = self.count();

        for device in 0..n {
            let Range { start, end } = shard_range(item.len(), device, n);
            set(device, &item.bytes[start * size..end * size])?;
        }

        Ok(())
    }
}

/// Builds the checkpoint entries of a set of per device optimizers.
///
/// Entries the first device never allocated are skipped, sharded entries are
/// consolidated through `gather` and replicated ones are taken from the first device.
///
/// # Arguments
/// * `opts` - The optimizers, one per device, in device order.
/// * `gather` - The capability used to consolidate sharded entries.
///
/// # Returns
/// The entries or a `MissingState` error if a device lacks an entry the first one has.
pub fn save<O, G>(opts: &[&O], gather: &G) -> Result<Vec<Item>>
where
    O: Optimizer + ?Sized,
    G: GatherState + ?Sized,
{
    let Some(first) = opts.first() else {
        return Ok(Vec::new());
    };

    let mut items = Vec::new();

    for entry in first.state_entries() {
        let Some(local) = first.get_state(entry.name)? else {
            debug!(name = entry.name; "skipping unallocated optimizer state");
            continue;
        };

        let item = match entry.layout {
            StateLayout::Replicated => local,
            StateLayout::Sharded => gather.gather(&mut |device| {
                let opt = opts.get(device).ok_or_else(|| {
                    OptimErr::MissingState(format!("{} on unknown device {device}", entry.name))
                })?;

                opt.get_state(entry.name)?.ok_or_else(|| {
                    OptimErr::MissingState(format!("{} on device {device}", entry.name))
                })
            })?,
        };

        debug!(name = entry.name, len = item.len(); "saved optimizer state");
        items.push(item);
    }

    Ok(items)
}

/// Restores a set of per device optimizers from checkpoint entries.
///
/// Entries missing from `items` are skipped with a warning, the matching statistics
/// start fresh. Sharded entries are split through `scatter`, replicated ones are
/// handed whole to every device.
///
/// # Arguments
/// * `items` - The checkpoint entries, looked up by name.
/// * `opts` - The optimizers, one per device, in device order.
/// * `scatter` - The capability used to split sharded entries.
///
/// # Returns
/// A `CorruptCheckpoint` error if `scatter` addresses an unknown device or an entry
/// doesn't fit a device's statistics.
pub fn load<O, S>(items: &[Item], opts: &mut [&mut O], scatter: &S) -> Result<()>
where
    O: Optimizer + ?Sized,
    S: ScatterState + ?Sized,
{
    let Some(entries) = opts.first().map(|opt| opt.state_entries()) else {
        return Ok(());
    };
    let count = opts.len();

    for entry in entries {
        let Some(item) = Item::find(items, entry.name) else {
            warn!(name = entry.name; "checkpoint lacks optimizer state, starting it fresh");
            continue;
        };

        match entry.layout {
            StateLayout::Replicated => {
                for opt in opts.iter_mut() {
                    opt.set_state(entry.name, item.precision, &item.bytes)?;
                }
            }
            StateLayout::Sharded => scatter.scatter(item, &mut |device, bytes| {
                let opt = opts.get_mut(device).ok_or_else(|| {
                    OptimErr::CorruptCheckpoint(format!(
                        "{} addresses device {device} but there are {count}",
                        entry.name
                    ))
                })?;

                opt.set_state(entry.name, item.precision, bytes)
            })?,
        }

        debug!(name = entry.name, len = item.len(); "loaded optimizer state");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use comms::{Precision, specs::AdamSpec};

    use super::*;
    use crate::{
        Buffer,
        optimization::{Adagrad, Adam, GradientDescent, Step},
    };

    fn devices(n: usize) -> LocalDevices {
        LocalDevices::new(NonZeroUsize::new(n).unwrap())
    }

    fn trained_adagrad(params: Vec<f32>, grads: Vec<f32>) -> Adagrad {
        let mut adagrad = Adagrad::new(Precision::Float32, 1e-8);
        let mut params = Buffer::from(params);
        adagrad
            .update_params(&mut params, &Buffer::from(grads), &Step::new(0.1))
            .unwrap();
        adagrad
    }

    #[test]
    fn test_shard_range_is_balanced() {
        let ranges: Vec<_> = (0..3).map(|i| shard_range(10, i, 3)).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..10]);

        let ranges: Vec<_> = (0..4).map(|i| shard_range(4, i, 4)).collect();
        assert_eq!(ranges, vec![0..1, 1..2, 2..3, 3..4]);
    }

    #[test]
    fn test_local_devices_scatter_splits_bytes() {
        let item = Item::from_slice("x", Precision::Float32, &[1f32, 2., 3., 4., 5.]).unwrap();
        let mut parts = Vec::new();

        devices(2)
            .scatter(&item, &mut |device, bytes| {
                parts.push((device, bytes.len()));
                Ok(())
            })
            .unwrap();

        assert_eq!(parts, vec![(0, 8), (1, 12)]);
    }

    #[test]
    fn test_save_gathers_sharded_state() {
        let first = trained_adagrad(vec![0., 0.], vec![1., 2.]);
        let second = trained_adagrad(vec![0.], vec![3.]);

        let items = save(&[&first, &second], &devices(2)).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "adagrad_gt");
        assert_eq!(items[0].shape, vec![3]);
        assert_eq!(items[0].bytes, bytemuck::cast_slice::<f32, u8>(&[1., 4., 9.]));
    }

    #[test]
    fn test_save_requires_every_device() {
        let first = trained_adagrad(vec![0.], vec![1.]);
        let second = Adagrad::new(Precision::Float32, 1e-8);

        let res = save(&[&first, &second], &devices(2));
        assert!(matches!(res, Err(OptimErr::MissingState(_))));
    }

    #[test]
    fn test_stateless_and_unallocated_save_nothing() {
        assert!(save(&[&GradientDescent::new()], &devices(1)).unwrap().is_empty());

        let adam = Adam::new(Precision::Float32, AdamSpec::default());
        let names: Vec<_> = save(&[&adam], &devices(1))
            .unwrap()
            .into_iter()
            .map(|item| item.name)
            .collect();
        assert_eq!(names, vec!["adam_denoms"]);
    }

    #[test]
    fn test_load_scatters_onto_other_device_count() {
        let saved = trained_adagrad(vec![0.; 4], vec![1., 2., 3., 4.]);
        let items = save(&[&saved], &devices(1)).unwrap();

        let mut first = Adagrad::new(Precision::Float32, 1e-8);
        let mut second = Adagrad::new(Precision::Float32, 1e-8);
        load(&items, &mut [&mut first, &mut second], &devices(2)).unwrap();

        assert_eq!(first.accumulator(), Some(&Buffer::from(vec![1f32, 4.])));
        assert_eq!(second.accumulator(), Some(&Buffer::from(vec![9f32, 16.])));
    }

    #[test]
    fn test_load_replicates_and_skips_missing() {
        let denoms = Item::from_slice("adam_denoms", Precision::Float64, &[0.1f64, 0.001]);
        let items = vec![denoms.unwrap()];

        let mut first = Adam::new(Precision::Float32, AdamSpec::default());
        let mut second = Adam::new(Precision::Float32, AdamSpec::default());
        load(&items, &mut [&mut first, &mut second], &devices(2)).unwrap();

        assert_eq!(first.denominators(), (0.1, 0.001));
        assert_eq!(second.denominators(), (0.1, 0.001));
        assert!(first.moments().is_none());
    }

    #[test]
    fn test_load_rejects_unknown_devices() {
        let items = save(&[&trained_adagrad(vec![0.; 2], vec![1., 1.])], &devices(1)).unwrap();
        let mut only = Adagrad::new(Precision::Float32, 1e-8);

        let res = load(&items, &mut [&mut only], &devices(2));
        assert!(matches!(res, Err(OptimErr::CorruptCheckpoint(_))));
    }

    #[test]
    fn test_closures_are_capabilities() {
        let adagrad = trained_adagrad(vec![0.], vec![2.]);
        let gather = |get: &mut dyn FnMut(usize) -> Result<Item>| get(0);

        let items = save(&[&adagrad], &gather).unwrap();
        assert_eq!(items[0].bytes, bytemuck::cast_slice::<f32, u8>(&[4.]));
    }
}
