//! Fixed sinusoidal positional encoding.
//!
//! Column `j` of row `pos` holds `sin(pos / 10000^(2*(j/2)/d_hid))` for even
//! `j` and the matching cosine for odd `j`. Tables are built in `f32` and kept
//! in a small process-wide LRU keyed by geometry and device, so encoders with
//! the same shape share one buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use candle_core::{bail, DType, Device, DeviceLocation, Result, Tensor};

const TABLE_CACHE_CAPACITY: usize = 16;
const BASE: f64 = 10_000.0;

static TABLE_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static TABLE_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Return the current `(hits, misses)` counters for the shared table cache.
pub fn table_cache_counters() -> (usize, usize) {
    (
        TABLE_CACHE_HITS.load(Ordering::Relaxed),
        TABLE_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

/// Reset the shared table cache counters.
pub fn reset_table_cache_stats() {
    TABLE_CACHE_HITS.store(0, Ordering::Relaxed);
    TABLE_CACHE_MISSES.store(0, Ordering::Relaxed);
}

struct TableCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, Tensor>,
}

impl TableCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key_owned = self.order.remove(pos);
            self.order.push(key_owned);
        }
    }

    fn get(&mut self, key: &str) -> Option<Tensor> {
        let table = self.entries.get(key)?.clone();
        self.touch(key);
        Some(table)
    }

    fn insert(&mut self, key: String, table: Tensor) {
        if self.entries.insert(key.clone(), table).is_some() {
            self.touch(&key);
            return;
        }
        if self.entries.len() > self.capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
        self.order.push(key);
    }
}

fn global_table_cache() -> &'static Mutex<TableCache> {
    static CACHE: OnceLock<Mutex<TableCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(TableCache::new(TABLE_CACHE_CAPACITY)))
}

/// Stable cache key for a table geometry on a device.
pub fn table_cache_key(n_position: usize, d_hid: usize, device: &Device) -> String {
    let device_id = match device.location() {
        DeviceLocation::Cpu => "cpu".to_owned(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
    };
    format!("pos={n_position};hid={d_hid};dev={device_id}")
}

/// Raw row-major `[n_position, d_hid]` table.
pub fn sinusoid_table(n_position: usize, d_hid: usize) -> Vec<f32> {
    let inv_freqs = (0..d_hid)
        .map(|j| BASE.powf(-((2 * (j / 2)) as f64) / d_hid as f64))
        .collect::<Vec<_>>();
    let mut data = Vec::with_capacity(n_position * d_hid);
    for pos in 0..n_position {
        for (j, inv_freq) in inv_freqs.iter().enumerate() {
            let angle = pos as f64 * inv_freq;
            let value = if j % 2 == 0 { angle.sin() } else { angle.cos() };
            data.push(value as f32);
        }
    }
    data
}

/// Retrieve (or lazily build) the `f32` table `[n_position, d_hid]` on `device`.
pub fn get_sinusoid_table(n_position: usize, d_hid: usize, device: &Device) -> Result<Tensor> {
    if n_position == 0 || d_hid == 0 {
        bail!("sinusoid table needs non-zero n_position and d_hid, got {n_position}x{d_hid}");
    }

    let key = table_cache_key(n_position, d_hid, device);
    let cache = global_table_cache();
    {
        let mut guard = match cache.lock() {
            Ok(guard) => guard,
            Err(_) => bail!("sinusoid table cache mutex poisoned"),
        };
        if let Some(table) = guard.get(&key) {
            TABLE_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
            log::debug!("sinusoid table cache hit: {key}");
            return Ok(table);
        }
        TABLE_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
        log::debug!("sinusoid table cache miss: {key}");
    }

    let table = Tensor::from_vec(sinusoid_table(n_position, d_hid), (n_position, d_hid), device)?;

    let mut guard = match cache.lock() {
        Ok(guard) => guard,
        Err(_) => bail!("sinusoid table cache mutex poisoned"),
    };
    if let Some(existing) = guard.get(&key) {
        return Ok(existing);
    }
    guard.insert(key, table.clone());
    Ok(table)
}

/// Adds the sinusoidal table to `[batch, seq, d_hid]` inputs.
///
/// The table is a fixed buffer, never a trainable parameter.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    d_hid: usize,
    n_position: usize,
    table: Tensor,
}

impl PositionalEncoding {
    pub fn new(d_hid: usize, n_position: usize, device: &Device) -> Result<Self> {
        let table = get_sinusoid_table(n_position, d_hid, device)?.unsqueeze(0)?;
        Ok(Self {
            d_hid,
            n_position,
            table,
        })
    }

    pub fn d_hid(&self) -> usize {
        self.d_hid
    }

    pub fn n_position(&self) -> usize {
        self.n_position
    }

    /// The `[1, n_position, d_hid]` buffer.
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, seq_len, hidden) = x.dims3()?;
        if hidden != self.d_hid {
            bail!(
                "positional encoding expects hidden size {}, got {hidden}",
                self.d_hid
            );
        }
        if seq_len > self.n_position {
            bail!(
                "sequence length {seq_len} exceeds the {} encoded positions",
                self.n_position
            );
        }
        let rows = self.table.narrow(1, 0, seq_len)?;
        let rows = if x.dtype() == DType::F32 {
            rows
        } else {
            rows.to_dtype(x.dtype())?
        };
        x.broadcast_add(&rows)
    }
}
