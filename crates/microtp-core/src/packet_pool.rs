//! Size-classed packet pooling.
//!
//! Under high packet churn the common allocation sizes are a handful of fixed
//! classes: tiny control packets, floor-MTU segments, and ceiling-MTU
//! segments. The pool keeps one freelist ("slab") per class so those sizes
//! are served from recycled buffers instead of the general allocator.
//!
//! Reuse is LIFO so the most recently freed buffer (most likely still cache
//! resident) is handed out first. Each slab retains at most
//! `retained_limit` buffers; `decay()` sheds one retained buffer per slab
//! per call so idle memory drains gradually when traffic quiets.

use crate::{
    config::Config,
    constants::CONTROL_SEGMENT_SIZE,
    error::{ErrorKind, Result},
};

/// The size class a pooled buffer was allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabClass {
    /// Control-sized allocations (headers and small protocol extensions).
    Control,
    /// Allocations up to the path-MTU floor.
    MtuFloor,
    /// Allocations up to the path-MTU ceiling.
    MtuCeiling,
}

/// An owned, pooled byte buffer.
///
/// The buffer is move-only: ownership transfers from the pool on
/// [`PacketPool::acquire`] and back on [`PacketPool::release`], so
/// double-release and use-after-release are unrepresentable.
#[derive(Debug)]
pub struct PoolBuffer {
    data: Vec<u8>,
    class: SlabClass,
}

impl PoolBuffer {
    fn new(class: SlabClass, allocation_size: usize) -> Self {
        Self { data: Vec::with_capacity(allocation_size), class }
    }

    /// Returns the size class this buffer belongs to.
    pub fn class(&self) -> SlabClass {
        self.class
    }

    /// Returns the buffer contents as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the length of the buffer contents.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the buffer holds no data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends bytes to the buffer.
    ///
    /// Panics if the write would exceed the slab allocation size; callers
    /// size their acquire to the data they intend to write.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(
            self.data.len() + bytes.len() <= self.data.capacity(),
            "write exceeds slab allocation size"
        );
        self.data.extend_from_slice(bytes);
    }

    /// Clears the buffer contents, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl AsRef<[u8]> for PoolBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// A single size-class freelist.
#[derive(Debug)]
struct Slab {
    class: SlabClass,
    allocation_size: usize,
    retained_limit: usize,
    /// LIFO stack of previously freed buffers of exactly `allocation_size`.
    storage: Vec<Vec<u8>>,
}

impl Slab {
    fn new(class: SlabClass, allocation_size: usize, retained_limit: usize) -> Self {
        Self { class, allocation_size, retained_limit, storage: Vec::new() }
    }

    fn acquire(&mut self) -> PoolBuffer {
        match self.storage.pop() {
            Some(data) => PoolBuffer { data, class: self.class },
            None => PoolBuffer::new(self.class, self.allocation_size),
        }
    }

    fn release(&mut self, mut data: Vec<u8>) {
        if self.storage.len() < self.retained_limit {
            data.clear();
            self.storage.push(data);
        } else {
            // Over the retained limit: return memory to the allocator.
            tracing::trace!("Slab {:?} at retained limit; freeing buffer", self.class);
        }
    }

    fn decay(&mut self) {
        // The bottom of the stack is the oldest-retained entry.
        if !self.storage.is_empty() {
            self.storage.remove(0);
        }
    }
}

/// A small set of fixed-size-class allocators serving packet storage.
///
/// Pools are owned per connection group (one per [`Host`]) so no
/// synchronization is needed; see the crate-level concurrency notes.
///
/// [`Host`]: https://docs.rs/microtp-host
#[derive(Debug)]
pub struct PacketPool {
    slabs: [Slab; 3],
    /// Buffers currently acquired and not yet released.
    in_use: usize,
}

impl PacketPool {
    /// Creates a pool with slab sizes derived from the configuration.
    pub fn new(config: &Config) -> Self {
        let retained = config.pool_retained_limit;
        Self {
            slabs: [
                Slab::new(SlabClass::Control, CONTROL_SEGMENT_SIZE, retained),
                Slab::new(SlabClass::MtuFloor, config.mtu_floor as usize, retained),
                Slab::new(SlabClass::MtuCeiling, config.mtu_ceiling as usize, retained),
            ],
            in_use: 0,
        }
    }

    /// Acquires a buffer large enough to hold `size` bytes.
    ///
    /// Selects the smallest slab that fits; pops from that slab's freelist if
    /// non-empty, else allocates fresh at exactly the slab's size. Never
    /// returns a buffer smaller than requested. Requests larger than the
    /// ceiling slab fail with [`ErrorKind::AllocationFailure`].
    pub fn acquire(&mut self, size: usize) -> Result<PoolBuffer> {
        let slab = match self.slabs.iter_mut().find(|s| size <= s.allocation_size) {
            Some(slab) => slab,
            None => {
                return Err(ErrorKind::AllocationFailure {
                    requested: size,
                    largest: self.slabs[2].allocation_size,
                });
            }
        };
        self.in_use += 1;
        Ok(slab.acquire())
    }

    /// Returns a buffer to its slab.
    ///
    /// The slab is determined by the buffer's size class, so a buffer is
    /// always released at the exact size it was allocated. If the slab is at
    /// its retained limit the buffer is freed instead.
    pub fn release(&mut self, buffer: PoolBuffer) {
        let PoolBuffer { data, class } = buffer;
        let slab = self
            .slabs
            .iter_mut()
            .find(|s| s.class == class)
            .expect("every slab class has a slab");
        slab.release(data);
        self.in_use = self.in_use.saturating_sub(1);
    }

    /// Sheds one retained buffer per slab.
    ///
    /// Called once per scheduler tick to bound how long idle memory lingers.
    pub fn decay(&mut self) {
        for slab in &mut self.slabs {
            slab.decay();
        }
    }

    /// Returns the total number of buffers retained for reuse.
    pub fn retained(&self) -> usize {
        self.slabs.iter().map(|s| s.storage.len()).sum()
    }

    /// Returns the number of buffers currently acquired and not released.
    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_selects_smallest_fitting_slab() {
        let mut pool = PacketPool::default();

        let control = pool.acquire(16).unwrap();
        assert_eq!(control.class(), SlabClass::Control);

        let floor = pool.acquire(300).unwrap();
        assert_eq!(floor.class(), SlabClass::MtuFloor);

        let ceiling = pool.acquire(1400).unwrap();
        assert_eq!(ceiling.class(), SlabClass::MtuCeiling);
    }

    #[test]
    fn test_acquire_never_undersized() {
        let mut pool = PacketPool::default();
        let buffer = pool.acquire(600).unwrap();
        assert!(buffer.data.capacity() >= 600);
    }

    #[test]
    fn test_oversized_request_fails() {
        let mut pool = PacketPool::default();
        let result = pool.acquire(usize::MAX);
        assert!(matches!(result, Err(ErrorKind::AllocationFailure { .. })));
    }

    #[test]
    fn test_release_acquire_round_trip_reuses_buffer() {
        let mut pool = PacketPool::default();

        let buffer = pool.acquire(1000).unwrap();
        let ptr = buffer.data.as_ptr();

        pool.release(buffer);
        assert_eq!(pool.retained(), 1);

        // LIFO reuse on an otherwise-idle slab returns the same allocation.
        let again = pool.acquire(1000).unwrap();
        assert_eq!(again.data.as_ptr(), ptr);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_release_clears_contents() {
        let mut pool = PacketPool::default();

        let mut buffer = pool.acquire(100).unwrap();
        buffer.write(b"stale data");
        pool.release(buffer);

        let again = pool.acquire(100).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_retained_limit_bounds_memory() {
        let mut config = Config::default();
        config.pool_retained_limit = 2;
        let mut pool = PacketPool::new(&config);

        for _ in 0..5 {
            let buffer = pool.acquire(100).unwrap();
            pool.release(buffer);
        }
        // Round-trips reuse a single buffer; force several live at once.
        let a = pool.acquire(100).unwrap();
        let b = pool.acquire(100).unwrap();
        let c = pool.acquire(100).unwrap();
        pool.release(a);
        pool.release(b);
        pool.release(c);

        assert_eq!(pool.retained(), 2);
    }

    #[test]
    fn test_decay_sheds_one_per_slab() {
        let mut pool = PacketPool::default();

        let a = pool.acquire(100).unwrap();
        let b = pool.acquire(100).unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.retained(), 2);

        pool.decay();
        assert_eq!(pool.retained(), 1);
        pool.decay();
        assert_eq!(pool.retained(), 0);
        // Decay on empty slabs is a no-op.
        pool.decay();
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_in_use_tracking() {
        let mut pool = PacketPool::default();
        assert_eq!(pool.in_use(), 0);

        let buffer = pool.acquire(100).unwrap();
        assert_eq!(pool.in_use(), 1);

        pool.release(buffer);
        assert_eq!(pool.in_use(), 0);
    }
}
