//! Linear allocator for per-tile scratch memory
//!
//! Tile builds need short-lived byte buffers (decompressed layers, serialized layers
//! before compression). The allocator hands them out from one preallocated buffer and
//! throws everything away on [`LinearAllocator::reset`]. Requests that do not fit are
//! served from the heap, and the next reset grows the main buffer so that the steady
//! state needs no extra allocation at all.

use navmesh_common::{next_power_of_two, Error, Result};

/// Configuration of a [`LinearAllocator`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct LinearAllocatorConfig {
    /// Size of the preallocated buffer in bytes
    pub initial_capacity: usize,
    /// Factor applied to the peak usage when the buffer has to grow
    pub growth_factor: f32,
}

impl Default for LinearAllocatorConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 32 * 1024,
            growth_factor: 1.5,
        }
    }
}

impl LinearAllocatorConfig {
    /// Validates the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.initial_capacity == 0 {
            return Err("Allocator capacity must be positive".to_string());
        }
        if self.growth_factor.is_nan() || self.growth_factor < 1.0 {
            return Err("Allocator growth factor must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Handle to memory handed out by a [`LinearAllocator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    location: Location,
    size: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Buffer(usize),
    Overflow(usize),
}

impl Allocation {
    /// Size of the allocation in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the allocation was served from the heap instead of the main buffer
    pub fn is_overflow(&self) -> bool {
        matches!(self.location, Location::Overflow(_))
    }
}

/// Bump allocator whose allocations live until the next reset
#[derive(Debug)]
pub struct LinearAllocator {
    config: LinearAllocatorConfig,
    buffer: Vec<u8>,
    top: usize,
    current_allocation: usize,
    max_allocation: usize,
    overflow: Vec<Vec<u8>>,
    overflow_count: usize,
    generation: u32,
}

impl Default for LinearAllocator {
    fn default() -> Self {
        Self::new(LinearAllocatorConfig::default())
    }
}

impl LinearAllocator {
    /// Creates an allocator with `config.initial_capacity` bytes preallocated
    pub fn new(config: LinearAllocatorConfig) -> Self {
        Self {
            config,
            buffer: vec![0; config.initial_capacity],
            top: 0,
            current_allocation: 0,
            max_allocation: 0,
            overflow: Vec::new(),
            overflow_count: 0,
            generation: 0,
        }
    }

    /// Allocates `size` zeroed bytes. Never fails.
    pub fn alloc(&mut self, size: usize) -> Allocation {
        self.current_allocation += size;

        let location = if self.top + size <= self.buffer.len() {
            let offset = self.top;
            self.buffer[offset..offset + size].fill(0);
            self.top += size;
            Location::Buffer(offset)
        } else {
            self.overflow.push(vec![0; size]);
            self.overflow_count += 1;
            Location::Overflow(self.overflow.len() - 1)
        };

        Allocation {
            location,
            size,
            generation: self.generation,
        }
    }

    /// Frees an allocation. Memory is only reclaimed by [`LinearAllocator::reset`].
    pub fn free(&mut self, _allocation: Allocation) {}

    /// Releases every allocation of the current pass.
    ///
    /// When anything overflowed during the pass the main buffer grows to the next
    /// power of two of the peak usage times the growth factor.
    pub fn reset(&mut self) {
        self.max_allocation = self.max_allocation.max(self.current_allocation);

        if !self.overflow.is_empty() {
            let wanted = (self.max_allocation as f64 * self.config.growth_factor as f64) as usize;
            let capacity = next_power_of_two(wanted.min(u32::MAX as usize) as u32) as usize;
            if capacity > self.buffer.len() {
                log::debug!(
                    "Growing tile build allocator from {} to {} bytes",
                    self.buffer.len(),
                    capacity
                );
                self.buffer = vec![0; capacity];
            }
            self.overflow.clear();
        }

        self.top = 0;
        self.current_allocation = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Read access to an allocation of the current pass
    pub fn slice(&self, allocation: &Allocation) -> Result<&[u8]> {
        self.check(allocation)?;
        Ok(match allocation.location {
            Location::Buffer(offset) => &self.buffer[offset..offset + allocation.size],
            Location::Overflow(index) => &self.overflow[index],
        })
    }

    /// Write access to an allocation of the current pass
    pub fn slice_mut(&mut self, allocation: &Allocation) -> Result<&mut [u8]> {
        self.check(allocation)?;
        Ok(match allocation.location {
            Location::Buffer(offset) => &mut self.buffer[offset..offset + allocation.size],
            Location::Overflow(index) => &mut self.overflow[index],
        })
    }

    fn check(&self, allocation: &Allocation) -> Result<()> {
        if allocation.generation != self.generation {
            return Err(Error::TileCache(
                "allocation used after allocator reset".to_string(),
            ));
        }
        Ok(())
    }

    pub fn config(&self) -> &LinearAllocatorConfig {
        &self.config
    }

    /// Size of the preallocated buffer
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Peak bytes allocated in a single pass, as of the last reset
    pub fn max_allocation(&self) -> usize {
        self.max_allocation
    }

    /// Bytes allocated since the last reset
    pub fn current_allocation(&self) -> usize {
        self.current_allocation
    }

    /// Total number of allocations served from the heap
    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }
}
