//! 分块碰撞分配器
//!
//! 代码缓存按块映射可执行内存，并从当前块中切出固定大小、不可移动的区域。
//! 区域不会单独释放；当分配器及其切出的所有区域都被丢弃后，整块才会解除映射。

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::executable_memory::ExecutableMemory;
use crate::config::{Config, ConfigError, Constraints};
use crate::error::CodeCacheError;

/// Code cache sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeCacheConfig {
    /// Upper bound on mapped bytes across all chunks.
    pub capacity: usize,
    /// Size of each mapping; oversized requests get a chunk of their own.
    pub chunk_size: usize,
    /// Alignment of every region start, a power of two.
    pub alignment: usize,
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Config for CodeCacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut c = Constraints::new("CodeCacheConfig");
        c.at_least("capacity", self.capacity, 1)
            .at_least("chunk_size", self.chunk_size, 64)
            .ordered(("chunk_size", self.chunk_size), ("capacity", self.capacity))
            .check(
                self.alignment.is_power_of_two() && self.alignment <= 4096,
                format!(
                    "alignment = {} must be a power of two no larger than 4096",
                    self.alignment
                ),
            );
        c.finish()
    }

    fn defaults() -> Self {
        Self {
            capacity: 48 * 1024 * 1024,
            chunk_size: 64 * 1024,
            alignment: 8,
        }
    }
}

/// Point-in-time view of the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub capacity: usize,
    /// Bytes mapped in chunks so far.
    pub reserved: usize,
    /// Bytes handed out as regions, including alignment padding.
    pub allocated: usize,
    pub chunks: usize,
    pub regions: u64,
    pub failed_allocations: u64,
}

/// A region of executable memory owned by one piece of code (a stub or a
/// compiled method). Regions never overlap and never move.
#[derive(Debug)]
pub struct CodeRegion {
    chunk: Arc<ExecutableMemory>,
    offset: usize,
    len: usize,
}

impl CodeRegion {
    pub fn begin(&self) -> usize {
        self.chunk.base() + self.offset
    }

    pub fn end(&self) -> usize {
        self.begin() + self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin() && addr < self.end()
    }

    /// Copies code into the region. Requires `&mut self`: the region is the
    /// only handle to its bytes.
    pub fn write(&mut self, code: &[u8]) -> Result<(), CodeCacheError> {
        if code.len() > self.len {
            return Err(CodeCacheError::RegionOverflow {
                len: code.len(),
                capacity: self.len,
            });
        }
        // SAFETY: the allocator never hands out overlapping regions and we
        // hold the unique handle to this one.
        unsafe { self.chunk.write(self.offset, code) };
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: writes require `&mut self`, so none can be in flight.
        unsafe { self.chunk.slice(self.offset, self.len) }
    }
}

struct AllocatorState {
    chunks: Vec<Arc<ExecutableMemory>>,
    /// Bump pointer inside the last chunk.
    cursor: usize,
    reserved: usize,
    allocated: usize,
    regions: u64,
    failed_allocations: u64,
}

/// The shared, lock-protected executable memory pool.
pub struct ExecutableCodeAllocator {
    config: CodeCacheConfig,
    state: Mutex<AllocatorState>,
}

impl ExecutableCodeAllocator {
    pub fn new(config: CodeCacheConfig) -> Result<Self, CodeCacheError> {
        config
            .validate()
            .map_err(|e| CodeCacheError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            config,
            state: Mutex::new(AllocatorState {
                chunks: Vec::new(),
                cursor: 0,
                reserved: 0,
                allocated: 0,
                regions: 0,
                failed_allocations: 0,
            }),
        })
    }

    pub fn config(&self) -> &CodeCacheConfig {
        &self.config
    }

    /// Allocates `size` bytes (rounded up to the configured alignment).
    ///
    /// Exhaustion is reported as [`CodeCacheError::Exhausted`]; callers are
    /// expected to degrade (interpreter dispatch, deferred compilation)
    /// rather than fail.
    pub fn allocate(&self, size: usize) -> Result<CodeRegion, CodeCacheError> {
        let mut state = self.state.lock();
        let Some(size) = align_up(size.max(1), self.config.alignment) else {
            return Err(self.exhausted(&mut state, size));
        };

        let fits_current = state.chunks.last().is_some_and(|chunk| {
            state
                .cursor
                .checked_add(size)
                .is_some_and(|end| end <= chunk.len())
        });

        if !fits_current {
            let chunk_len = align_up(size.max(self.config.chunk_size), self.config.alignment)
                .filter(|&len| {
                    state
                        .reserved
                        .checked_add(len)
                        .is_some_and(|end| end <= self.config.capacity)
                });
            let Some(chunk_len) = chunk_len else {
                return Err(self.exhausted(&mut state, size));
            };
            let chunk = ExecutableMemory::new(chunk_len).ok_or(CodeCacheError::MapFailed {
                size: chunk_len,
            })?;
            tracing::debug!(
                target: "code_cache",
                base = format_args!("{:#x}", chunk.base()),
                len = chunk_len,
                "mapped code chunk"
            );
            // Tail of the previous chunk is abandoned.
            state.allocated += state
                .chunks
                .last()
                .map_or(0, |last| last.len() - state.cursor);
            state.reserved += chunk_len;
            state.chunks.push(Arc::new(chunk));
            state.cursor = 0;
        }

        let offset = state.cursor;
        state.cursor += size;
        state.allocated += size;
        state.regions += 1;
        let chunk = match state.chunks.last() {
            Some(chunk) => Arc::clone(chunk),
            None => unreachable!("a chunk was mapped above"),
        };

        Ok(CodeRegion {
            chunk,
            offset,
            len: size,
        })
    }

    fn exhausted(&self, state: &mut AllocatorState, requested: usize) -> CodeCacheError {
        state.failed_allocations += 1;
        let available = self.config.capacity.saturating_sub(state.reserved);
        tracing::warn!(
            target: "code_cache",
            requested,
            available,
            capacity = self.config.capacity,
            "code cache is full"
        );
        CodeCacheError::Exhausted {
            requested,
            available,
            capacity: self.config.capacity,
        }
    }

    /// Bytes still available to future allocations. Counts unreserved
    /// capacity plus the unused tail of the current chunk.
    pub fn unallocated(&self) -> usize {
        let state = self.state.lock();
        let tail = state
            .chunks
            .last()
            .map_or(0, |chunk| chunk.len() - state.cursor);
        self.config.capacity - state.reserved + tail
    }

    /// `capacity / unallocated`: 1.0 when empty, growing without bound as the
    /// cache fills up.
    pub fn reverse_free_ratio(&self) -> f64 {
        let unallocated = self.unallocated().max(1);
        self.config.capacity as f64 / unallocated as f64
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.state.lock().chunks.iter().any(|c| c.contains(addr))
    }

    pub fn stats(&self) -> CodeCacheStats {
        let state = self.state.lock();
        CodeCacheStats {
            capacity: self.config.capacity,
            reserved: state.reserved,
            allocated: state.allocated,
            chunks: state.chunks.len(),
            regions: state.regions,
            failed_allocations: state.failed_allocations,
        }
    }
}

impl std::fmt::Debug for ExecutableCodeAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableCodeAllocator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Occupancy signal consumed by the compilation policy.
pub trait CodeCacheOccupancy: Send + Sync {
    fn reverse_free_ratio(&self) -> f64;
}

impl CodeCacheOccupancy for ExecutableCodeAllocator {
    fn reverse_free_ratio(&self) -> f64 {
        ExecutableCodeAllocator::reverse_free_ratio(self)
    }
}

fn align_up(value: usize, alignment: usize) -> Option<usize> {
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}
