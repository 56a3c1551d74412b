//! 分派桩缓存
//!
//! 以 (kind, slot index) 为键的定长哈希表。每个桶是单链表，最新的桩在表头。
//! 在 [`DispatchStubCache::teardown`] 之前桩不会被移除。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use vm_core::config::{Config, ConfigError};
use vm_core::{CodeEventSink, EventCollector, ExecutableCodeAllocator};

use crate::config::{DedupPolicy, StubGeneratorConfig};
use crate::error::StubError;
use crate::generator::{GeneratorStats, StubGenerator};
use crate::layout::RECEIVER_REG;
use crate::stub::{DispatchStub, StubFault, StubKind};

/// Number of buckets; a power of two.
pub const TABLE_SIZE: usize = 256;

/// Bucket for `(kind, index)`. The two kinds share the table; vtable hashes
/// are complemented to keep the namespaces apart.
pub fn bucket_index(kind: StubKind, index: u32) -> usize {
    let receiver_location = RECEIVER_REG.encoding() as u32;
    let hash = ((index << 2) ^ receiver_location).wrapping_add(index);
    let hash = match kind {
        StubKind::Vtable => !hash,
        StubKind::Itable => hash,
    };
    hash as usize & (TABLE_SIZE - 1)
}

struct Entry {
    stub: Arc<DispatchStub>,
    next: Option<Box<Entry>>,
}

struct Table {
    buckets: Vec<Option<Box<Entry>>>,
    len: usize,
}

impl Table {
    fn new() -> Self {
        Self {
            buckets: (0..TABLE_SIZE).map(|_| None).collect(),
            len: 0,
        }
    }

    fn lookup(&self, kind: StubKind, index: u32) -> Option<Arc<DispatchStub>> {
        let mut cursor = self.buckets[bucket_index(kind, index)].as_deref();
        while let Some(entry) = cursor {
            if entry.stub.matches(kind, index) {
                return Some(Arc::clone(&entry.stub));
            }
            cursor = entry.next.as_deref();
        }
        None
    }

    fn insert(&mut self, stub: Arc<DispatchStub>) {
        let bucket = &mut self.buckets[bucket_index(stub.kind(), stub.index())];
        let next = bucket.take();
        *bucket = Some(Box::new(Entry { stub, next }));
        self.len += 1;
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<DispatchStub>> {
        self.buckets.iter().flat_map(|head| {
            std::iter::successors(head.as_deref(), |entry| entry.next.as_deref())
                .map(|entry| &entry.stub)
        })
    }

    fn clear(&mut self) {
        for head in &mut self.buckets {
            // Unlink iteratively; long chains would overflow the stack on drop.
            let mut cursor = head.take();
            while let Some(mut entry) = cursor {
                cursor = entry.next.take();
            }
        }
        self.len = 0;
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StubCacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub generated: u64,
    /// Stubs generated by a losing racer under [`DedupPolicy::Relaxed`].
    pub duplicates: u64,
    /// Misses that could not be served (code cache full).
    pub failures: u64,
    pub entries: usize,
    pub generator: GeneratorStats,
}

#[derive(Debug, Default)]
struct CacheCounters {
    lookups: AtomicU64,
    hits: AtomicU64,
    generated: AtomicU64,
    duplicates: AtomicU64,
    failures: AtomicU64,
}

/// Process-wide dispatch stub table.
///
/// Constructed once before any mutator runs and handed to consumers by
/// reference; several independent instances can coexist.
pub struct DispatchStubCache {
    generator: StubGenerator,
    table: Mutex<Table>,
    events: Arc<CodeEventSink>,
    counters: CacheCounters,
}

impl DispatchStubCache {
    pub fn new(
        config: StubGeneratorConfig,
        code_cache: Arc<ExecutableCodeAllocator>,
        events: Arc<CodeEventSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        tracing::debug!(
            target: "dispatch::stubs",
            dedup = ?config.dedup,
            count_calls = config.instrumentation.count_calls,
            debug_checks = config.instrumentation.debug_checks,
            "initializing dispatch stub cache"
        );
        Ok(Self {
            generator: StubGenerator::new(config, code_cache),
            table: Mutex::new(Table::new()),
            events,
            counters: CacheCounters::default(),
        })
    }

    pub fn generator(&self) -> &StubGenerator {
        &self.generator
    }

    /// Entry point of the stub for `(kind, index)`, generating it on a miss.
    ///
    /// `None` means no stub could be produced (code cache exhausted); the
    /// caller keeps using slow dispatch and may retry later. The table is
    /// left untouched in that case.
    pub fn find_or_create(&self, kind: StubKind, index: u32) -> Option<usize> {
        self.find_or_create_stub(kind, index)
            .map(|stub| stub.entry_point())
    }

    pub fn find_or_create_stub(&self, kind: StubKind, index: u32) -> Option<Arc<DispatchStub>> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        match self.generator.config().dedup {
            DedupPolicy::Strict => self.find_or_create_strict(kind, index),
            DedupPolicy::Relaxed => self.find_or_create_relaxed(kind, index),
        }
    }

    fn find_or_create_strict(&self, kind: StubKind, index: u32) -> Option<Arc<DispatchStub>> {
        let mut events = EventCollector::new(&self.events);
        let mut table = self.table.lock();
        if let Some(stub) = table.lookup(kind, index) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(stub);
        }
        let stub = Arc::new(self.generate(kind, index)?);
        table.insert(Arc::clone(&stub));
        events.dynamic_code_generated(kind.code_name(), stub.entry_point(), stub.code_end());
        drop(table);
        events.flush();
        Some(stub)
    }

    fn find_or_create_relaxed(&self, kind: StubKind, index: u32) -> Option<Arc<DispatchStub>> {
        if let Some(stub) = self.table.lock().lookup(kind, index) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(stub);
        }

        let generated = Arc::new(self.generate(kind, index)?);
        let mut events = EventCollector::new(&self.events);
        events.dynamic_code_generated(
            kind.code_name(),
            generated.entry_point(),
            generated.code_end(),
        );

        let mut table = self.table.lock();
        let stub = match table.lookup(kind, index) {
            Some(winner) => {
                // Lost the race; the generated copy stays in the code cache
                // unused.
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(target: "dispatch::stubs", %kind, index, "duplicate stub discarded");
                winner
            }
            None => {
                table.insert(Arc::clone(&generated));
                generated
            }
        };
        drop(table);
        events.flush();
        Some(stub)
    }

    fn generate(&self, kind: StubKind, index: u32) -> Option<DispatchStub> {
        match self.generator.generate(kind, index) {
            Ok(stub) => {
                self.counters.generated.fetch_add(1, Ordering::Relaxed);
                Some(stub)
            }
            Err(err @ StubError::CodeCacheFull(_)) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: "dispatch::stubs", %kind, index, error = %err, "dispatch stub not generated");
                None
            }
            Err(err @ StubError::IndexOutOfRange { .. }) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: "dispatch::stubs", error = %err, "dispatch stub not generated");
                None
            }
        }
    }

    /// Existing stub for `(kind, index)`, without generating.
    pub fn lookup(&self, kind: StubKind, index: u32) -> Option<Arc<DispatchStub>> {
        self.table.lock().lookup(kind, index)
    }

    /// Stub whose code contains `pc`.
    pub fn stub_containing(&self, pc: usize) -> Option<Arc<DispatchStub>> {
        self.table
            .lock()
            .iter()
            .find(|stub| stub.contains(pc))
            .cloned()
    }

    /// Maps a faulting pc to the language-level error it implies, if the pc
    /// is one of the recorded fault offsets of some stub.
    pub fn classify_fault(&self, pc: usize) -> Option<StubFault> {
        self.stub_containing(pc)
            .and_then(|stub| stub.classify_fault(pc))
    }

    pub fn len(&self) -> usize {
        self.table.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StubCacheStats {
        StubCacheStats {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            generated: self.counters.generated.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            entries: self.len(),
            generator: self.generator.stats(),
        }
    }

    /// Drops every stub. Callers must guarantee that no thread still
    /// executes or will branch to any of them; the memory itself is returned
    /// with the code cache.
    pub fn teardown(&self) {
        let mut table = self.table.lock();
        let released = table.len;
        table.clear();
        tracing::debug!(target: "dispatch::stubs", released, "dispatch stub cache torn down");
    }
}

impl std::fmt::Debug for DispatchStubCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchStubCache")
            .field("generator", &self.generator)
            .field("stats", &self.stats())
            .finish()
    }
}
