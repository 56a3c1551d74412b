//! 代码生命周期通知
//!
//! 生产者（桩缓存、编译代理）往往在持有内部锁时得知新代码的产生。监听器是任意的
//! 外部代码，因此投递绝不在这类锁内进行：生产者在加锁区内把事件记录到
//! [`EventCollector`]，收集器在锁释放后、被刷新或丢弃时再统一投递。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

/// Listener subscription handle
pub type SubscriptionId = u64;

/// 代码事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeEvent {
    /// A runtime stub was generated into `[begin, end)`.
    DynamicCodeGenerated {
        name: String,
        begin: usize,
        end: usize,
    },
    /// Compiled code for a method was installed.
    CompiledMethodLoad {
        method: String,
        level: i8,
        begin: usize,
        end: usize,
    },
    /// Compiled code for a method was released.
    CompiledMethodUnload { method: String, begin: usize },
}

/// Observer for code lifecycle events. All callbacks are fire-and-forget.
pub trait CodeEventListener: Send + Sync {
    fn on_dynamic_code_generated(&self, name: &str, begin: usize, end: usize);

    fn on_compiled_method_load(&self, _method: &str, _level: i8, _begin: usize, _end: usize) {}

    fn on_compiled_method_unload(&self, _method: &str, _begin: usize) {}
}

/// Registry of listeners.
pub struct CodeEventSink {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn CodeEventListener>)>>,
    next_id: AtomicU64,
}

impl CodeEventSink {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn CodeEventListener>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    /// Cheap check so producers can skip building event payloads.
    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    /// Delivers immediately. Must not be called with producer locks held; use
    /// an [`EventCollector`] in that case.
    pub fn post(&self, event: &CodeEvent) {
        // Snapshot so a listener may subscribe/unsubscribe re-entrantly.
        let listeners: Vec<Arc<dyn CodeEventListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            match event {
                CodeEvent::DynamicCodeGenerated { name, begin, end } => {
                    listener.on_dynamic_code_generated(name, *begin, *end)
                }
                CodeEvent::CompiledMethodLoad {
                    method,
                    level,
                    begin,
                    end,
                } => listener.on_compiled_method_load(method, *level, *begin, *end),
                CodeEvent::CompiledMethodUnload { method, begin } => {
                    listener.on_compiled_method_unload(method, *begin)
                }
            }
        }
    }

    pub fn collector(&self) -> EventCollector<'_> {
        EventCollector::new(self)
    }
}

impl Default for CodeEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeEventSink")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

/// Buffers events recorded inside a locked section; delivers them on
/// [`flush`](EventCollector::flush) or drop.
pub struct EventCollector<'a> {
    sink: &'a CodeEventSink,
    enabled: bool,
    pending: Vec<CodeEvent>,
}

impl<'a> EventCollector<'a> {
    pub fn new(sink: &'a CodeEventSink) -> Self {
        Self {
            enabled: sink.has_listeners(),
            sink,
            pending: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, event: CodeEvent) {
        if self.enabled {
            self.pending.push(event);
        }
    }

    pub fn dynamic_code_generated(&mut self, name: &str, begin: usize, end: usize) {
        if self.enabled {
            self.pending.push(CodeEvent::DynamicCodeGenerated {
                name: name.to_string(),
                begin,
                end,
            });
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn flush(&mut self) {
        for event in std::mem::take(&mut self.pending) {
            self.sink.post(&event);
        }
    }
}

impl Drop for EventCollector<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Listener that stores every event, in order.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<CodeEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CodeEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl CodeEventListener for RecordingListener {
    fn on_dynamic_code_generated(&self, name: &str, begin: usize, end: usize) {
        self.events.lock().push(CodeEvent::DynamicCodeGenerated {
            name: name.to_string(),
            begin,
            end,
        });
    }

    fn on_compiled_method_load(&self, method: &str, level: i8, begin: usize, end: usize) {
        self.events.lock().push(CodeEvent::CompiledMethodLoad {
            method: method.to_string(),
            level,
            begin,
            end,
        });
    }

    fn on_compiled_method_unload(&self, method: &str, begin: usize) {
        self.events.lock().push(CodeEvent::CompiledMethodUnload {
            method: method.to_string(),
            begin,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_defers_until_drop() {
        let sink = CodeEventSink::new();
        let recorder = RecordingListener::new();
        sink.subscribe(recorder.clone());

        let lock = Mutex::new(());
        {
            let mut collector = sink.collector();
            let _guard = lock.lock();
            collector.dynamic_code_generated("vtable stub", 0x1000, 0x1010);
            assert_eq!(collector.pending(), 1);
            assert!(recorder.is_empty());
        }
        assert_eq!(
            recorder.events(),
            vec![CodeEvent::DynamicCodeGenerated {
                name: "vtable stub".to_string(),
                begin: 0x1000,
                end: 0x1010,
            }]
        );
    }

    #[test]
    fn test_collector_is_inert_without_listeners() {
        let sink = CodeEventSink::new();
        let mut collector = sink.collector();
        assert!(!collector.is_enabled());
        collector.dynamic_code_generated("itable stub", 0, 8);
        assert_eq!(collector.pending(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let sink = CodeEventSink::new();
        let recorder = RecordingListener::new();
        let id = sink.subscribe(recorder.clone());
        assert!(sink.unsubscribe(id));
        assert!(!sink.unsubscribe(id));
        sink.post(&CodeEvent::CompiledMethodUnload {
            method: "m".to_string(),
            begin: 0,
        });
        assert!(recorder.is_empty());
    }
}
