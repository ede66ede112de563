/*!
The signal block shared between an engine instance and the watchdog, and the allocator that
feeds its heap usage counter.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use rquickjs::allocator::{Allocator, RustAllocator};

type RawMemPtr = *mut u8;

use crate::error::LimitKind;

const NO_ABORT: u8 = 0;
const TIME_ABORT: u8 = 1;
const MEMORY_ABORT: u8 = 2;

/// Flags and counters one engine instance shares with the watchdog thread.
///
/// The engine's interrupt handler polls [`should_interrupt`](EngineSignals::should_interrupt);
/// the watchdog raises it from its own thread.
#[derive(Debug, Default)]
pub(crate) struct EngineSignals {
    interrupt: AtomicBool,
    unwind: AtomicBool,
    abort: AtomicU8,
    heap_used: AtomicUsize,
}

impl EngineSignals {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Polled by the engine at its interrupt checks.
    pub(crate) fn should_interrupt(&self) -> bool {
        self.interrupt.load(Ordering::Acquire) || self.unwind.load(Ordering::Acquire)
    }

    /// Request termination of the running script and set the fatal abort marker.
    ///
    /// The first limit to fire is the one reported.
    pub(crate) fn terminate(&self, kind: LimitKind) {
        let code = match kind {
            LimitKind::Time => TIME_ABORT,
            LimitKind::Memory => MEMORY_ABORT,
        };
        let _ = self
            .abort
            .compare_exchange(NO_ABORT, code, Ordering::AcqRel, Ordering::Acquire);
        self.interrupt.store(true, Ordering::Release);
    }

    /// The fatal abort marker, if the watchdog terminated the current execution.
    pub(crate) fn fatal_abort(&self) -> Option<LimitKind> {
        match self.abort.load(Ordering::Acquire) {
            TIME_ABORT => Some(LimitKind::Time),
            MEMORY_ABORT => Some(LimitKind::Memory),
            _ => None,
        }
    }

    /// Ask the engine to unwind the current execution so a host error can propagate.
    pub(crate) fn request_unwind(&self) {
        self.unwind.store(true, Ordering::Release);
    }

    pub(crate) fn clear_unwind(&self) {
        self.unwind.store(false, Ordering::Release);
    }

    /// Clear every flag, once the outermost execution has returned.
    pub(crate) fn reset(&self) {
        self.abort.store(NO_ABORT, Ordering::Release);
        self.interrupt.store(false, Ordering::Release);
        self.unwind.store(false, Ordering::Release);
    }

    /// Bytes currently allocated by the engine.
    pub(crate) fn heap_used(&self) -> usize {
        self.heap_used.load(Ordering::Relaxed)
    }

    pub(crate) fn record_alloc(&self, bytes: usize) {
        self.heap_used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self, bytes: usize) {
        // saturating, an allocation made before tracking started may be freed later
        let _ = self
            .heap_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

/// An engine allocator that counts live bytes into an [`EngineSignals`] block.
pub(crate) struct CountingAllocator {
    inner: RustAllocator,
    signals: Arc<EngineSignals>,
}

impl CountingAllocator {
    pub(crate) fn new(signals: Arc<EngineSignals>) -> Self {
        Self {
            inner: RustAllocator,
            signals,
        }
    }

    fn track(&self, ptr: RawMemPtr) -> RawMemPtr {
        if !ptr.is_null() {
            // SAFETY: `ptr` was just returned by the inner allocator
            let size = unsafe { RustAllocator::usable_size(ptr) };
            self.signals.record_alloc(size);
        }
        ptr
    }
}

// SAFETY: every call is forwarded to `RustAllocator`, which upholds the allocator contract.
// This wrapper only observes the sizes of the blocks it hands out and takes back.
unsafe impl Allocator for CountingAllocator {
    fn calloc(&mut self, count: usize, size: usize) -> RawMemPtr {
        let ptr = self.inner.calloc(count, size);
        self.track(ptr)
    }

    fn alloc(&mut self, size: usize) -> RawMemPtr {
        let ptr = self.inner.alloc(size);
        self.track(ptr)
    }

    unsafe fn dealloc(&mut self, ptr: RawMemPtr) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: the engine only frees pointers this allocator returned
        unsafe {
            self.signals.record_free(RustAllocator::usable_size(ptr));
            self.inner.dealloc(ptr);
        }
    }

    unsafe fn realloc(&mut self, ptr: RawMemPtr, new_size: usize) -> RawMemPtr {
        // SAFETY: `ptr` is null or was returned by this allocator
        let old_size = if ptr.is_null() {
            0
        } else {
            unsafe { RustAllocator::usable_size(ptr) }
        };
        let new_ptr = unsafe { self.inner.realloc(ptr, new_size) };
        if !new_ptr.is_null() {
            self.signals.record_free(old_size);
            self.track(new_ptr);
        }
        new_ptr
    }

    unsafe fn usable_size(ptr: RawMemPtr) -> usize
    where
        Self: Sized,
    {
        // SAFETY: forwarded to the allocator that produced `ptr`
        unsafe { RustAllocator::usable_size(ptr) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_abort_wins() {
        let signals = EngineSignals::new();
        assert!(!signals.should_interrupt());
        signals.terminate(LimitKind::Memory);
        signals.terminate(LimitKind::Time);
        assert_eq!(signals.fatal_abort(), Some(LimitKind::Memory));
        assert!(signals.should_interrupt());
        signals.reset();
        assert_eq!(signals.fatal_abort(), None);
        assert!(!signals.should_interrupt());
    }

    #[test]
    fn unwind_interrupts_without_abort() {
        let signals = EngineSignals::new();
        signals.request_unwind();
        assert!(signals.should_interrupt());
        assert_eq!(signals.fatal_abort(), None);
        signals.clear_unwind();
        assert!(!signals.should_interrupt());
    }

    #[test]
    fn allocator_counts_live_bytes() {
        let signals = EngineSignals::new();
        let mut alloc = CountingAllocator::new(signals.clone());
        let ptr = alloc.alloc(64);
        assert!(!ptr.is_null());
        assert!(signals.heap_used() >= 64);
        let ptr = unsafe { alloc.realloc(ptr, 4096) };
        assert!(signals.heap_used() >= 4096);
        unsafe { alloc.dealloc(ptr) };
        assert_eq!(signals.heap_used(), 0);
    }

    #[test]
    fn free_saturates() {
        let signals = EngineSignals::new();
        signals.record_alloc(10);
        signals.record_free(20);
        assert_eq!(signals.heap_used(), 0);
    }
}
