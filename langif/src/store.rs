use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{
    Allocator, EmaBuffer, FieldRef, FreeFn, LangifError, MAX_GENERATION, MAX_INDEX,
    Metadata, PayloadView, Result, RustAllocator, free_allocated,
    record::{Body, Ownership, Payload, ValueRecord},
};

#[derive(Debug, Clone, Default)]
pub struct StoreCreateInfo {
    /// upper bound for runtime owned payload bytes
    pub max_bytes: Option<usize>,
    pub initial_slots: Option<usize>,
    /// how captured foreign memory is freed when `capture` gets no explicit function
    pub foreign_free: Option<FreeFn>,
}

#[derive(Debug)]
pub struct StoreSettings {
    pub max_bytes: usize,
    pub initial_slots: usize,
    pub foreign_free: FreeFn,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_bytes: usize::MAX,
            initial_slots: 64,
            foreign_free: free_allocated,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub live_records: usize,
    pub ema_bytes: usize,
    pub slots: usize,
}

struct Slot {
    generation: u32,
    record: Option<Arc<ValueRecord>>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

pub struct StoreShared {
    settings: StoreSettings,
    allocator: Box<dyn Allocator>,
    table: RwLock<Table>,
    bytes_in_use: AtomicUsize,
    live: AtomicUsize,
}

/// Process wide table of value records, shared by every dispatch handle.
#[derive(Clone)]
pub struct ValueStore {
    inner: Arc<StoreShared>,
}

pub(crate) enum Lookup {
    Live(Arc<ValueRecord>),
    Released,
    Unknown,
}

impl ValueStore {
    pub fn new(info: StoreCreateInfo) -> Self {
        Self::with_allocator(info, Box::new(RustAllocator))
    }

    pub fn with_allocator(info: StoreCreateInfo, allocator: Box<dyn Allocator>) -> Self {
        let mut settings = StoreSettings::default();
        info.max_bytes.inspect(|&val| settings.max_bytes = val);
        info.initial_slots.inspect(|&val| settings.initial_slots = val);
        info.foreign_free.inspect(|&val| settings.foreign_free = val);

        let table = Table {
            slots: Vec::with_capacity(settings.initial_slots),
            free: Vec::new(),
        };

        let shared = StoreShared {
            settings,
            allocator,
            table: RwLock::new(table),
            bytes_in_use: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        };
        Self {
            inner: Arc::new(shared),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            live_records: self.inner.live.load(Ordering::Acquire),
            ema_bytes: self.inner.bytes_in_use.load(Ordering::Acquire),
            slots: self.inner.table.read().slots.len(),
        }
    }

    pub(crate) fn lookup(&self, r: FieldRef) -> Lookup {
        let table = self.inner.table.read();
        let Some(slot) = table.slots.get(r.index() as usize) else {
            return Lookup::Unknown;
        };
        // generations only grow, an older one was handed out and released before
        if r.generation() == 0 || r.generation() > slot.generation {
            return Lookup::Unknown;
        }
        if r.generation() < slot.generation {
            return Lookup::Released;
        }
        match &slot.record {
            Some(record) => Lookup::Live(record.clone()),
            None => Lookup::Released,
        }
    }

    /// The record behind a reference that still has at least one owner.
    pub(crate) fn live(&self, r: FieldRef) -> Result<Arc<ValueRecord>> {
        match self.lookup(r) {
            Lookup::Live(record) if record.refcount() > 0 => Ok(record),
            _ => Err(LangifError::InvalidReference(r)),
        }
    }

    pub(crate) fn insert(&self, record: ValueRecord) -> Result<FieldRef> {
        let record = Arc::new(record);
        let mut table = self.inner.table.write();

        let (index, generation) = if let Some(index) = table.free.pop() {
            let slot = &mut table.slots[index as usize];
            // only slots below the last generation are ever put on the free list
            slot.generation += 1;
            slot.record = Some(record);
            (index, slot.generation)
        } else {
            let index = table.slots.len();
            if index > MAX_INDEX as usize {
                drop(table);
                // SAFETY: the record was never published
                unsafe { self.inner.discard(&record) };
                return Err(LangifError::OutOfMemory { requested: 0 });
            }
            if index == table.slots.capacity() {
                log::debug!("value table grows past {index} slots");
            }
            table.slots.push(Slot {
                generation: 1,
                record: Some(record),
            });
            (index as u32, 1)
        };
        drop(table);

        self.inner.live.fetch_add(1, Ordering::AcqRel);
        let r = FieldRef::from_parts(index, generation);
        log::trace!("created {r}");
        Ok(r)
    }

    pub(crate) fn access(&self, r: FieldRef) -> Result<PayloadView> {
        let record = self.live(r)?;
        let view = record.lock_live(r)?.view();
        Ok(view)
    }

    pub(crate) fn with_payload<R>(&self, r: FieldRef, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let record = self.live(r)?;
        let mut body = record.lock_live(r)?;
        Ok(f(body.bytes_mut()))
    }

    pub(crate) fn metadata(&self, r: FieldRef) -> Result<Metadata> {
        Ok(self.live(r)?.metadata())
    }

    pub(crate) fn refcount(&self, r: FieldRef) -> Result<usize> {
        Ok(self.live(r)?.refcount())
    }

    pub(crate) fn retain(&self, r: FieldRef) -> Result<FieldRef> {
        let record = self.live(r)?;
        if !record.retain() {
            return Err(LangifError::InvalidReference(r));
        }
        Ok(r)
    }

    pub(crate) fn release(&self, r: FieldRef) -> Result<()> {
        let record = match self.lookup(r) {
            Lookup::Live(record) => record,
            Lookup::Released => {
                log::warn!("double release of {r}");
                return Err(LangifError::DoubleRelease(r));
            }
            Lookup::Unknown => return Err(LangifError::InvalidReference(r)),
        };

        match record.release() {
            None => {
                log::warn!("double release of {r}");
                Err(LangifError::DoubleRelease(r))
            }
            Some(0) => {
                let body = self.unlink(r, &record);
                log::trace!("destroyed {r}");
                // SAFETY: unlinked, nobody can reach the payload through the table anymore
                unsafe { self.inner.free_body(body) };
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    pub(crate) fn copyref(&self, r: FieldRef) -> Result<FieldRef> {
        let record = self.live(r)?;
        let body = record.lock_live(r)?;
        let size = body.size;
        let copy = self.allocate_buffer(size)?;
        if size > 0 {
            // SAFETY: both regions hold at least `size` bytes and are distinct allocations
            unsafe {
                std::ptr::copy_nonoverlapping(body.view().as_ptr(), copy.as_ptr(), size);
            }
        }
        drop(body);
        self.insert(ValueRecord::new(record.type_tag, Body::ema(size, copy)))
    }

    /// Drop the slot entry of a record whose count reached zero and hand its body back.
    pub(crate) fn unlink(&self, r: FieldRef, record: &Arc<ValueRecord>) -> Body {
        {
            let mut table = self.inner.table.write();
            let Table { slots, free } = &mut *table;
            let slot = &mut slots[r.index() as usize];
            let owned = slot
                .record
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, record));
            if owned && slot.generation == r.generation() {
                slot.record = None;
                if slot.generation < MAX_GENERATION {
                    free.push(r.index());
                } else {
                    log::debug!("retiring slot {} after its last generation", r.index());
                }
            }
        }
        self.inner.live.fetch_sub(1, Ordering::AcqRel);
        record.take_body()
    }

    pub(crate) fn allocate_buffer(&self, capacity: usize) -> Result<EmaBuffer> {
        self.inner.reserve(capacity)?;
        match EmaBuffer::allocate(self.inner.allocator.as_ref(), capacity) {
            Some(buffer) => Ok(buffer),
            None => {
                self.inner.unreserve(capacity);
                Err(LangifError::OutOfMemory {
                    requested: capacity,
                })
            }
        }
    }

    /// # Safety
    /// `buffer` must come from [`Self::allocate_buffer`] and be unreachable.
    pub(crate) unsafe fn free_buffer(&self, buffer: EmaBuffer) {
        // SAFETY: by contract
        unsafe { self.inner.free_buffer(buffer) };
    }
}

impl StoreShared {
    fn reserve(&self, bytes: usize) -> Result<()> {
        let max = self.settings.max_bytes;
        self.bytes_in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= max)
            })
            .map(|_| ())
            .map_err(|_| LangifError::OutOfMemory { requested: bytes })
    }

    fn unreserve(&self, bytes: usize) {
        self.bytes_in_use.fetch_sub(bytes, Ordering::AcqRel);
    }

    unsafe fn free_buffer(&self, buffer: EmaBuffer) {
        let capacity = buffer.capacity();
        // SAFETY: every buffer is allocated from `self.allocator`
        unsafe { buffer.free(self.allocator.as_ref()) };
        self.unreserve(capacity);
    }

    /// Final destruction of a body, per strategy.
    unsafe fn free_body(&self, body: Body) {
        match body.payload {
            // SAFETY: unreachable by contract
            Payload::Ema(buffer) => unsafe { self.free_buffer(buffer) },
            Payload::Lma {
                ownership: Ownership::Wrapped,
                ..
            } => {}
            Payload::Lma {
                data,
                ownership: Ownership::Captured(free),
            } => {
                // SAFETY: the store took ownership in capture
                unsafe { free(data) };
            }
        }
    }

    /// Undo a record that never made it into the table. Captured memory stays
    /// with the caller since the transfer did not happen.
    unsafe fn discard(&self, record: &ValueRecord) {
        if let Payload::Ema(buffer) = record.take_body().payload {
            // SAFETY: by contract
            unsafe { self.free_buffer(buffer) };
        }
    }
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        let table = std::mem::take(self.table.get_mut());
        let mut leaked = 0;
        for record in table.slots.into_iter().filter_map(|slot| slot.record) {
            leaked += 1;
            let body = record.take_body();
            // SAFETY: the store is going away, no handle can reach this anymore
            unsafe { self.free_body(body) };
        }
        if leaked > 0 {
            log::warn!("value store dropped with {leaked} live records");
        }
    }
}

impl fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueStore")
            .field("settings", &self.inner.settings)
            .field("stats", &self.stats())
            .finish()
    }
}
