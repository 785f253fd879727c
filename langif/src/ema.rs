//! Runtime owned values: the store allocates, grows and frees the payload.
use crate::{
    FieldRef, LangifError, Result, Strategy, TypeTag, ValueStore, round_capacity,
    record::{Body, Payload, ValueRecord},
};

impl ValueStore {
    pub(crate) fn new_value(&self, size: usize, type_tag: TypeTag) -> Result<FieldRef> {
        let capacity =
            round_capacity(size).ok_or(LangifError::OutOfMemory { requested: size })?;
        let buffer = self.allocate_buffer(capacity)?;
        self.insert(ValueRecord::new(type_tag, Body::ema(size, buffer)))
    }

    /// Shrinking and growing inside the current capacity happen in place,
    /// anything larger moves the live prefix into a fresh buffer.
    pub(crate) fn resize(&self, r: FieldRef, new_size: usize) -> Result<()> {
        let record = self.live(r)?;
        record.ensure_strategy(r, Strategy::Ema)?;

        let mut guard = record.lock_live(r)?;
        let body = &mut *guard;
        let Payload::Ema(buffer) = &mut body.payload else {
            return Err(LangifError::InvalidReference(r));
        };

        if new_size <= buffer.capacity() {
            if new_size > body.size {
                // bytes past the old size may be left over from an earlier shrink
                buffer.zero(body.size, new_size);
            }
            log::trace!("resized {r} in place {} -> {new_size}", body.size);
            body.size = new_size;
            return Ok(());
        }

        let capacity =
            round_capacity(new_size).ok_or(LangifError::OutOfMemory { requested: new_size })?;
        let grown = self.allocate_buffer(capacity)?;
        // SAFETY: distinct allocations, both hold at least `body.size` bytes
        unsafe {
            std::ptr::copy_nonoverlapping(buffer.as_ptr(), grown.as_ptr(), body.size);
        }
        let old = std::mem::replace(buffer, grown);
        // SAFETY: replaced under the record lock, nothing else refers to it
        unsafe { self.free_buffer(old) };

        log::trace!("resized {r} by moving {} -> {new_size}", body.size);
        body.size = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        EMA_ALIGN, ForeignData, LangifError, Metadata, Strategy, StoreCreateInfo, TypeTag,
        ValueStore, free_allocated,
    };

    const TYPE_A: TypeTag = TypeTag(1);

    fn store() -> ValueStore {
        ValueStore::new(StoreCreateInfo::default())
    }

    fn fill_counting(store: &ValueStore, r: crate::FieldRef) {
        store
            .with_payload(r, |bytes| {
                for (i, b) in bytes.iter_mut().enumerate() {
                    *b = i as u8;
                }
            })
            .expect("fill");
    }

    #[test]
    fn new_reports_exact_size_and_enough_capacity() {
        let store = store();
        for size in [0, 1, 15, 16, 17, 64, 1000] {
            let r = store.new_value(size, TYPE_A).expect("new");
            let md = store.metadata(r).expect("metadata");
            assert_eq!(md.size, size);
            assert_eq!(md.type_tag, TYPE_A);
            assert!(md.real_size >= size);
            assert_eq!(md.real_size % EMA_ALIGN, 0);
            store.release(r).expect("release");
        }
    }

    #[test]
    fn fresh_values_are_zeroed() {
        let store = store();
        let r = store.new_value(40, TYPE_A).expect("new");
        assert_eq!(store.with_payload(r, |bytes| bytes.iter().all(|&b| b == 0)), Ok(true));
        store.release(r).expect("release");
    }

    #[test]
    fn growing_past_capacity_keeps_the_prefix() {
        let store = store();
        let r = store.new_value(16, TYPE_A).expect("new");
        fill_counting(&store, r);

        store.resize(r, 100).expect("grow");
        let md = store.metadata(r).expect("metadata");
        assert_eq!(md.size, 100);
        assert!(md.real_size >= 100);

        let bytes = store.with_payload(r, |bytes| bytes.to_vec()).expect("payload");
        assert_eq!(bytes.len(), 100);
        assert!(bytes[..16].iter().enumerate().all(|(i, &b)| b == i as u8));
        assert!(bytes[16..].iter().all(|&b| b == 0));
        store.release(r).expect("release");
    }

    #[test]
    fn shrinking_reuses_capacity_and_keeps_the_prefix() {
        let store = store();
        let r = store.new_value(64, TYPE_A).expect("new");
        fill_counting(&store, r);
        let before = store.access(r).expect("access").as_ptr();

        store.resize(r, 10).expect("shrink");
        assert_eq!(
            store.metadata(r),
            Ok(Metadata {
                size: 10,
                type_tag: TYPE_A,
                real_size: 64,
            })
        );
        assert_eq!(store.access(r).expect("access").as_ptr(), before, "no reallocation");
        let bytes = store.with_payload(r, |bytes| bytes.to_vec()).expect("payload");
        assert_eq!(bytes, (0..10).collect::<Vec<u8>>());

        store.resize(r, 20).expect("regrow in place");
        let bytes = store.with_payload(r, |bytes| bytes.to_vec()).expect("payload");
        assert_eq!(&bytes[..10], &(0..10).collect::<Vec<u8>>()[..]);
        assert!(bytes[10..].iter().all(|&b| b == 0), "stale bytes are not exposed");
        store.release(r).expect("release");
    }

    #[test]
    fn resize_rejects_foreign_and_dead_values() {
        let store = store();
        let data = ForeignData::allocate(8).expect("allocation");
        let wrapped = store.wrap(TYPE_A, data).expect("wrap");
        assert_eq!(
            store.resize(wrapped, 16),
            Err(LangifError::StrategyMismatch {
                reference: wrapped,
                expected: Strategy::Ema,
                found: Strategy::Lma,
            })
        );
        store.release(wrapped).expect("release");
        unsafe { free_allocated(data) };

        let r = store.new_value(8, TYPE_A).expect("new");
        store.release(r).expect("release");
        assert_eq!(store.resize(r, 16), Err(LangifError::InvalidReference(r)));
    }

    #[test]
    fn failed_growth_leaves_the_value_alone() {
        let store = ValueStore::new(StoreCreateInfo {
            max_bytes: Some(32),
            ..Default::default()
        });
        let r = store.new_value(16, TYPE_A).expect("new");
        fill_counting(&store, r);

        assert_eq!(
            store.resize(r, 64),
            Err(LangifError::OutOfMemory { requested: 64 })
        );
        assert_eq!(store.metadata(r).map(|md| md.size), Ok(16));
        assert_eq!(
            store.with_payload(r, |bytes| bytes.to_vec()),
            Ok((0..16).collect::<Vec<u8>>())
        );
        store.release(r).expect("release");
        assert_eq!(store.stats().ema_bytes, 0);
    }
}
