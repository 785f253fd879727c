//! Foreign values: the payload lives outside the store.
//!
//! A wrapped buffer is never freed by the store. A captured one is freed with
//! its `FreeFn` once the last reference is released, unless `unwrap_release`
//! hands it back first.
use crate::{
    FieldRef, ForeignData, FreeFn, LangifError, Result, Strategy, TypeTag, ValueStore,
    record::{Body, Ownership, Payload, ValueRecord},
};

impl ValueStore {
    pub(crate) fn wrap(&self, type_tag: TypeTag, data: ForeignData) -> Result<FieldRef> {
        self.insert(ValueRecord::new(
            type_tag,
            Body::lma(data, Ownership::Wrapped),
        ))
    }

    pub(crate) fn capture(&self, type_tag: TypeTag, data: ForeignData) -> Result<FieldRef> {
        self.capture_with(type_tag, data, self.settings().foreign_free)
    }

    pub(crate) fn capture_with(
        &self,
        type_tag: TypeTag,
        data: ForeignData,
        free: FreeFn,
    ) -> Result<FieldRef> {
        self.insert(ValueRecord::new(
            type_tag,
            Body::lma(data, Ownership::Captured(free)),
        ))
    }

    pub(crate) fn unwrap(&self, r: FieldRef) -> Result<ForeignData> {
        let record = self.live(r)?;
        record.ensure_strategy(r, Strategy::Lma)?;
        let mut body = record.lock_live(r)?;
        foreign(r, &mut body.payload).map(|(data, _)| data)
    }

    /// The count is dropped under the body lock, so the pointer is read while
    /// this caller still owns the record.
    pub(crate) fn unwrap_release(&self, r: FieldRef) -> Result<ForeignData> {
        let record = self.live(r)?;
        record.ensure_strategy(r, Strategy::Lma)?;

        let mut body = record.lock_live(r)?;
        let (data, ownership) = foreign(r, &mut body.payload)?;
        match record.release() {
            None => Err(LangifError::DoubleRelease(r)),
            Some(0) => {
                drop(body);
                // dropping the body forgets the pointer without freeing it
                drop(self.unlink(r, &record));
                log::trace!("handed back {r}");
                Ok(data)
            }
            Some(_) => {
                // the caller owns the memory again, the remaining owners only borrow it
                if matches!(ownership, Ownership::Captured(_)) {
                    log::debug!("{r} handed back while shared, no longer freed on release");
                }
                *ownership = Ownership::Wrapped;
                Ok(data)
            }
        }
    }
}

fn foreign(r: FieldRef, payload: &mut Payload) -> Result<(ForeignData, &mut Ownership)> {
    match payload {
        Payload::Lma { data, ownership } => Ok((*data, ownership)),
        Payload::Ema(_) => Err(LangifError::InvalidReference(r)),
    }
}
