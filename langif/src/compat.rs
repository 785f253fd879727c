//! The older single-call interface, expressed on top of [`BoxApi`].
use crate::{BoxApi, FieldRef, ForeignData, OutItem, PayloadView, Result, TaggedRef, TypeTag};

/// Wraps `data` without taking ownership of it.
pub fn create<B: BoxApi>(b: &mut B, type_tag: TypeTag, data: ForeignData) -> Result<FieldRef> {
    b.wrap(type_tag, data)
}

pub fn free<B: BoxApi>(b: &mut B, r: impl Into<TaggedRef>) -> Result<()> {
    b.release(r)
}

/// A fresh value together with its payload.
pub fn alloc<B: BoxApi>(
    b: &mut B,
    type_tag: TypeTag,
    size: usize,
) -> Result<(FieldRef, PayloadView)> {
    let r = b.new(size, type_tag)?;
    match b.access(r) {
        Ok(view) => Ok((r, view)),
        Err(err) => {
            if let Err(release) = b.release(r) {
                log::warn!("could not release {r} after failed alloc: {release}");
            }
            Err(err)
        }
    }
}

pub fn size_of<B: BoxApi>(b: &B, r: impl Into<TaggedRef>) -> Result<usize> {
    Ok(b.metadata(r)?.size)
}

pub fn get_data<B: BoxApi>(b: &B, r: impl Into<TaggedRef>) -> Result<PayloadView> {
    b.access(r)
}

pub fn out<B: BoxApi>(b: &mut B, variant: u32, items: &[OutItem]) -> Result<()> {
    b.out(variant, items)
}
