use std::fmt;

use crate::{FieldRef, LangifError, Result, TaggedRef};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ItemKind {
    Field,
    Tag,
}

/// Entry of a record travelling between boxes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Item {
    Field(FieldRef),
    Tag(i64),
}

/// Entry handed to `out`, fields may still carry transport tags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutItem {
    Field(TaggedRef),
    Tag(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub variant: u32,
    pub items: Vec<Item>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindEntry {
    Field,
    /// a field the box wants to mutate, shared inputs are copied first
    Claim,
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pattern {
    entries: Vec<BindEntry>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Binding {
    Field(FieldRef),
    Tag(i64),
}

/// Shape of a record emitted through `outv`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutFormat {
    pub variant: u32,
    pub kinds: Vec<ItemKind>,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Field => f.write_str("field"),
            ItemKind::Tag => f.write_str("tag"),
        }
    }
}

impl Item {
    pub fn kind(self) -> ItemKind {
        match self {
            Item::Field(_) => ItemKind::Field,
            Item::Tag(_) => ItemKind::Tag,
        }
    }
}

impl OutItem {
    pub fn kind(self) -> ItemKind {
        match self {
            OutItem::Field(_) => ItemKind::Field,
            OutItem::Tag(_) => ItemKind::Tag,
        }
    }
}

impl From<FieldRef> for OutItem {
    fn from(value: FieldRef) -> Self {
        OutItem::Field(value.into())
    }
}

impl From<TaggedRef> for OutItem {
    fn from(value: TaggedRef) -> Self {
        OutItem::Field(value)
    }
}

impl Record {
    pub fn new(variant: u32, items: Vec<Item>) -> Self {
        Self { variant, items }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn field_refs(&self) -> impl Iterator<Item = FieldRef> + '_ {
        self.items.iter().filter_map(|item| match item {
            Item::Field(r) => Some(*r),
            Item::Tag(_) => None,
        })
    }
}

impl BindEntry {
    pub fn kind(self) -> ItemKind {
        match self {
            BindEntry::Field | BindEntry::Claim => ItemKind::Field,
            BindEntry::Tag => ItemKind::Tag,
        }
    }
}

impl Pattern {
    pub fn new(entries: impl Into<Vec<BindEntry>>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    pub fn entries(&self) -> &[BindEntry] {
        &self.entries
    }

    pub fn check(&self, items: &[Item]) -> Result<()> {
        check_kinds(
            self.entries.iter().map(|entry| entry.kind()),
            self.entries.len(),
            items.iter().map(|item| item.kind()),
            items.len(),
        )
    }
}

impl Binding {
    pub fn field(self) -> Option<FieldRef> {
        match self {
            Binding::Field(r) => Some(r),
            Binding::Tag(_) => None,
        }
    }

    pub fn tag(self) -> Option<i64> {
        match self {
            Binding::Tag(value) => Some(value),
            Binding::Field(_) => None,
        }
    }
}

impl OutFormat {
    pub fn new(variant: u32, kinds: impl Into<Vec<ItemKind>>) -> Self {
        Self {
            variant,
            kinds: kinds.into(),
        }
    }

    pub fn check(&self, items: &[OutItem]) -> Result<()> {
        check_kinds(
            self.kinds.iter().copied(),
            self.kinds.len(),
            items.iter().map(|item| item.kind()),
            items.len(),
        )
    }
}

fn check_kinds(
    expected: impl Iterator<Item = ItemKind>,
    expected_len: usize,
    found: impl Iterator<Item = ItemKind>,
    found_len: usize,
) -> Result<()> {
    if expected_len != found_len {
        return Err(LangifError::ArityMismatch {
            expected: expected_len,
            found: found_len,
        });
    }
    for (index, (expected, found)) in expected.zip(found).enumerate() {
        if expected != found {
            return Err(LangifError::PatternMismatch { index, expected });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matches_positionally() {
        let r = FieldRef::from_parts(1, 1);
        let items = [Item::Field(r), Item::Tag(3)];

        assert!(Pattern::new([BindEntry::Claim, BindEntry::Tag]).check(&items).is_ok());
        assert_eq!(
            Pattern::new([BindEntry::Tag, BindEntry::Tag]).check(&items),
            Err(LangifError::PatternMismatch {
                index: 0,
                expected: ItemKind::Tag,
            })
        );
        assert_eq!(
            Pattern::new([BindEntry::Field]).check(&items),
            Err(LangifError::ArityMismatch {
                expected: 1,
                found: 2,
            })
        );
    }

    #[test]
    fn out_format_checks_tagged_items() {
        let r = FieldRef::from_parts(2, 1);
        let format = OutFormat::new(4, [ItemKind::Field, ItemKind::Tag]);
        assert!(format.check(&[crate::encode_demit(r).into(), OutItem::Tag(1)]).is_ok());
        assert_eq!(
            format.check(&[OutItem::Tag(1), r.into()]),
            Err(LangifError::PatternMismatch {
                index: 0,
                expected: ItemKind::Field,
            })
        );
    }

    #[test]
    fn records_list_their_fields() {
        let a = FieldRef::from_parts(1, 1);
        let b = FieldRef::from_parts(2, 1);
        let record = Record::new(0, vec![Item::Field(a), Item::Tag(9), Item::Field(b)]);
        assert_eq!(record.field_refs().collect::<Vec<_>>(), vec![a, b]);
        assert!(Record::empty().field_refs().next().is_none());
    }
}
