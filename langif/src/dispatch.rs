use std::{fmt, marker::PhantomData, sync::Arc};

use crate::{
    BindEntry, Binding, FieldRef, ForeignData, FreeFn, Item, LangifError, LogLevel, Metadata,
    OutFormat, OutItem, OutputSink, Pattern, PayloadView, Record, Result, TagSite, TaggedRef,
    TypeTag, ValueStore, decode_at, encode_claim, encode_demit,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task{}", self.0)
    }
}

/// The operation table a box sees.
pub trait BoxApi {
    /// Take the input record apart according to `pattern`. Ownership of every
    /// bound field moves to the box.
    fn bind(&mut self, pattern: &Pattern) -> Result<Vec<Binding>>;
    fn claim(&self, r: FieldRef) -> TaggedRef;

    /// Emit a record. Demitted fields hand the box's reference over,
    /// plain ones are cloned and stay owned by the box. A demitted reference
    /// listed twice moves once and is cloned for the repeats.
    fn out(&mut self, variant: u32, items: &[OutItem]) -> Result<()>;
    fn outv(&mut self, format: &OutFormat, items: &[OutItem]) -> Result<()>;
    fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>);
    fn demit(&self, r: impl Into<TaggedRef>) -> TaggedRef;

    fn access(&self, r: impl Into<TaggedRef>) -> Result<PayloadView>;
    fn with_access<R>(
        &self,
        r: impl Into<TaggedRef>,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R>;
    fn metadata(&self, r: impl Into<TaggedRef>) -> Result<Metadata>;
    fn release(&mut self, r: impl Into<TaggedRef>) -> Result<()>;
    fn clone_ref(&mut self, r: impl Into<TaggedRef>) -> Result<FieldRef>;
    fn copyref(&mut self, r: impl Into<TaggedRef>) -> Result<FieldRef>;

    fn new(&mut self, size: usize, type_tag: TypeTag) -> Result<FieldRef>;
    fn resize(&mut self, r: impl Into<TaggedRef>, new_size: usize) -> Result<()>;

    fn wrap(&mut self, type_tag: TypeTag, data: ForeignData) -> Result<FieldRef>;
    fn capture(&mut self, type_tag: TypeTag, data: ForeignData) -> Result<FieldRef>;
    fn capture_with(
        &mut self,
        type_tag: TypeTag,
        data: ForeignData,
        free: FreeFn,
    ) -> Result<FieldRef>;
    fn unwrap(&self, r: impl Into<TaggedRef>) -> Result<ForeignData>;
    fn unwrap_release(&mut self, r: impl Into<TaggedRef>) -> Result<ForeignData>;

    fn wrap_demit(&mut self, type_tag: TypeTag, data: ForeignData) -> Result<TaggedRef> {
        let r = self.wrap(type_tag, data)?;
        Ok(self.demit(r))
    }

    fn capture_demit(&mut self, type_tag: TypeTag, data: ForeignData) -> Result<TaggedRef> {
        let r = self.capture(type_tag, data)?;
        Ok(self.demit(r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub task: TaskId,
    pub emitted: usize,
    pub severity: LogLevel,
}

/// Capability of one invocation of a box, bound to the task running it.
pub struct Dispatch {
    task: TaskId,
    store: ValueStore,
    sink: Arc<dyn OutputSink>,
    input: Option<Record>,
    emitted: usize,
    severity: LogLevel,
    _marker: PhantomData<*const ()>,
}

impl Dispatch {
    pub(crate) fn open(
        task: TaskId,
        store: ValueStore,
        sink: Arc<dyn OutputSink>,
        input: Record,
    ) -> Self {
        Self {
            task,
            store,
            sink,
            input: Some(input),
            emitted: 0,
            severity: LogLevel::NOTSET,
            _marker: PhantomData,
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    /// highest level logged so far
    pub fn severity(&self) -> LogLevel {
        self.severity
    }

    pub fn is_aborted(&self) -> bool {
        self.severity.aborts()
    }

    pub fn finish(self) -> DispatchSummary {
        DispatchSummary {
            task: self.task,
            emitted: self.emitted,
            severity: self.severity,
        }
    }

    #[inline]
    fn operand(&self, r: impl Into<TaggedRef>) -> Result<FieldRef> {
        Ok(decode_at(r.into(), TagSite::Operand)?.raw)
    }

    /// A reference nobody else holds, copying the value if it is shared.
    fn exclusive(&mut self, r: FieldRef) -> Result<FieldRef> {
        if self.store.refcount(r)? <= 1 {
            return Ok(r);
        }
        let copy = self.store.copyref(r)?;
        self.store.release(r)?;
        log::debug!("{}: claimed shared {r} as {copy}", self.task);
        Ok(copy)
    }

    fn release_all(&self, refs: impl Iterator<Item = FieldRef>) {
        for r in refs {
            if let Err(err) = self.store.release(r) {
                log::warn!("{}: could not release {r}: {err}", self.task);
            }
        }
    }
}

impl BoxApi for Dispatch {
    fn bind(&mut self, pattern: &Pattern) -> Result<Vec<Binding>> {
        let record = self.input.take().ok_or(LangifError::AlreadyBound)?;
        if let Err(err) = pattern.check(&record.items) {
            self.input = Some(record);
            return Err(err);
        }

        let mut bindings = Vec::with_capacity(record.items.len());
        let mut items = record.items.into_iter();
        for entry in pattern.entries() {
            let Some(item) = items.next() else { break };
            let bound = match (entry, item) {
                (BindEntry::Claim, Item::Field(r)) => self.exclusive(r).map(Binding::Field),
                (_, Item::Field(r)) => Ok(Binding::Field(r)),
                (_, Item::Tag(value)) => Ok(Binding::Tag(value)),
            };
            match bound {
                Ok(binding) => bindings.push(binding),
                Err(err) => {
                    self.release_all(bindings.iter().filter_map(|b| b.field()));
                    let unbound = std::iter::once(item).chain(items);
                    self.release_all(unbound.filter_map(|item| match item {
                        Item::Field(r) => Some(r),
                        Item::Tag(_) => None,
                    }));
                    return Err(err);
                }
            }
        }
        Ok(bindings)
    }

    fn claim(&self, r: FieldRef) -> TaggedRef {
        encode_claim(r)
    }

    fn out(&mut self, variant: u32, items: &[OutItem]) -> Result<()> {
        let mut decoded = Vec::with_capacity(items.len());
        let mut moved = Vec::new();
        for item in items {
            match *item {
                OutItem::Field(tagged) => {
                    let field = decode_at(tagged, TagSite::Output)?;
                    self.store.live(field.raw)?;
                    // a reference moves once, repeats of it are cloned
                    let moves = field.demitted && !moved.contains(&field.raw);
                    if moves {
                        moved.push(field.raw);
                    }
                    decoded.push((Item::Field(field.raw), !moves));
                }
                OutItem::Tag(value) => decoded.push((Item::Tag(value), false)),
            }
        }

        let mut record = Record::new(variant, Vec::with_capacity(decoded.len()));
        for (index, &(item, shared)) in decoded.iter().enumerate() {
            if let (Item::Field(r), true) = (item, shared) {
                if let Err(err) = self.store.retain(r) {
                    // undo the clones taken for this record so far
                    self.release_all(decoded[..index].iter().filter_map(|&(item, shared)| {
                        match item {
                            Item::Field(r) if shared => Some(r),
                            _ => None,
                        }
                    }));
                    return Err(err);
                }
            }
            record.items.push(item);
        }

        self.sink.emit(self.task, record);
        self.emitted += 1;
        Ok(())
    }

    fn outv(&mut self, format: &OutFormat, items: &[OutItem]) -> Result<()> {
        format.check(items)?;
        self.out(format.variant, items)
    }

    fn log(&mut self, level: LogLevel, args: fmt::Arguments<'_>) {
        self.severity = self.severity.max(level);
        log::log!(target: "langif::box", level.to_log_level(), "[{}] {level}: {args}", self.task);
    }

    fn demit(&self, r: impl Into<TaggedRef>) -> TaggedRef {
        encode_demit(r)
    }

    fn access(&self, r: impl Into<TaggedRef>) -> Result<PayloadView> {
        self.store.access(self.operand(r)?)
    }

    fn with_access<R>(
        &self,
        r: impl Into<TaggedRef>,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.store.with_payload(self.operand(r)?, f)
    }

    fn metadata(&self, r: impl Into<TaggedRef>) -> Result<Metadata> {
        self.store.metadata(self.operand(r)?)
    }

    fn release(&mut self, r: impl Into<TaggedRef>) -> Result<()> {
        self.store.release(self.operand(r)?)
    }

    fn clone_ref(&mut self, r: impl Into<TaggedRef>) -> Result<FieldRef> {
        self.store.retain(self.operand(r)?)
    }

    fn copyref(&mut self, r: impl Into<TaggedRef>) -> Result<FieldRef> {
        self.store.copyref(self.operand(r)?)
    }

    fn new(&mut self, size: usize, type_tag: TypeTag) -> Result<FieldRef> {
        self.store.new_value(size, type_tag)
    }

    fn resize(&mut self, r: impl Into<TaggedRef>, new_size: usize) -> Result<()> {
        self.store.resize(self.operand(r)?, new_size)
    }

    fn wrap(&mut self, type_tag: TypeTag, data: ForeignData) -> Result<FieldRef> {
        self.store.wrap(type_tag, data)
    }

    fn capture(&mut self, type_tag: TypeTag, data: ForeignData) -> Result<FieldRef> {
        self.store.capture(type_tag, data)
    }

    fn capture_with(
        &mut self,
        type_tag: TypeTag,
        data: ForeignData,
        free: FreeFn,
    ) -> Result<FieldRef> {
        self.store.capture_with(type_tag, data, free)
    }

    fn unwrap(&self, r: impl Into<TaggedRef>) -> Result<ForeignData> {
        self.store.unwrap(self.operand(r)?)
    }

    fn unwrap_release(&mut self, r: impl Into<TaggedRef>) -> Result<ForeignData> {
        self.store.unwrap_release(self.operand(r)?)
    }
}

impl Drop for Dispatch {
    fn drop(&mut self) {
        if let Some(record) = self.input.take() {
            log::debug!("{}: releasing unbound input", self.task);
            self.release_all(record.field_refs());
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("task", &self.task)
            .field("input", &self.input)
            .field("emitted", &self.emitted)
            .field("severity", &self.severity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectingSink, ItemKind, StoreCreateInfo, free_allocated};

    const TYPE_A: TypeTag = TypeTag(1);

    fn open(store: &ValueStore, task: u64, input: Record) -> Dispatch {
        Dispatch::open(TaskId(task), store.clone(), Arc::new(CollectingSink::new()), input)
    }

    fn setup(input: Record) -> (ValueStore, Arc<CollectingSink>, Dispatch) {
        let store = ValueStore::new(StoreCreateInfo::default());
        let sink = Arc::new(CollectingSink::new());
        let dispatch = Dispatch::open(TaskId(7), store.clone(), sink.clone(), input);
        (store, sink, dispatch)
    }

    #[test]
    fn bind_hands_over_fields_and_tags() {
        let store = ValueStore::new(StoreCreateInfo::default());
        let r = store.new_value(8, TYPE_A).expect("new");
        let sink = Arc::new(CollectingSink::new());
        let input = Record::new(0, vec![Item::Field(r), Item::Tag(42)]);
        let mut d = Dispatch::open(TaskId(1), store.clone(), sink, input);

        let bound = d
            .bind(&Pattern::new([BindEntry::Field, BindEntry::Tag]))
            .expect("bind");
        assert_eq!(bound, vec![Binding::Field(r), Binding::Tag(42)]);
        assert_eq!(d.bind(&Pattern::default()), Err(LangifError::AlreadyBound));

        d.release(r).expect("box owns the field now");
        drop(d);
        assert_eq!(store.stats().live_records, 0);
    }

    #[test]
    fn failed_bind_leaves_the_input_in_place() {
        let store = ValueStore::new(StoreCreateInfo::default());
        let r = store.new_value(8, TYPE_A).expect("new");
        let mut d = open(&store, 2, Record::new(0, vec![Item::Field(r)]));
        assert_eq!(
            d.bind(&Pattern::new([BindEntry::Tag])),
            Err(LangifError::PatternMismatch {
                index: 0,
                expected: ItemKind::Tag,
            })
        );
        let bound = d.bind(&Pattern::new([BindEntry::Field])).expect("second try");
        assert_eq!(bound, vec![Binding::Field(r)]);
        d.release(r).expect("release");
    }

    #[test]
    fn claim_binding_copies_shared_values() {
        let store = ValueStore::new(StoreCreateInfo::default());
        let r = store.new_value(4, TYPE_A).expect("new");
        store.with_payload(r, |bytes| bytes.fill(1)).expect("fill");
        store.retain(r).expect("second consumer");

        let mut d = open(&store, 3, Record::new(0, vec![Item::Field(r)]));
        let bound = d.bind(&Pattern::new([BindEntry::Claim])).expect("bind");
        let mine = bound[0].field().expect("field");

        assert_ne!(mine, r, "shared input is copied");
        assert_eq!(store.refcount(r), Ok(1), "our share of the original is dropped");
        d.with_access(mine, |bytes| bytes.fill(2)).expect("mutate");
        assert_eq!(store.with_payload(r, |bytes| bytes.to_vec()), Ok(vec![1; 4]));

        d.release(mine).expect("release copy");
        store.release(r).expect("release original");
    }

    #[test]
    fn claim_binding_keeps_exclusive_values() {
        let store = ValueStore::new(StoreCreateInfo::default());
        let r = store.new_value(4, TYPE_A).expect("new");
        let mut d = open(&store, 4, Record::new(0, vec![Item::Field(r)]));
        let bound = d.bind(&Pattern::new([BindEntry::Claim])).expect("bind");
        assert_eq!(bound, vec![Binding::Field(r)]);
        d.release(r).expect("release");
    }

    #[test]
    fn demitted_fields_move_and_plain_fields_are_cloned() {
        let (store, sink, mut d) = setup(Record::empty());
        let moved = d.new(8, TYPE_A).expect("new");
        let kept = d.new(8, TYPE_A).expect("new");

        let items = [d.demit(moved).into(), kept.into(), OutItem::Tag(5)];
        d.out(2, &items).expect("out");

        assert_eq!(store.refcount(moved), Ok(1), "demit hands our reference over");
        assert_eq!(store.refcount(kept), Ok(2), "plain field is shared with the output");

        let emitted = sink.pop().expect("record");
        assert_eq!(emitted.task, TaskId(7));
        assert_eq!(
            emitted.record,
            Record::new(2, vec![Item::Field(moved), Item::Field(kept), Item::Tag(5)])
        );
        assert_eq!(d.finish().emitted, 1);

        for r in emitted.record.field_refs() {
            store.release(r).expect("downstream release");
        }
        store.release(kept).expect("box release");
        assert_eq!(store.stats().live_records, 0);
    }

    #[test]
    fn a_reference_demitted_twice_moves_once() {
        let (store, sink, mut d) = setup(Record::empty());
        let r = d.new(8, TYPE_A).expect("new");
        let moved = d.demit(r);
        d.out(0, &[moved.into(), moved.into()]).expect("out");

        assert_eq!(store.refcount(r), Ok(2), "one move plus one clone");
        let emitted = sink.pop().expect("record");
        assert_eq!(emitted.record.field_refs().count(), 2);
        for field in emitted.record.field_refs() {
            store.release(field).expect("downstream release");
        }
        assert_eq!(store.release(r), Err(LangifError::DoubleRelease(r)));
    }

    #[test]
    fn out_validates_before_touching_counts() {
        let (store, sink, mut d) = setup(Record::empty());
        let good = d.new(8, TYPE_A).expect("new");
        let dead = d.new(8, TYPE_A).expect("new");
        d.release(dead).expect("release");

        assert_eq!(
            d.out(0, &[good.into(), dead.into()]),
            Err(LangifError::InvalidReference(dead))
        );
        assert_eq!(store.refcount(good), Ok(1));
        assert!(sink.is_empty());
        d.release(good).expect("release");
    }

    #[test]
    fn outv_checks_the_format() {
        let (_store, sink, mut d) = setup(Record::empty());
        let format = OutFormat::new(1, [ItemKind::Tag, ItemKind::Tag]);
        assert_eq!(
            d.outv(&format, &[OutItem::Tag(1)]),
            Err(LangifError::ArityMismatch {
                expected: 2,
                found: 1,
            })
        );
        d.outv(&format, &[OutItem::Tag(1), OutItem::Tag(2)]).expect("outv");
        assert_eq!(sink.pop().map(|e| e.record.variant), Some(1));
    }

    #[test]
    fn operations_reject_demitted_operands() {
        let (_store, _sink, mut d) = setup(Record::empty());
        let r = d.new(8, TYPE_A).expect("new");
        let demitted = d.demit(r);
        assert!(matches!(d.access(demitted), Err(LangifError::InvalidTag { .. })));
        assert!(matches!(d.release(demitted), Err(LangifError::InvalidTag { .. })));

        let claimed = d.claim(r);
        assert_eq!(d.metadata(claimed).map(|md| md.size), Ok(8));
        d.resize(claimed, 32).expect("claimed operand is stripped");
        d.release(claimed).expect("release");
    }

    #[test]
    fn unbound_inputs_are_released_on_drop() {
        let store = ValueStore::new(StoreCreateInfo::default());
        let r = store.new_value(8, TYPE_A).expect("new");
        let d = open(&store, 5, Record::new(0, vec![Item::Field(r)]));
        drop(d);
        assert_eq!(store.metadata(r), Err(LangifError::InvalidReference(r)));
    }

    #[test]
    fn log_tracks_the_highest_severity() {
        let (_store, _sink, mut d) = setup(Record::empty());
        d.log(LogLevel::INFO, format_args!("starting {}", 1));
        assert!(!d.is_aborted());
        d.log(LogLevel::ERROR, format_args!("giving up"));
        d.log(LogLevel::DEBUG, format_args!("after the fact"));
        assert_eq!(d.severity(), LogLevel::ERROR);
        assert!(d.is_aborted());
        assert_eq!(d.finish().severity, LogLevel::ERROR);
    }

    #[test]
    fn wrap_demit_emits_foreign_values() {
        let (store, sink, mut d) = setup(Record::empty());
        let data = ForeignData::allocate(16).expect("allocation");
        let tagged = d.wrap_demit(TypeTag(9), data).expect("wrap_demit");
        assert!(tagged.is_demitted());
        d.out(0, &[tagged.into()]).expect("out");

        let emitted = sink.pop().expect("record");
        let r = emitted.record.field_refs().next().expect("field");
        assert_eq!(store.metadata(r).map(|md| md.type_tag), Ok(TypeTag(9)));
        store.release(r).expect("release");
        unsafe { free_allocated(data) };
    }
}
