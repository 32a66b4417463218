//! Recursive Flow Classification engine.
//!
//! Every filter window is split into 8- or 16-bit chunks. Each distinct
//! `(reference point, offset, width, mask)` gets a number line whose points
//! carry rule start/end events; walking a line canonicalises the rule
//! bitmap at every value into a small equivalence-class id. Later phases
//! pairwise-intersect parent classes until a single chunk remains, whose
//! ids index a precomputed list of matching rule slots. A lookup is then
//! one masked read plus one table indexing per chunk.
//!
//! Ownership is index-based throughout: classes live in per-chunk tables
//! (`Vec` of bitmaps plus parallel refcounts and a LIFO free list), chunk
//! entries hold class ids, and nothing points back down the phase tree.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use meter_common::{
    Filter, MatchKind, MeterError, MeterResult, PacketMeta, RefPoint, Rule,
};
use tracing::{debug, warn};

use crate::{
    bitmap::Bitmap, fwd_slot, rev_slot, Classifier, ClassifierStats, MAX_CHUNKS, MAX_PHASES,
    MAX_RULES, PREALLOC_CLASSES,
};

/// Entry placeholder for index pairs involving a freed parent class;
/// never produced by a lookup.
const EQ_NONE: u16 = u16::MAX;

/// Rule projection events on a number line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointKind {
    RuleStart,
    RuleEnd,
}

/// One equivalence class: a rule bitmap plus its reference count.
#[derive(Debug, Clone, Default)]
struct EqClass {
    bm: Bitmap,
    refs: u32,
}

/// Equivalence classes of one chunk, indexed by class id.
#[derive(Debug, Default)]
struct EqClassTable {
    by_bm: HashMap<Bitmap, u16>,
    classes: Vec<EqClass>,
    free: Vec<u16>,
}

impl EqClassTable {
    fn with_prealloc() -> Self {
        Self {
            by_bm: HashMap::with_capacity(PREALLOC_CLASSES),
            classes: Vec::with_capacity(PREALLOC_CLASSES),
            free: Vec::new(),
        }
    }

    /// Look the bitmap up, allocating a fresh id if unknown; the returned
    /// id carries one new reference.
    fn acquire(&mut self, bm: &Bitmap) -> MeterResult<u16> {
        if let Some(&id) = self.by_bm.get(bm) {
            self.classes[id as usize].refs += 1;
            return Ok(id);
        }
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                if self.classes.len() >= EQ_NONE as usize {
                    return Err(MeterError::ClassifierCapacity(
                        "equivalence class space exhausted".into(),
                    ));
                }
                self.classes.push(EqClass::default());
                (self.classes.len() - 1) as u16
            }
        };
        self.classes[id as usize] = EqClass {
            bm: bm.clone(),
            refs: 1,
        };
        self.by_bm.insert(bm.clone(), id);
        Ok(id)
    }

    #[inline]
    fn add_ref(&mut self, id: u16) {
        self.classes[id as usize].refs += 1;
    }

    /// Drop a reference; a class reaching zero returns its id to the
    /// free list.
    fn release(&mut self, id: u16) {
        let class = &mut self.classes[id as usize];
        debug_assert!(class.refs > 0);
        class.refs -= 1;
        if class.refs == 0 {
            self.by_bm.remove(&class.bm);
            self.free.push(id);
        }
    }

    #[inline]
    fn bitmap(&self, id: u16) -> &Bitmap {
        &self.classes[id as usize].bm
    }

    #[inline]
    fn is_live(&self, id: u16) -> bool {
        self.classes[id as usize].refs > 0
    }

    /// Current id space (live and freed ids).
    #[inline]
    fn id_space(&self) -> usize {
        self.classes.len()
    }
}

/// One chunk-0 dimension: a number line over an 8- or 16-bit window.
#[derive(Debug)]
struct NumberLine {
    refer: RefPoint,
    /// Byte offset within the reference point
    offs: u16,
    /// Window width in bytes (1 or 2)
    width: u8,
    /// Joined filter/definition mask for this window
    mask: u16,
    /// Number of values (256 or 65536)
    size: usize,
    /// Start/end events, indexed by value
    points: BTreeMap<u16, Vec<(PointKind, u16)>>,
    /// eqid per value
    entries: Vec<u16>,
    /// eqid used when the packet lacks this reference point
    missing_eq: u16,
    /// Slots with a predicate on this line
    constrained: Bitmap,
    /// Slots installed elsewhere; they match every value here
    unconstrained: Bitmap,
    eq: EqClassTable,
}

impl NumberLine {
    fn new(refer: RefPoint, offs: u16, width: u8, mask: u16, existing: &Bitmap) -> MeterResult<Self> {
        let size = if width == 1 { 256 } else { 65536 };
        let mut eq = EqClassTable::with_prealloc();
        // every existing slot is unconstrained on a fresh line
        let init = eq.acquire(existing)?;
        for _ in 1..size {
            eq.add_ref(init);
        }
        eq.add_ref(init); // missing entry
        Ok(Self {
            refer,
            offs,
            width,
            mask,
            size,
            points: BTreeMap::new(),
            entries: vec![init; size],
            missing_eq: init,
            constrained: Bitmap::new(),
            unconstrained: existing.clone(),
            eq,
        })
    }

    fn add_point(&mut self, value: u16, kind: PointKind, slot: u16) {
        self.points.entry(value).or_default().push((kind, slot));
    }

    fn remove_slot_points(&mut self, slot: u16) {
        self.points.retain(|_, evs| {
            evs.retain(|&(_, s)| s != slot);
            !evs.is_empty()
        });
    }

    /// Replace the eqid of one value, keeping refcounts exact.
    fn set_entry(&mut self, value: usize, id: u16) {
        let old = self.entries[value];
        if old == id {
            return;
        }
        self.eq.add_ref(id);
        self.eq.release(old);
        self.entries[value] = id;
    }

    /// Assign one eqid to a span of values.
    fn fill_span(&mut self, from: usize, to: usize, bm: &Bitmap) -> MeterResult<()> {
        if from >= to {
            return Ok(());
        }
        let target = self.eq.acquire(bm)?;
        for v in from..to {
            self.set_entry(v, target);
        }
        self.eq.release(target);
        Ok(())
    }

    /// Recompute all entries from the point events: walk values in
    /// ascending order maintaining the currently-active bitmap and
    /// canonicalise every snapshot. Entries that keep their bitmap keep
    /// their class id.
    fn rebuild(&mut self) -> MeterResult<()> {
        let mut active = Bitmap::new();
        let mut span_bm = active.or(&self.unconstrained);
        let mut prev = 0usize;

        let values: Vec<u16> = self.points.keys().copied().collect();
        for v in values {
            let bm_before = span_bm.clone();
            self.fill_span(prev, v as usize, &bm_before)?;

            let evs = self.points.get(&v).cloned().unwrap_or_default();
            for &(kind, slot) in &evs {
                if kind == PointKind::RuleStart {
                    active.set(slot as usize);
                }
            }
            // snapshot at the point itself, start events applied,
            // end events still active (ranges are inclusive)
            let at_point = active.or(&self.unconstrained);
            let target = self.eq.acquire(&at_point)?;
            self.set_entry(v as usize, target);
            self.eq.release(target);

            for &(kind, slot) in &evs {
                if kind == PointKind::RuleEnd {
                    active.reset(slot as usize);
                }
            }
            span_bm = active.or(&self.unconstrained);
            prev = v as usize + 1;
        }
        let tail = span_bm.clone();
        self.fill_span(prev, self.size, &tail)?;
        debug_assert!(active.is_zero());

        // packets without this reference point only match rules that do
        // not constrain it
        let missing_bm = self.unconstrained.clone();
        let target = self.eq.acquire(&missing_bm)?;
        let old = self.missing_eq;
        if old != target {
            self.missing_eq = target;
            self.eq.release(old);
        } else {
            self.eq.release(target);
        }
        Ok(())
    }

    /// Chunk-0 lookup for a packet.
    #[inline]
    fn lookup(&self, meta: &PacketMeta, payload: &[u8]) -> u16 {
        let base = match meta.layer_offs(self.refer.layer()) {
            Some(b) => b,
            None => return self.missing_eq,
        };
        let start = base + self.offs as usize;
        let end = start + self.width as usize;
        if end > payload.len() {
            return self.missing_eq;
        }
        let v = if self.width == 1 {
            payload[start] as u16
        } else {
            u16::from_be_bytes([payload[start], payload[start + 1]])
        };
        self.entries[(v & self.mask) as usize]
    }
}

/// A phase 1..P-1 chunk combining one or two parents.
#[derive(Debug)]
struct UpperChunk {
    /// Parent chunk indexes in the previous phase
    parents: (usize, Option<usize>),
    /// Parent id-space sizes the entry table was built for
    spans: (usize, usize),
    entries: Vec<u16>,
    eq: EqClassTable,
}

/// RFC classifier backend.
pub struct RfcClassifier {
    lines: Vec<NumberLine>,
    /// Phases 1.. (phase 0 is the number lines)
    upper: Vec<Vec<UpperChunk>>,
    /// Final eqid -> sorted slot list
    rmap: Vec<Vec<u16>>,
    /// All installed slots
    all_slots: Bitmap,
    /// Installed rule uids (guards duplicate add/del)
    installed: BTreeSet<u32>,
    stats: ClassifierStats,
}

impl Default for RfcClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Effective anchor of a filter on the forward or reverse path.
fn anchor(f: &Filter, reverse: bool) -> (RefPoint, u16) {
    if reverse {
        if let Some(r) = f.reverse {
            return (r.refer, r.offs);
        }
    }
    (f.refer, f.offs)
}

/// Split a filter window into (piece offset within window, width) chunks.
fn pieces(len: u16) -> Vec<(u16, u8)> {
    let mut out = Vec::new();
    let mut off = 0;
    while len - off >= 2 {
        out.push((off, 2u8));
        off += 2;
    }
    if off < len {
        out.push((off, 1u8));
    }
    out
}

/// Big-endian piece of a byte slice, 1 or 2 bytes wide.
#[inline]
fn piece_value(bytes: &[u8], off: usize, width: u8) -> u16 {
    if width == 1 {
        bytes[off] as u16
    } else {
        u16::from_be_bytes([bytes[off], bytes[off + 1]])
    }
}

impl RfcClassifier {
    /// New empty classifier.
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            upper: Vec::new(),
            rmap: Vec::new(),
            all_slots: Bitmap::new(),
            installed: BTreeSet::new(),
            stats: ClassifierStats::default(),
        }
    }

    fn find_line(&self, refer: RefPoint, offs: u16, width: u8, mask: u16) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| l.refer == refer && l.offs == offs && l.width == width && l.mask == mask)
    }

    /// Project one slot of a rule onto the number lines, creating lines as
    /// needed. Returns whether a line was created.
    fn project_slot(&mut self, rule: &Rule, slot: u16, reverse: bool) -> MeterResult<bool> {
        let mut created = false;
        self.all_slots.set(slot as usize);

        for f in &rule.filters {
            if f.kind == MatchKind::Wild {
                continue; // no constraint, no line
            }
            let (refer, base_offs) = anchor(f, reverse);
            let mask = f.joined_mask();
            for (po, width) in pieces(f.len) {
                let pmask = piece_value(&mask, po as usize, width);
                let offs = base_offs + po;
                let idx = match self.find_line(refer, offs, width, pmask) {
                    Some(i) => i,
                    None => {
                        if self.lines.len() >= MAX_CHUNKS {
                            return Err(MeterError::ClassifierCapacity(format!(
                                "more than {MAX_CHUNKS} chunks required"
                            )));
                        }
                        let line = NumberLine::new(refer, offs, width, pmask, &self.all_slots)?;
                        self.lines.push(line);
                        created = true;
                        self.lines.len() - 1
                    }
                };
                let line = &mut self.lines[idx];
                line.constrained.set(slot as usize);
                line.unconstrained.reset(slot as usize);
                match f.kind {
                    MatchKind::Exact => {
                        let v = piece_value(&f.values[0], po as usize, width) & pmask;
                        line.add_point(v, PointKind::RuleStart, slot);
                        line.add_point(v, PointKind::RuleEnd, slot);
                    }
                    MatchKind::Range => {
                        let lo = piece_value(&f.values[0], po as usize, width) & pmask;
                        let hi = piece_value(&f.values[1], po as usize, width) & pmask;
                        // a mask can invert the endpoints; an empty range
                        // matches nothing, and with the slot constrained
                        // but pointless the rule can never match here
                        if lo <= hi {
                            line.add_point(lo, PointKind::RuleStart, slot);
                            line.add_point(hi, PointKind::RuleEnd, slot);
                        }
                    }
                    MatchKind::Set => {
                        for val in &f.values {
                            let v = piece_value(val, po as usize, width) & pmask;
                            line.add_point(v, PointKind::RuleStart, slot);
                            line.add_point(v, PointKind::RuleEnd, slot);
                        }
                    }
                    MatchKind::Wild => unreachable!(),
                }
            }
        }

        // the slot matches every value of the lines it has no predicate on
        for line in &mut self.lines {
            if !line.constrained.test(slot as usize) {
                line.unconstrained.set(slot as usize);
            }
        }
        Ok(created)
    }

    /// Remove one slot from every line. Returns whether a line died.
    fn unproject_slot(&mut self, slot: u16) -> bool {
        self.all_slots.reset(slot as usize);
        let before = self.lines.len();
        for line in &mut self.lines {
            line.remove_slot_points(slot);
            line.constrained.reset(slot as usize);
            line.unconstrained.reset(slot as usize);
        }
        // a line nobody constrains any more carries no information
        self.lines.retain(|l| !l.constrained.is_zero());
        self.lines.len() != before
    }

    /// Pair chunks of the previous phase until one remains.
    fn rebuild_structure(&mut self) -> MeterResult<()> {
        self.upper.clear();
        let mut count = self.lines.len();
        while count > 1 {
            let mut chunks = Vec::new();
            let mut i = 0;
            while i < count {
                let parents = if i + 1 < count {
                    (i, Some(i + 1))
                } else {
                    (i, None)
                };
                chunks.push(UpperChunk {
                    parents,
                    spans: (0, 0),
                    entries: Vec::new(),
                    eq: EqClassTable::with_prealloc(),
                });
                i += 2;
            }
            count = chunks.len();
            self.upper.push(chunks);
        }
        if self.upper.len() + 1 > MAX_PHASES {
            return Err(MeterError::ClassifierCapacity(format!(
                "more than {MAX_PHASES} phases required"
            )));
        }
        Ok(())
    }

    /// Re-intersect one upper chunk from its parents, reusing class ids
    /// for unchanged bitmaps.
    fn rebuild_chunk(&mut self, phase: usize, chunk: usize) -> MeterResult<()> {
        // parent id spaces and a closure-free way to read parent bitmaps:
        // split the borrow by taking the chunk out of the table
        let (pa, pb) = self.upper[phase][chunk].parents;
        let (span_a, span_b) = if phase == 0 {
            (
                self.lines[pa].eq.id_space(),
                pb.map(|b| self.lines[b].eq.id_space()).unwrap_or(1),
            )
        } else {
            (
                self.upper[phase - 1][pa].eq.id_space(),
                pb.map(|b| self.upper[phase - 1][b].eq.id_space())
                    .unwrap_or(1),
            )
        };

        let mut ch = std::mem::replace(
            &mut self.upper[phase][chunk],
            UpperChunk {
                parents: (pa, pb),
                spans: (0, 0),
                entries: Vec::new(),
                eq: EqClassTable::default(),
            },
        );

        let parent_live = |this: &Self, which: usize, id: usize| -> bool {
            if phase == 0 {
                this.lines[which].eq.is_live(id as u16)
            } else {
                this.upper[phase - 1][which].eq.is_live(id as u16)
            }
        };
        let parent_bm = |this: &Self, which: usize, id: usize| -> Bitmap {
            if phase == 0 {
                this.lines[which].eq.bitmap(id as u16).clone()
            } else {
                this.upper[phase - 1][which].eq.bitmap(id as u16).clone()
            }
        };

        let new_len = span_a * span_b;
        let resize = ch.entries.len() != new_len || ch.spans != (span_a, span_b);
        if resize {
            for &e in &ch.entries {
                if e != EQ_NONE {
                    ch.eq.release(e);
                }
            }
            ch.entries = vec![EQ_NONE; new_len];
            ch.spans = (span_a, span_b);
        }

        for ia in 0..span_a {
            if !parent_live(self, pa, ia) {
                for ib in 0..span_b {
                    let idx = ia * span_b + ib;
                    if ch.entries[idx] != EQ_NONE {
                        ch.eq.release(ch.entries[idx]);
                        ch.entries[idx] = EQ_NONE;
                    }
                }
                continue;
            }
            let bm_a = parent_bm(self, pa, ia);
            for ib in 0..span_b {
                let idx = ia * span_b + ib;
                let bm = match pb {
                    Some(b) => {
                        if !parent_live(self, b, ib) {
                            if ch.entries[idx] != EQ_NONE {
                                ch.eq.release(ch.entries[idx]);
                                ch.entries[idx] = EQ_NONE;
                            }
                            continue;
                        }
                        bm_a.and(&parent_bm(self, b, ib))
                    }
                    None => bm_a.clone(),
                };
                let old = ch.entries[idx];
                if old != EQ_NONE && ch.eq.bitmap(old) == &bm {
                    continue;
                }
                let id = ch.eq.acquire(&bm)?;
                if old != EQ_NONE {
                    ch.eq.release(old);
                }
                ch.entries[idx] = id;
            }
        }

        self.upper[phase][chunk] = ch;
        Ok(())
    }

    /// Expand the final phase's classes into sorted slot lists.
    fn rebuild_rule_map(&mut self) {
        let final_eq: &EqClassTable = match self.upper.last() {
            Some(phase) => &phase[0].eq,
            None => match self.lines.first() {
                Some(line) => &line.eq,
                None => {
                    self.rmap.clear();
                    return;
                }
            },
        };
        self.rmap = (0..final_eq.id_space())
            .map(|id| {
                if final_eq.is_live(id as u16) {
                    final_eq
                        .bitmap(id as u16)
                        .iter_ones()
                        .map(|s| s as u16)
                        .collect()
                } else {
                    Vec::new()
                }
            })
            .collect();
    }

    /// Recompute chunk-0 entries and re-intersect all phases.
    fn propagate(&mut self, structure_changed: bool) -> MeterResult<()> {
        if structure_changed {
            self.rebuild_structure()?;
        }
        for i in 0..self.lines.len() {
            self.lines[i].rebuild()?;
        }
        for p in 0..self.upper.len() {
            for c in 0..self.upper[p].len() {
                self.rebuild_chunk(p, c)?;
            }
        }
        self.rebuild_rule_map();
        Ok(())
    }

    fn check_rule(&self, rule: &Rule) -> MeterResult<()> {
        if rev_slot(rule.uid) >= MAX_RULES {
            return Err(MeterError::ClassifierCapacity(format!(
                "rule id {} exceeds {} slots",
                rule.uid, MAX_RULES
            )));
        }
        let mut anchors = HashSet::new();
        for f in &rule.filters {
            f.validate()?;
            // a range or set over a multi-chunk window is not expressible
            // as independent per-chunk predicates
            if f.len > 2 && matches!(f.kind, MatchKind::Range | MatchKind::Set) {
                return Err(MeterError::InvalidFilter(
                    f.name.clone(),
                    "range/set filters wider than 16 bits are not supported by the rfc backend"
                        .into(),
                ));
            }
            // two predicates on one window would need per-point
            // conjunction tracking
            if !anchors.insert((f.refer, f.offs)) {
                return Err(MeterError::InvalidFilter(
                    f.name.clone(),
                    "duplicate filter anchor within one rule".into(),
                ));
            }
        }
        Ok(())
    }

    /// Number of live number lines (for introspection and tests).
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    #[cfg(test)]
    fn snapshot(&self) -> (Vec<Vec<u16>>, Vec<u16>, Vec<Vec<u16>>) {
        // trailing freed classes only pad the rule map; ignore them the
        // way the free list is ignored
        let mut rmap = self.rmap.clone();
        while rmap.last().is_some_and(|v| v.is_empty()) {
            rmap.pop();
        }
        (
            self.lines.iter().map(|l| l.entries.clone()).collect(),
            self.lines.iter().map(|l| l.missing_eq).collect(),
            rmap,
        )
    }
}

impl Classifier for RfcClassifier {
    fn name(&self) -> &'static str {
        "rfc"
    }

    fn check_rules(&self, rules: &[&Rule]) -> MeterResult<()> {
        let mut new_lines: HashSet<(RefPoint, u16, u8, u16)> = HashSet::new();
        for rule in rules {
            self.check_rule(rule)?;
            for f in &rule.filters {
                if f.kind == MatchKind::Wild {
                    continue;
                }
                let mask = f.joined_mask();
                for dir in [false, true] {
                    if dir && !(rule.bidir && f.reverse.is_some()) {
                        continue;
                    }
                    let (refer, base) = anchor(f, dir);
                    for (po, width) in pieces(f.len) {
                        let pmask = piece_value(&mask, po as usize, width);
                        if self.find_line(refer, base + po, width, pmask).is_none() {
                            new_lines.insert((refer, base + po, width, pmask));
                        }
                    }
                }
            }
        }
        if self.lines.len() + new_lines.len() > MAX_CHUNKS {
            return Err(MeterError::ClassifierCapacity(format!(
                "rule set would require more than {MAX_CHUNKS} chunks"
            )));
        }
        Ok(())
    }

    fn add_rules(&mut self, rules: &[&Rule]) -> MeterResult<()> {
        for rule in rules {
            self.check_rule(rule)?;
        }
        let mut structure_changed = false;
        for rule in rules {
            if !self.installed.insert(rule.uid) {
                warn!(uid = rule.uid, "rule already installed, replacing");
            }
            let res = self
                .project_slot(rule, fwd_slot(rule.uid) as u16, false)
                .and_then(|c1| {
                    let mut c = c1;
                    if rule.bidir && rule.has_reverse_path() {
                        c |= self.project_slot(rule, rev_slot(rule.uid) as u16, true)?;
                    }
                    Ok(c)
                });
            match res {
                Ok(created) => {
                    structure_changed |= created;
                    self.stats.rules.inc();
                }
                Err(e) => {
                    // roll the partial projection back before bailing out
                    self.installed.remove(&rule.uid);
                    self.unproject_slot(fwd_slot(rule.uid) as u16);
                    self.unproject_slot(rev_slot(rule.uid) as u16);
                    if let Err(e2) = self.propagate(true) {
                        warn!(error = %e2, "rfc rollback propagate failed");
                    }
                    return Err(e);
                }
            }
        }
        self.propagate(structure_changed)?;
        debug!(
            lines = self.lines.len(),
            phases = self.upper.len() + 1,
            "rfc tables rebuilt"
        );
        Ok(())
    }

    fn del_rules(&mut self, rules: &[&Rule]) {
        let mut changed = false;
        let mut structure_changed = false;
        for rule in rules {
            if !self.installed.remove(&rule.uid) {
                continue;
            }
            structure_changed |= self.unproject_slot(fwd_slot(rule.uid) as u16);
            structure_changed |= self.unproject_slot(rev_slot(rule.uid) as u16);
            self.stats.rules.dec();
            changed = true;
        }
        if changed {
            // capacity errors cannot occur when removing state
            if let Err(e) = self.propagate(structure_changed) {
                warn!(error = %e, "rfc propagate after delete failed");
            }
        }
    }

    fn classify(&mut self, meta: &mut PacketMeta, payload: &[u8]) -> usize {
        meta.clear_matches();
        self.stats.packets.inc();
        if self.lines.is_empty() {
            return 0;
        }

        let mut ids = [0u16; MAX_CHUNKS];
        for (i, line) in self.lines.iter().enumerate() {
            ids[i] = line.lookup(meta, payload);
        }
        let mut count = self.lines.len();
        for phase in &self.upper {
            let mut next = [0u16; MAX_CHUNKS];
            for (c, chunk) in phase.iter().enumerate() {
                let ia = ids[chunk.parents.0] as usize;
                let idx = match chunk.parents.1 {
                    Some(b) => ia * chunk.spans.1 + ids[b] as usize,
                    None => ia,
                };
                next[c] = chunk.entries[idx];
                debug_assert_ne!(next[c], EQ_NONE);
            }
            ids = next;
            count = phase.len();
        }
        debug_assert_eq!(count, 1);

        let final_id = ids[0] as usize;
        let mut last_id = u32::MAX;
        if let Some(slots) = self.rmap.get(final_id) {
            for &slot in slots {
                let rid = (slot >> 1) as u32;
                if rid == last_id {
                    continue;
                }
                if !meta.push_match(rid) {
                    warn!(rid, "match list full, truncating");
                    break;
                }
                if slot & 1 == 1 {
                    meta.reverse = true;
                }
                last_id = rid;
            }
        }

        self.stats.matches.add(meta.match_cnt as u64);
        meta.match_cnt as usize
    }

    fn stats(&self) -> &ClassifierStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_common::{FlowTimeout, ModuleSpec, ReversePath, RuleState};

    fn filter(
        refer: RefPoint,
        offs: u16,
        len: u16,
        kind: MatchKind,
        values: Vec<Vec<u8>>,
    ) -> Filter {
        Filter {
            name: "f".into(),
            refer,
            offs,
            len,
            mask: vec![0xff; len as usize],
            def_mask: vec![0xff; len as usize],
            kind,
            values,
            reverse: None,
        }
    }

    fn rule(uid: u32, filters: Vec<Filter>) -> Rule {
        Rule {
            uid,
            set_name: "t".into(),
            rule_name: format!("r{uid}"),
            state: RuleState::New,
            start: 0,
            stop: None,
            duration_s: None,
            bidir: false,
            sep_paths: false,
            auto_flows: false,
            flow_timeout: FlowTimeout::Off,
            interval: None,
            filters,
            actions: vec![ModuleSpec::new("count")],
            exports: vec![ModuleSpec::new("text")],
        }
    }

    fn udp_packet() -> (PacketMeta, Vec<u8>) {
        let mut p = vec![0u8; 42];
        p[12] = 0x08;
        p[14] = 0x45;
        p[23] = 17;
        p[26..30].copy_from_slice(&[192, 168, 1, 1]);
        p[30..34].copy_from_slice(&[10, 0, 0, 1]);
        p[34..36].copy_from_slice(&5000u16.to_be_bytes());
        p[36..38].copy_from_slice(&53u16.to_be_bytes());
        let mut meta = PacketMeta::default();
        meta.cap_len = 42;
        meta.wire_len = 42;
        meta.offs = [0, 14, 34, 42];
        (meta, p)
    }

    #[test]
    fn test_single_exact_rule() {
        let mut c = RfcClassifier::new();
        let r = rule(
            0,
            vec![filter(RefPoint::Ip, 9, 1, MatchKind::Exact, vec![vec![17]])],
        );
        c.add_rules(&[&r]).unwrap();
        let (mut meta, p) = udp_packet();
        assert_eq!(c.classify(&mut meta, &p), 1);
        assert_eq!(meta.match_ids(), &[0]);

        // TCP misses
        let (mut meta, mut p) = udp_packet();
        p[23] = 6;
        assert_eq!(c.classify(&mut meta, &p), 0);
    }

    #[test]
    fn test_multi_field_conjunction() {
        let mut c = RfcClassifier::new();
        let r = rule(
            0,
            vec![
                filter(RefPoint::Ip, 9, 1, MatchKind::Exact, vec![vec![17]]),
                filter(
                    RefPoint::Trans,
                    2,
                    2,
                    MatchKind::Range,
                    vec![50u16.to_be_bytes().to_vec(), 60u16.to_be_bytes().to_vec()],
                ),
            ],
        );
        c.add_rules(&[&r]).unwrap();
        let (mut meta, p) = udp_packet();
        assert_eq!(c.classify(&mut meta, &p), 1); // dst port 53 in range

        let (mut meta, mut p) = udp_packet();
        p[36..38].copy_from_slice(&61u16.to_be_bytes());
        assert_eq!(c.classify(&mut meta, &p), 0);
    }

    #[test]
    fn test_ipv4_exact_spans_chunks() {
        let mut c = RfcClassifier::new();
        let r = rule(
            0,
            vec![filter(
                RefPoint::Ip,
                12,
                4,
                MatchKind::Exact,
                vec![vec![192, 168, 1, 1]],
            )],
        );
        c.add_rules(&[&r]).unwrap();
        assert_eq!(c.line_count(), 2); // two 16-bit chunks
        let (mut meta, p) = udp_packet();
        assert_eq!(c.classify(&mut meta, &p), 1);

        // first half matches, second half differs -> miss
        let (mut meta, mut p) = udp_packet();
        p[29] = 2;
        assert_eq!(c.classify(&mut meta, &p), 0);
    }

    #[test]
    fn test_rules_on_disjoint_fields() {
        let mut c = RfcClassifier::new();
        let r0 = rule(
            0,
            vec![filter(RefPoint::Ip, 9, 1, MatchKind::Exact, vec![vec![17]])],
        );
        let r1 = rule(
            1,
            vec![filter(
                RefPoint::Trans,
                2,
                2,
                MatchKind::Exact,
                vec![53u16.to_be_bytes().to_vec()],
            )],
        );
        c.add_rules(&[&r0, &r1]).unwrap();
        let (mut meta, p) = udp_packet();
        // both match: r0 on proto, r1 on dst port
        assert_eq!(c.classify(&mut meta, &p), 2);
        assert_eq!(meta.match_ids(), &[0, 1]);
    }

    #[test]
    fn test_missing_transport_layer() {
        let mut c = RfcClassifier::new();
        let r0 = rule(
            0,
            vec![filter(
                RefPoint::Trans,
                2,
                2,
                MatchKind::Exact,
                vec![53u16.to_be_bytes().to_vec()],
            )],
        );
        let r1 = rule(
            1,
            vec![filter(RefPoint::Ip, 9, 1, MatchKind::Exact, vec![vec![17]])],
        );
        c.add_rules(&[&r0, &r1]).unwrap();
        let (mut meta, p) = udp_packet();
        meta.offs[2] = -1;
        // rule 0 needs the transport header, rule 1 does not
        assert_eq!(c.classify(&mut meta, &p), 1);
        assert_eq!(meta.match_ids(), &[1]);
    }

    #[test]
    fn test_set_filter() {
        let mut c = RfcClassifier::new();
        let r = rule(
            0,
            vec![filter(
                RefPoint::Ip,
                9,
                1,
                MatchKind::Set,
                vec![vec![6], vec![17]],
            )],
        );
        c.add_rules(&[&r]).unwrap();
        let (mut meta, p) = udp_packet();
        assert_eq!(c.classify(&mut meta, &p), 1);
        let (mut meta, mut p) = udp_packet();
        p[23] = 1; // ICMP not in set
        assert_eq!(c.classify(&mut meta, &p), 0);
    }

    #[test]
    fn test_bidir_reverse() {
        let mut c = RfcClassifier::new();
        let mut src = filter(
            RefPoint::Ip,
            12,
            4,
            MatchKind::Exact,
            vec![vec![192, 168, 1, 1]],
        );
        src.reverse = Some(ReversePath {
            refer: RefPoint::Ip,
            offs: 16,
        });
        let mut r = rule(2, vec![src]);
        r.bidir = true;
        c.add_rules(&[&r]).unwrap();

        let (mut meta, p) = udp_packet();
        assert_eq!(c.classify(&mut meta, &p), 1);
        assert!(!meta.reverse);

        let (mut meta, mut p) = udp_packet();
        p[26..30].copy_from_slice(&[10, 0, 0, 1]);
        p[30..34].copy_from_slice(&[192, 168, 1, 1]);
        assert_eq!(c.classify(&mut meta, &p), 1);
        assert_eq!(meta.match_ids(), &[2]);
        assert!(meta.reverse);
    }

    #[test]
    fn test_wide_range_rejected() {
        let c = RfcClassifier::new();
        let r = rule(
            0,
            vec![filter(
                RefPoint::Ip,
                12,
                4,
                MatchKind::Range,
                vec![vec![10, 0, 0, 0], vec![10, 0, 255, 255]],
            )],
        );
        assert!(c.check_rules(&[&r]).is_err());
    }

    #[test]
    fn test_add_del_restores_tables() {
        let mut c = RfcClassifier::new();
        let r0 = rule(
            0,
            vec![filter(RefPoint::Ip, 9, 1, MatchKind::Exact, vec![vec![17]])],
        );
        c.add_rules(&[&r0]).unwrap();
        let before = c.snapshot();

        let r1 = rule(
            1,
            vec![filter(
                RefPoint::Trans,
                2,
                2,
                MatchKind::Range,
                vec![50u16.to_be_bytes().to_vec(), 60u16.to_be_bytes().to_vec()],
            )],
        );
        c.add_rules(&[&r1]).unwrap();
        c.del_rules(&[&r1]);

        assert_eq!(c.snapshot(), before);
        let (mut meta, p) = udp_packet();
        assert_eq!(c.classify(&mut meta, &p), 1);
        assert_eq!(meta.match_ids(), &[0]);
    }

    #[test]
    fn test_mask_prefix_match() {
        let mut c = RfcClassifier::new();
        let mut f = filter(
            RefPoint::Ip,
            12,
            4,
            MatchKind::Exact,
            vec![vec![192, 168, 0, 0]],
        );
        f.mask = vec![0xff, 0xff, 0, 0];
        let r = rule(0, vec![f]);
        c.add_rules(&[&r]).unwrap();
        let (mut meta, p) = udp_packet();
        assert_eq!(c.classify(&mut meta, &p), 1);
        let (mut meta, mut p) = udp_packet();
        p[26] = 10;
        assert_eq!(c.classify(&mut meta, &p), 0);
    }

    #[test]
    fn test_capacity_error_leaves_no_state() {
        let mut c = RfcClassifier::new();
        // a valid rule first
        let r0 = rule(
            0,
            vec![filter(RefPoint::Ip, 9, 1, MatchKind::Exact, vec![vec![17]])],
        );
        c.add_rules(&[&r0]).unwrap();
        // a rule beyond the slot space
        let bad = rule(
            (MAX_RULES / 2) as u32,
            vec![filter(RefPoint::Ip, 9, 1, MatchKind::Exact, vec![vec![6]])],
        );
        assert!(c.add_rules(&[&bad]).is_err());
        // the good rule still works
        let (mut meta, p) = udp_packet();
        assert_eq!(c.classify(&mut meta, &p), 1);
    }
}
