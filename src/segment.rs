//! Top and bottom segments and the iterators that walk them.
//!
//! A top segment is an aligned interval whose homolog lies in the parent
//! genome; a bottom segment's homologs lie in each child. Iterators are
//! plain values pinning one segment index plus a sub-interval within it, so
//! fractional segments stay representable after crossing an edge where
//! segmentations do not line up. Cloning an iterator yields an independent
//! cursor.

use crate::alignment::MmapAlignment;
use crate::mmap_store::Persistent;
use std::cmp::{max, min};

/// Sentinel for "no segment" in the index links.
pub const NULL_INDEX: i64 = -1;
/// Sentinel end offset meaning "to the end of the segment".
pub const SLICE_END: u64 = u64::MAX;

/// Aligned interval whose homolog lies in the parent genome.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TopSegmentRecord {
    pub start: i64,
    pub length: i64,
    /// Bottom segment in the parent this aligns to, or `NULL_INDEX`.
    pub parent_index: i64,
    /// Orientation relative to the parent segment.
    pub parent_reversed: u8,
    pad: [u8; 7],
    /// Next top segment sharing the same parent segment, forming a cyclic
    /// ring within this genome. `NULL_INDEX` when unduplicated.
    pub paralogy_next: i64,
    /// Bottom segment of the same genome overlapping this position.
    pub bottom_parse_index: i64,
}

impl TopSegmentRecord {
    pub fn new(
        start: i64,
        length: i64,
        parent_index: i64,
        parent_reversed: bool,
        paralogy_next: i64,
        bottom_parse_index: i64,
    ) -> TopSegmentRecord {
        TopSegmentRecord {
            start,
            length,
            parent_index,
            parent_reversed: parent_reversed as u8,
            pad: [0; 7],
            paralogy_next,
            bottom_parse_index,
        }
    }
}

/// Aligned interval whose homologs lie in the child genomes. The per-child
/// slots live in a parallel array, `child_count` per segment.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BottomSegmentRecord {
    pub start: i64,
    pub length: i64,
    /// Top segment of the same genome overlapping this position.
    pub top_parse_index: i64,
}

impl BottomSegmentRecord {
    pub fn new(start: i64, length: i64, top_parse_index: i64) -> BottomSegmentRecord {
        BottomSegmentRecord {
            start,
            length,
            top_parse_index,
        }
    }
}

/// Per-child alignment slot of a bottom segment.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ChildSlotRecord {
    /// Top segment index in the child genome, or `NULL_INDEX`.
    pub top_index: i64,
    pub reversed: u8,
    pad: [u8; 7],
}

impl ChildSlotRecord {
    pub fn new(top_index: i64, reversed: bool) -> ChildSlotRecord {
        ChildSlotRecord {
            top_index,
            reversed: reversed as u8,
            pad: [0; 7],
        }
    }

    pub fn null() -> ChildSlotRecord {
        ChildSlotRecord::new(NULL_INDEX, false)
    }
}

unsafe impl Persistent for TopSegmentRecord {}
unsafe impl Persistent for BottomSegmentRecord {}
unsafe impl Persistent for ChildSlotRecord {}

/// Cursor over a genome's top segment table.
///
/// Coordinates reported by the accessors are always forward-strand; the
/// `reversed` flag flips traversal direction and sequence orientation, never
/// the stored data.
#[derive(Clone)]
pub struct TopSegmentIterator<'a> {
    aln: &'a MmapAlignment,
    genome: u32,
    index: i64,
    start_offset: u64,
    end_offset: u64,
    reversed: bool,
}

/// Cursor over a genome's bottom segment table.
#[derive(Clone)]
pub struct BottomSegmentIterator<'a> {
    aln: &'a MmapAlignment,
    genome: u32,
    index: i64,
    start_offset: u64,
    end_offset: u64,
    reversed: bool,
}

impl<'a> TopSegmentIterator<'a> {
    pub(crate) fn new(aln: &'a MmapAlignment, genome: u32, index: i64) -> TopSegmentIterator<'a> {
        TopSegmentIterator {
            aln,
            genome,
            index,
            start_offset: 0,
            end_offset: SLICE_END,
            reversed: false,
        }
    }

    pub fn record(&self) -> &'a TopSegmentRecord {
        self.aln.top_record(self.genome, self.index)
    }

    pub fn genome(&self) -> u32 {
        self.genome
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn reversed(&self) -> bool {
        self.reversed
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    fn effective_end(&self) -> u64 {
        if self.end_offset == SLICE_END {
            self.record().length as u64
        } else {
            self.end_offset
        }
    }

    pub fn length(&self) -> u64 {
        self.effective_end() - self.start_offset
    }

    /// Leftmost forward-strand genome coordinate of the sub-interval.
    pub fn start_position(&self) -> i64 {
        self.record().start + self.start_offset as i64
    }

    pub fn end_position(&self) -> i64 {
        self.record().start + self.effective_end() as i64
    }

    /// Pin the cursor to a sub-interval, offsets in bases from the segment's
    /// native start.
    pub fn sliced(&self, start_offset: u64, end_offset: u64) -> TopSegmentIterator<'a> {
        debug_assert!(start_offset < self.effective_end_of(end_offset));
        let mut it = self.clone();
        it.start_offset = start_offset;
        it.end_offset = end_offset;
        it
    }

    fn effective_end_of(&self, end_offset: u64) -> u64 {
        if end_offset == SLICE_END {
            self.record().length as u64
        } else {
            end_offset
        }
    }

    /// Intersect the cursor with a forward-coordinate window, or `None` when
    /// they do not overlap.
    pub fn windowed(&self, a: i64, b: i64) -> Option<TopSegmentIterator<'a>> {
        let s = max(a, self.start_position());
        let e = min(b, self.end_position());
        if s >= e {
            return None;
        }
        let base = self.record().start;
        Some(self.sliced((s - base) as u64, (e - base) as u64))
    }

    /// Advance one segment leftward in coordinate order; reversed cursors
    /// move the other way. The sub-interval resets to the whole segment.
    pub fn to_left(&mut self) -> bool {
        self.step(if self.reversed { 1 } else { -1 })
    }

    pub fn to_right(&mut self) -> bool {
        self.step(if self.reversed { -1 } else { 1 })
    }

    fn step(&mut self, delta: i64) -> bool {
        let next = self.index + delta;
        if next < 0 || next as u64 >= self.aln.genome_at(self.genome).num_top_segments() {
            return false;
        }
        self.index = next;
        self.start_offset = 0;
        self.end_offset = SLICE_END;
        true
    }

    /// Homologous bottom segment in the parent genome, sliced to the same
    /// sub-interval. The result's length equals this cursor's length and its
    /// reversal is the XOR of the cursor's with the edge's.
    pub fn parent(&self) -> Option<BottomSegmentIterator<'a>> {
        let rec = self.record();
        if rec.parent_index == NULL_INDEX {
            return None;
        }
        let parent_genome = self.aln.genome_at(self.genome).parent()?;
        let edge_reversed = rec.parent_reversed != 0;
        let len = rec.length as u64;
        let (s, e) = (self.start_offset, self.effective_end());
        let (ps, pe) = if edge_reversed {
            (len - e, len - s)
        } else {
            (s, e)
        };
        Some(BottomSegmentIterator {
            aln: self.aln,
            genome: parent_genome,
            index: rec.parent_index,
            start_offset: ps,
            end_offset: pe,
            reversed: self.reversed ^ edge_reversed,
        })
    }

    /// Step along the paralogy ring. The sub-interval is carried through the
    /// shared parent segment so both cursors cover homologous bases.
    pub fn next_paralogy(&self) -> Option<TopSegmentIterator<'a>> {
        let rec = self.record();
        if rec.paralogy_next == NULL_INDEX {
            return None;
        }
        let other = self.aln.top_record(self.genome, rec.paralogy_next);
        debug_assert_eq!(rec.length, other.length);
        let len = rec.length as u64;
        let self_rev = rec.parent_reversed != 0;
        let other_rev = other.parent_reversed != 0;
        let (s, e) = (self.start_offset, self.effective_end());
        let (ps, pe) = if self_rev { (len - e, len - s) } else { (s, e) };
        let (os, oe) = if other_rev { (len - pe, len - ps) } else { (ps, pe) };
        Some(TopSegmentIterator {
            aln: self.aln,
            genome: self.genome,
            index: rec.paralogy_next,
            start_offset: os,
            end_offset: oe,
            reversed: self.reversed ^ self_rev ^ other_rev,
        })
    }

    /// First bottom segment of the same genome overlapping the cursor's
    /// sub-interval, sliced to the overlap. Entry point is the stored parse
    /// index; `None` in genomes without bottom segments.
    pub fn parse_down(&self) -> Option<BottomSegmentIterator<'a>> {
        let rec = self.record();
        if rec.bottom_parse_index == NULL_INDEX {
            return None;
        }
        let (a, b) = (self.start_position(), self.end_position());
        let n = self.aln.genome_at(self.genome).num_bottom_segments();
        let mut idx = rec.bottom_parse_index;
        loop {
            if idx < 0 || idx as u64 >= n {
                return None;
            }
            let brec = self.aln.bottom_record(self.genome, idx);
            if brec.start + brec.length > a {
                break;
            }
            idx += 1;
        }
        let brec = self.aln.bottom_record(self.genome, idx);
        if brec.start >= b {
            return None;
        }
        Some(BottomSegmentIterator {
            aln: self.aln,
            genome: self.genome,
            index: idx,
            start_offset: (max(a, brec.start) - brec.start) as u64,
            end_offset: (min(b, brec.start + brec.length) - brec.start) as u64,
            reversed: self.reversed,
        })
    }

    /// Materialize the cursor's bases, reverse-complemented when reversed.
    pub fn sequence(&self, out: &mut Vec<u8>) {
        let bases = self
            .aln
            .dna_slice(self.genome, self.start_position(), self.end_position());
        out.clear();
        if self.reversed {
            out.extend(reverse_complement(bases));
        } else {
            out.extend_from_slice(bases);
        }
    }
}

impl<'a> BottomSegmentIterator<'a> {
    pub(crate) fn new(
        aln: &'a MmapAlignment,
        genome: u32,
        index: i64,
    ) -> BottomSegmentIterator<'a> {
        BottomSegmentIterator {
            aln,
            genome,
            index,
            start_offset: 0,
            end_offset: SLICE_END,
            reversed: false,
        }
    }

    pub fn record(&self) -> &'a BottomSegmentRecord {
        self.aln.bottom_record(self.genome, self.index)
    }

    pub fn genome(&self) -> u32 {
        self.genome
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn reversed(&self) -> bool {
        self.reversed
    }

    fn effective_end(&self) -> u64 {
        if self.end_offset == SLICE_END {
            self.record().length as u64
        } else {
            self.end_offset
        }
    }

    pub fn length(&self) -> u64 {
        self.effective_end() - self.start_offset
    }

    pub fn start_position(&self) -> i64 {
        self.record().start + self.start_offset as i64
    }

    pub fn end_position(&self) -> i64 {
        self.record().start + self.effective_end() as i64
    }

    pub fn sliced(&self, start_offset: u64, end_offset: u64) -> BottomSegmentIterator<'a> {
        let mut it = self.clone();
        it.start_offset = start_offset;
        it.end_offset = end_offset;
        it
    }

    pub fn windowed(&self, a: i64, b: i64) -> Option<BottomSegmentIterator<'a>> {
        let s = max(a, self.start_position());
        let e = min(b, self.end_position());
        if s >= e {
            return None;
        }
        let base = self.record().start;
        Some(self.sliced((s - base) as u64, (e - base) as u64))
    }

    pub fn to_left(&mut self) -> bool {
        self.step(if self.reversed { 1 } else { -1 })
    }

    pub fn to_right(&mut self) -> bool {
        self.step(if self.reversed { -1 } else { 1 })
    }

    fn step(&mut self, delta: i64) -> bool {
        let next = self.index + delta;
        if next < 0 || next as u64 >= self.aln.genome_at(self.genome).num_bottom_segments() {
            return false;
        }
        self.index = next;
        self.start_offset = 0;
        self.end_offset = SLICE_END;
        true
    }

    /// Homologous top segment in the child genome at `child_pos` (position
    /// in this genome's child list), or `None` when the slot is unaligned.
    pub fn child(&self, child_pos: usize) -> Option<TopSegmentIterator<'a>> {
        let slot = self.aln.child_slot(self.genome, self.index, child_pos);
        if slot.top_index == NULL_INDEX {
            return None;
        }
        let child_genome = self.aln.genome_at(self.genome).children()[child_pos];
        let edge_reversed = slot.reversed != 0;
        let len = self.record().length as u64;
        let (s, e) = (self.start_offset, self.effective_end());
        let (cs, ce) = if edge_reversed {
            (len - e, len - s)
        } else {
            (s, e)
        };
        Some(TopSegmentIterator {
            aln: self.aln,
            genome: child_genome,
            index: slot.top_index,
            start_offset: cs,
            end_offset: ce,
            reversed: self.reversed ^ edge_reversed,
        })
    }

    /// First top segment of the same genome overlapping the cursor's
    /// sub-interval, sliced to the overlap.
    pub fn parse_up(&self) -> Option<TopSegmentIterator<'a>> {
        let rec = self.record();
        if rec.top_parse_index == NULL_INDEX {
            return None;
        }
        let (a, b) = (self.start_position(), self.end_position());
        let n = self.aln.genome_at(self.genome).num_top_segments();
        let mut idx = rec.top_parse_index;
        loop {
            if idx < 0 || idx as u64 >= n {
                return None;
            }
            let trec = self.aln.top_record(self.genome, idx);
            if trec.start + trec.length > a {
                break;
            }
            idx += 1;
        }
        let trec = self.aln.top_record(self.genome, idx);
        if trec.start >= b {
            return None;
        }
        Some(TopSegmentIterator {
            aln: self.aln,
            genome: self.genome,
            index: idx,
            start_offset: (max(a, trec.start) - trec.start) as u64,
            end_offset: (min(b, trec.start + trec.length) - trec.start) as u64,
            reversed: self.reversed,
        })
    }

    pub fn sequence(&self, out: &mut Vec<u8>) {
        let bases = self
            .aln
            .dna_slice(self.genome, self.start_position(), self.end_position());
        out.clear();
        if self.reversed {
            out.extend(reverse_complement(bases));
        } else {
            out.extend_from_slice(bases);
        }
    }
}

pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&base| complement(base)).collect()
}

pub fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'a' => b't',
        b'T' => b'A',
        b't' => b'a',
        b'C' => b'G',
        b'c' => b'g',
        b'G' => b'C',
        b'g' => b'c',
        _ => base,
    }
}
