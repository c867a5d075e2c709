use crate::mmap_store::Offset;
use crate::segment::{BottomSegmentRecord, ChildSlotRecord, TopSegmentRecord};
use rustc_hash::FxHashMap;

/// One named sequence inside a genome.
///
/// Genomes concatenate their sequences into a single coordinate space; a
/// sequence occupies `[start, start + length)` of it.
#[derive(Clone, Debug)]
pub struct Sequence {
    pub name: String,
    pub start: u64,
    pub length: u64,
}

impl Sequence {
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Named node of the alignment tree, materialized from the store on open.
///
/// Segment tables and DNA stay in the mapping; the genome only records where
/// they live.
#[derive(Debug)]
pub struct Genome {
    pub(crate) index: u32,
    pub(crate) name: String,
    pub(crate) parent: Option<u32>,
    pub(crate) children: Vec<u32>,
    pub(crate) sequences: Vec<Sequence>,
    pub(crate) seq_by_name: FxHashMap<String, usize>,
    pub(crate) tops: Offset<TopSegmentRecord>,
    pub(crate) top_count: u64,
    pub(crate) bottoms: Offset<BottomSegmentRecord>,
    pub(crate) bottom_count: u64,
    pub(crate) child_slots: Offset<ChildSlotRecord>,
    pub(crate) dna: Offset<u8>,
    pub(crate) dna_len: u64,
}

impl Genome {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    pub fn children(&self) -> &[u32] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Total length of the genome's coordinate space.
    pub fn length(&self) -> u64 {
        self.dna_len
    }

    pub fn num_top_segments(&self) -> u64 {
        self.top_count
    }

    pub fn num_bottom_segments(&self) -> u64 {
        self.bottom_count
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequence(&self, name: &str) -> Option<&Sequence> {
        self.seq_by_name.get(name).map(|&i| &self.sequences[i])
    }

    /// Sequence containing the genome coordinate `pos`.
    pub fn sequence_at(&self, pos: u64) -> Option<&Sequence> {
        if self.sequences.is_empty() {
            return None;
        }
        let i = self.sequences.partition_point(|s| s.start <= pos);
        if i == 0 {
            return None;
        }
        let seq = &self.sequences[i - 1];
        (pos < seq.end()).then_some(seq)
    }

    pub(crate) fn insert_sequence(&mut self, seq: Sequence) {
        self.seq_by_name
            .insert(seq.name.clone(), self.sequences.len());
        self.sequences.push(seq);
    }
}
