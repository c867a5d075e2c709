//! Alignment navigator: the genome tree materialized over a mapped store.
//!
//! `MmapAlignment` is the read side consumed by the lift-over engine; it
//! resolves genomes by name, hands out segment iterators and answers the
//! tree-topology questions the bounded walk needs. `AlignmentWriter` is the
//! single write path, laying out a whole alignment into a fresh store.

use crate::genome::{Genome, Sequence};
use crate::mmap_store::{
    AccessMode, MmapStore, Offset, PageFetcher, Persistent, StoreError,
};
use crate::segment::{
    BottomSegmentIterator, BottomSegmentRecord, ChildSlotRecord, TopSegmentIterator,
    TopSegmentRecord, NULL_INDEX,
};
use log::debug;
use rustc_hash::FxHashMap;
use std::mem::size_of;
use std::path::Path;

#[repr(C)]
#[derive(Clone, Copy)]
struct StrRecord {
    offset: Offset<u8>,
    len: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RootRecord {
    genome_count: u64,
    genomes: Offset<GenomeRecord>,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct GenomeRecord {
    name: StrRecord,
    parent: i64,
    child_count: u64,
    children: Offset<u64>,
    sequence_count: u64,
    sequences: Offset<SequenceRecord>,
    top_count: u64,
    tops: Offset<TopSegmentRecord>,
    bottom_count: u64,
    bottoms: Offset<BottomSegmentRecord>,
    child_slots: Offset<ChildSlotRecord>,
    dna: Offset<u8>,
    dna_len: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SequenceRecord {
    name: StrRecord,
    start: u64,
    length: u64,
}

unsafe impl Persistent for StrRecord {}
unsafe impl Persistent for RootRecord {}
unsafe impl Persistent for GenomeRecord {}
unsafe impl Persistent for SequenceRecord {}

/// Read handle over a stored alignment.
pub struct MmapAlignment {
    store: MmapStore,
    genomes: Vec<Genome>,
    by_name: FxHashMap<String, u32>,
}

impl MmapAlignment {
    pub fn open<P: AsRef<Path>>(path: P, mode: AccessMode) -> Result<MmapAlignment, StoreError> {
        let store = MmapStore::open(path, mode)?;
        Self::from_store(store)
    }

    /// Open read-only with a prefetch hook forced on every resolution, for
    /// mappings backed by a remote transport. The whole mapping is also
    /// advised in up front.
    pub fn open_preload<P: AsRef<Path>>(
        path: P,
        fetcher: Box<dyn PageFetcher>,
    ) -> Result<MmapAlignment, StoreError> {
        let store = MmapStore::open_with_fetcher(path, AccessMode::ReadOnly, fetcher)?;
        store.warm();
        Self::from_store(store)
    }

    fn from_store(store: MmapStore) -> Result<MmapAlignment, StoreError> {
        let root: RootRecord = *store.view(store.root_offset());
        let mut genomes = Vec::with_capacity(root.genome_count as usize);
        let mut by_name = FxHashMap::default();
        for i in 0..root.genome_count {
            let rec: GenomeRecord =
                store.slice(root.genomes, root.genome_count)[i as usize];
            let name = read_str(&store, &rec.name);
            let parent = (rec.parent != NULL_INDEX).then_some(rec.parent as u32);
            let children = store
                .slice(rec.children, rec.child_count)
                .iter()
                .map(|&c| c as u32)
                .collect();
            let mut genome = Genome {
                index: i as u32,
                name: name.clone(),
                parent,
                children,
                sequences: Vec::with_capacity(rec.sequence_count as usize),
                seq_by_name: FxHashMap::default(),
                tops: rec.tops,
                top_count: rec.top_count,
                bottoms: rec.bottoms,
                bottom_count: rec.bottom_count,
                child_slots: rec.child_slots,
                dna: rec.dna,
                dna_len: rec.dna_len,
            };
            for s in 0..rec.sequence_count {
                let srec: SequenceRecord =
                    store.slice(rec.sequences, rec.sequence_count)[s as usize];
                genome.insert_sequence(Sequence {
                    name: read_str(&store, &srec.name),
                    start: srec.start,
                    length: srec.length,
                });
            }
            by_name.insert(name, i as u32);
            genomes.push(genome);
        }
        debug!(
            "opened alignment {} with {} genomes",
            store.path().display(),
            genomes.len()
        );
        Ok(MmapAlignment {
            store,
            genomes,
            by_name,
        })
    }

    pub fn store(&self) -> &MmapStore {
        &self.store
    }

    pub fn num_genomes(&self) -> usize {
        self.genomes.len()
    }

    pub fn genome(&self, name: &str) -> Option<&Genome> {
        self.by_name.get(name).map(|&i| &self.genomes[i as usize])
    }

    pub fn genome_at(&self, index: u32) -> &Genome {
        &self.genomes[index as usize]
    }

    pub fn top_iter(&self, genome: u32, index: i64) -> TopSegmentIterator<'_> {
        TopSegmentIterator::new(self, genome, index)
    }

    pub fn bottom_iter(&self, genome: u32, index: i64) -> BottomSegmentIterator<'_> {
        BottomSegmentIterator::new(self, genome, index)
    }

    /// True when `anc` lies on the parent chain of `node` (a genome is its
    /// own ancestor).
    pub fn is_ancestor(&self, anc: u32, node: u32) -> bool {
        let mut cur = Some(node);
        while let Some(g) = cur {
            if g == anc {
                return true;
            }
            cur = self.genomes[g as usize].parent;
        }
        false
    }

    /// Lowest common ancestor of two genomes.
    pub fn lca(&self, a: u32, b: u32) -> u32 {
        let mut seen = Vec::new();
        let mut cur = Some(a);
        while let Some(g) = cur {
            seen.push(g);
            cur = self.genomes[g as usize].parent;
        }
        let mut cur = Some(b);
        while let Some(g) = cur {
            if seen.contains(&g) {
                return g;
            }
            cur = self.genomes[g as usize].parent;
        }
        // Both chains end at the same root in a well-formed store.
        unreachable!("genomes {} and {} share no ancestor", a, b)
    }

    /// Parent chain from `node` up to and including `anc`.
    pub fn path_up(&self, node: u32, anc: u32) -> Vec<u32> {
        let mut path = vec![node];
        let mut cur = node;
        while cur != anc {
            let parent = self.genomes[cur as usize]
                .parent
                .expect("path_up target is not an ancestor");
            path.push(parent);
            cur = parent;
        }
        path
    }

    /// Chain from the ancestor `anc` down to and including `node`.
    pub fn path_down(&self, anc: u32, node: u32) -> Vec<u32> {
        let mut path = self.path_up(node, anc);
        path.reverse();
        path
    }

    /// Position of `child` in `parent`'s child list.
    pub fn child_position(&self, parent: u32, child: u32) -> Option<usize> {
        self.genomes[parent as usize]
            .children
            .iter()
            .position(|&c| c == child)
    }

    pub(crate) fn top_record(&self, genome: u32, index: i64) -> &TopSegmentRecord {
        let g = &self.genomes[genome as usize];
        &self.store.slice(g.tops, g.top_count)[index as usize]
    }

    pub(crate) fn bottom_record(&self, genome: u32, index: i64) -> &BottomSegmentRecord {
        let g = &self.genomes[genome as usize];
        &self.store.slice(g.bottoms, g.bottom_count)[index as usize]
    }

    pub(crate) fn child_slot(&self, genome: u32, index: i64, child_pos: usize) -> ChildSlotRecord {
        let g = &self.genomes[genome as usize];
        let width = g.children.len() as u64;
        debug_assert!((child_pos as u64) < width);
        self.store.slice(g.child_slots, g.bottom_count * width)
            [index as usize * width as usize + child_pos]
    }

    pub(crate) fn dna_slice(&self, genome: u32, start: i64, end: i64) -> &[u8] {
        let g = &self.genomes[genome as usize];
        debug_assert!(0 <= start && start <= end && end as u64 <= g.dna_len);
        self.store
            .bytes(g.dna.raw() + start as u64, (end - start) as u64)
    }

    /// Index of the first top segment ending after genome coordinate `pos`,
    /// i.e. the segment containing it or the next one to its right.
    pub(crate) fn top_index_from(&self, genome: u32, pos: i64) -> Option<i64> {
        let g = &self.genomes[genome as usize];
        let tops = self.store.slice(g.tops, g.top_count);
        let i = tops.partition_point(|r| r.start + r.length <= pos);
        (i < tops.len()).then_some(i as i64)
    }

    pub(crate) fn bottom_index_from(&self, genome: u32, pos: i64) -> Option<i64> {
        let g = &self.genomes[genome as usize];
        let bottoms = self.store.slice(g.bottoms, g.bottom_count);
        let i = bottoms.partition_point(|r| r.start + r.length <= pos);
        (i < bottoms.len()).then_some(i as i64)
    }
}

fn read_str(store: &MmapStore, rec: &StrRecord) -> String {
    String::from_utf8_lossy(store.bytes(rec.offset.raw(), rec.len)).into_owned()
}

/// In-memory definition of one genome handed to the writer.
#[derive(Debug, Default, Clone)]
pub struct GenomeDef {
    pub name: String,
    pub parent: Option<String>,
    pub sequences: Vec<SequenceDef>,
    pub top_segments: Vec<TopSegmentDef>,
    pub bottom_segments: Vec<BottomSegmentDef>,
}

#[derive(Debug, Clone)]
pub struct SequenceDef {
    pub name: String,
    pub bases: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TopSegmentDef {
    pub start: i64,
    pub length: i64,
    pub parent_index: i64,
    pub parent_reversed: bool,
    pub paralogy_next: i64,
    pub bottom_parse_index: i64,
}

#[derive(Debug, Clone)]
pub struct BottomSegmentDef {
    pub start: i64,
    pub length: i64,
    pub top_parse_index: i64,
    pub children: Vec<ChildSlotDef>,
}

#[derive(Debug, Clone)]
pub struct ChildSlotDef {
    pub top_index: i64,
    pub reversed: bool,
}

/// Builds a new alignment store. Genomes are laid out in the order added;
/// `finish` writes the root object last and closes the store clean.
pub struct AlignmentWriter {
    store: MmapStore,
    defs: Vec<GenomeDef>,
}

impl AlignmentWriter {
    pub fn create<P: AsRef<Path>>(path: P, file_size: u64) -> Result<AlignmentWriter, StoreError> {
        let store = MmapStore::create(path, file_size)?;
        Ok(AlignmentWriter {
            store,
            defs: Vec::new(),
        })
    }

    pub fn add_genome(&mut self, def: GenomeDef) {
        self.defs.push(def);
    }

    pub fn finish(mut self) -> Result<(), StoreError> {
        let mut index_of = FxHashMap::default();
        for (i, def) in self.defs.iter().enumerate() {
            if index_of.insert(def.name.clone(), i as i64).is_some() {
                return Err(StoreError::InvalidLayout(format!(
                    "duplicate genome name '{}'",
                    def.name
                )));
            }
        }
        let mut parents = Vec::with_capacity(self.defs.len());
        let mut children: Vec<Vec<u64>> = vec![Vec::new(); self.defs.len()];
        for (i, def) in self.defs.iter().enumerate() {
            let parent = match &def.parent {
                None => NULL_INDEX,
                Some(name) => *index_of.get(name).ok_or_else(|| {
                    StoreError::InvalidLayout(format!(
                        "genome '{}' names unknown parent '{}'",
                        def.name, name
                    ))
                })?,
            };
            if parent != NULL_INDEX {
                children[parent as usize].push(i as u64);
            }
            parents.push(parent);
        }
        for (i, def) in self.defs.iter().enumerate() {
            let width = children[i].len();
            for (b, bottom) in def.bottom_segments.iter().enumerate() {
                if bottom.children.len() != width {
                    return Err(StoreError::InvalidLayout(format!(
                        "genome '{}' bottom segment {} has {} child slots, expected {}",
                        def.name,
                        b,
                        bottom.children.len(),
                        width
                    )));
                }
            }
        }

        let defs = std::mem::take(&mut self.defs);
        let genome_array = self.store.alloc(
            defs.len() as u64 * size_of::<GenomeRecord>() as u64,
            false,
        )?;
        for (i, def) in defs.iter().enumerate() {
            let rec = self.write_genome(def, parents[i], &children[i])?;
            *self
                .store
                .view_mut::<GenomeRecord>(genome_array + (i * size_of::<GenomeRecord>()) as u64) =
                rec;
        }
        let root_off = self.store.alloc(size_of::<RootRecord>() as u64, true)?;
        *self.store.view_mut::<RootRecord>(root_off) = RootRecord {
            genome_count: defs.len() as u64,
            genomes: Offset::new(genome_array),
        };
        self.store.close()
    }

    fn write_genome(
        &mut self,
        def: &GenomeDef,
        parent: i64,
        children: &[u64],
    ) -> Result<GenomeRecord, StoreError> {
        let name = self.write_str(&def.name)?;
        let children_off = self.write_array_u64(children)?;

        let mut seq_recs = Vec::with_capacity(def.sequences.len());
        let mut dna = Vec::new();
        for seq in &def.sequences {
            let srec = SequenceRecord {
                name: self.write_str(&seq.name)?,
                start: dna.len() as u64,
                length: seq.bases.len() as u64,
            };
            dna.extend_from_slice(&seq.bases);
            seq_recs.push(srec);
        }
        let sequences = self.alloc_array::<SequenceRecord>(seq_recs.len())?;
        self.store
            .array_mut::<SequenceRecord>(sequences.raw(), seq_recs.len() as u64)
            .copy_from_slice(&seq_recs);

        let dna_off = self.store.alloc(dna.len() as u64, false)?;
        self.store
            .bytes_mut(dna_off, dna.len() as u64)
            .copy_from_slice(&dna);

        let top_recs: Vec<TopSegmentRecord> = def
            .top_segments
            .iter()
            .map(|t| {
                TopSegmentRecord::new(
                    t.start,
                    t.length,
                    t.parent_index,
                    t.parent_reversed,
                    t.paralogy_next,
                    t.bottom_parse_index,
                )
            })
            .collect();
        let tops = self.alloc_array::<TopSegmentRecord>(top_recs.len())?;
        self.store
            .array_mut::<TopSegmentRecord>(tops.raw(), top_recs.len() as u64)
            .copy_from_slice(&top_recs);

        let bottom_recs: Vec<BottomSegmentRecord> = def
            .bottom_segments
            .iter()
            .map(|b| BottomSegmentRecord::new(b.start, b.length, b.top_parse_index))
            .collect();
        let bottoms = self.alloc_array::<BottomSegmentRecord>(bottom_recs.len())?;
        self.store
            .array_mut::<BottomSegmentRecord>(bottoms.raw(), bottom_recs.len() as u64)
            .copy_from_slice(&bottom_recs);

        let mut slot_recs = Vec::with_capacity(def.bottom_segments.len() * children.len());
        for bottom in &def.bottom_segments {
            for slot in &bottom.children {
                slot_recs.push(ChildSlotRecord::new(slot.top_index, slot.reversed));
            }
        }
        let child_slots = self.alloc_array::<ChildSlotRecord>(slot_recs.len())?;
        self.store
            .array_mut::<ChildSlotRecord>(child_slots.raw(), slot_recs.len() as u64)
            .copy_from_slice(&slot_recs);

        Ok(GenomeRecord {
            name,
            parent,
            child_count: children.len() as u64,
            children: Offset::new(children_off),
            sequence_count: seq_recs.len() as u64,
            sequences,
            top_count: top_recs.len() as u64,
            tops,
            bottom_count: bottom_recs.len() as u64,
            bottoms,
            child_slots,
            dna: Offset::new(dna_off),
            dna_len: dna.len() as u64,
        })
    }

    fn write_str(&mut self, s: &str) -> Result<StrRecord, StoreError> {
        let offset = self.store.alloc(s.len() as u64, false)?;
        self.store
            .bytes_mut(offset, s.len() as u64)
            .copy_from_slice(s.as_bytes());
        Ok(StrRecord {
            offset: Offset::new(offset),
            len: s.len() as u64,
        })
    }

    fn write_array_u64(&mut self, values: &[u64]) -> Result<u64, StoreError> {
        let offset = self
            .store
            .alloc((values.len() * size_of::<u64>()) as u64, false)?;
        self.store
            .array_mut::<u64>(offset, values.len() as u64)
            .copy_from_slice(values);
        Ok(offset)
    }

    fn alloc_array<T: Persistent>(&mut self, count: usize) -> Result<Offset<T>, StoreError> {
        let offset = self
            .store
            .alloc((count * size_of::<T>()) as u64, false)?;
        Ok(Offset::new(offset))
    }
}
