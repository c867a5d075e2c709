//! Coordinate lift-over across the alignment tree.
//!
//! Input interval records on a source genome are projected onto a target
//! genome by walking segment homologies up to the coalescence boundary and
//! back down, honoring strand orientation, duplications and block structure.
//! Output is either plain intervals or structured alignment records with
//! match and insert accounting.

use crate::alignment::MmapAlignment;
use crate::bed::{self, BedBlock, BedLine, ParseErr, PslInfo};
use crate::genome::Sequence;
use crate::segment::{complement, BottomSegmentIterator, TopSegmentIterator, NULL_INDEX};
use log::warn;
use rustc_hash::FxHashSet;
use std::cmp::{max, min};
use std::fmt;
use std::io::{self, BufRead, Write};

/// Options consumed by the engine.
#[derive(Debug, Clone)]
pub struct LiftoverOpts {
    /// Interpret input records as this type; `None` detects per line.
    pub bed_type: Option<u8>,
    /// Include paralogous projections.
    pub traverse_dupes: bool,
    /// Emit structured alignment records instead of intervals.
    pub out_psl: bool,
    /// Propagate the input record name into structured output.
    pub out_psl_with_name: bool,
    /// Ancestral genome bounding the tree walk; `None` means the LCA of
    /// source and target.
    pub coalescence_limit: Option<String>,
}

impl Default for LiftoverOpts {
    fn default() -> LiftoverOpts {
        LiftoverOpts {
            bed_type: None,
            traverse_dupes: true,
            out_psl: false,
            out_psl_with_name: false,
            coalescence_limit: None,
        }
    }
}

#[derive(Debug)]
pub enum LiftError {
    Io(io::Error),
    Parse { line: u64, err: ParseErr },
    UnknownGenome(String),
    InvalidCoalescenceLimit { limit: String, src: String, tgt: String },
}

impl fmt::Display for LiftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiftError::Io(e) => write!(f, "IO error: {}", e),
            LiftError::Parse { line, err } => write!(f, "Input line {}: {}", line, err),
            LiftError::UnknownGenome(name) => {
                write!(f, "Genome '{}' not found in alignment", name)
            }
            LiftError::InvalidCoalescenceLimit { limit, src, tgt } => write!(
                f,
                "Coalescence limit '{}' is not a common ancestor of '{}' and '{}'",
                limit, src, tgt
            ),
        }
    }
}

impl std::error::Error for LiftError {}

impl From<io::Error> for LiftError {
    fn from(e: io::Error) -> Self {
        LiftError::Io(e)
    }
}

/// Segment cursor paired with the source-side coordinate its leftmost base
/// corresponds to. When the cursor is reversed, the correspondence runs
/// right-to-left, but `src_start` is still the smallest source coordinate.
enum Cursor<'a> {
    Top(TopSegmentIterator<'a>, i64),
    Bottom(BottomSegmentIterator<'a>, i64),
}

impl<'a> Cursor<'a> {
    fn start_position(&self) -> i64 {
        match self {
            Cursor::Top(it, _) => it.start_position(),
            Cursor::Bottom(it, _) => it.start_position(),
        }
    }

    fn end_position(&self) -> i64 {
        match self {
            Cursor::Top(it, _) => it.end_position(),
            Cursor::Bottom(it, _) => it.end_position(),
        }
    }

    fn reversed(&self) -> bool {
        match self {
            Cursor::Top(it, _) => it.reversed(),
            Cursor::Bottom(it, _) => it.reversed(),
        }
    }

    fn src_start(&self) -> i64 {
        match self {
            Cursor::Top(_, s) | Cursor::Bottom(_, s) => *s,
        }
    }
}

/// Source coordinate of a sub-window `[sa, sb)` of a cursor spanning
/// `[a, b)` whose correspondence starts at `src_start`.
fn narrowed_src(src_start: i64, reversed: bool, a: i64, b: i64, sa: i64, sb: i64) -> i64 {
    if reversed {
        src_start + (b - sb)
    } else {
        src_start + (sa - a)
    }
}

pub struct Liftover<'a> {
    aln: &'a MmapAlignment,
    src: u32,
    tgt: u32,
    up_path: Vec<u32>,
    down_path: Vec<u32>,
    bed_type: Option<u8>,
    traverse_dupes: bool,
    out_psl: bool,
    out_psl_with_name: bool,
    missed: FxHashSet<String>,
    warned_thick: bool,
    bed_line: BedLine,
}

impl<'a> Liftover<'a> {
    pub fn new(aln: &'a MmapAlignment) -> Liftover<'a> {
        Liftover {
            aln,
            src: 0,
            tgt: 0,
            up_path: Vec::new(),
            down_path: Vec::new(),
            bed_type: None,
            traverse_dupes: true,
            out_psl: false,
            out_psl_with_name: false,
            missed: FxHashSet::default(),
            warned_thick: false,
            bed_line: BedLine::default(),
        }
    }

    /// Project every record in `reader` from `src_genome` onto `tgt_genome`
    /// and write the results to `writer`.
    pub fn convert<R: BufRead, W: Write>(
        &mut self,
        src_genome: &str,
        reader: R,
        tgt_genome: &str,
        writer: &mut W,
        opts: &LiftoverOpts,
    ) -> Result<(), LiftError> {
        let src = self
            .aln
            .genome(src_genome)
            .ok_or_else(|| LiftError::UnknownGenome(src_genome.to_string()))?
            .index();
        let tgt = self
            .aln
            .genome(tgt_genome)
            .ok_or_else(|| LiftError::UnknownGenome(tgt_genome.to_string()))?
            .index();
        let limit = match &opts.coalescence_limit {
            Some(name) => self
                .aln
                .genome(name)
                .ok_or_else(|| LiftError::UnknownGenome(name.clone()))?
                .index(),
            None => self.aln.lca(src, tgt),
        };
        if !self.aln.is_ancestor(limit, src) || !self.aln.is_ancestor(limit, tgt) {
            return Err(LiftError::InvalidCoalescenceLimit {
                limit: self.aln.genome_at(limit).name().to_string(),
                src: src_genome.to_string(),
                tgt: tgt_genome.to_string(),
            });
        }
        self.src = src;
        self.tgt = tgt;
        self.up_path = self.aln.path_up(src, limit);
        self.down_path = self.aln.path_down(limit, tgt);
        self.bed_type = opts.bed_type;
        self.traverse_dupes = opts.traverse_dupes;
        self.out_psl = opts.out_psl || opts.out_psl_with_name;
        self.out_psl_with_name = opts.out_psl_with_name;
        self.missed.clear();
        self.warned_thick = false;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim_end();
            if trimmed.is_empty()
                || trimmed.starts_with('#')
                || trimmed.starts_with("track")
                || trimmed.starts_with("browser")
            {
                continue;
            }
            self.bed_line = BedLine::parse(trimmed, self.bed_type).map_err(|err| {
                LiftError::Parse {
                    line: line_no as u64 + 1,
                    err,
                }
            })?;
            self.visit_line(writer)?;
        }
        Ok(())
    }

    fn visit_line<W: Write>(&mut self, writer: &mut W) -> Result<(), LiftError> {
        if self.out_psl && self.bed_line.bed_type < 12 {
            // forcing to type 12 keeps the block path uniform
            self.bed_line.expand_to_bed12();
        }
        let src_genome = self.aln.genome_at(self.src);
        let seq = match src_genome.sequence(&self.bed_line.chr_name) {
            Some(seq) => seq.clone(),
            None => {
                if self.missed.insert(self.bed_line.chr_name.clone()) {
                    warn!(
                        "Unable to find sequence {} in genome {}",
                        self.bed_line.chr_name,
                        src_genome.name()
                    );
                }
                return Ok(());
            }
        };
        if self.bed_line.end > seq.length() as i64 {
            warn!(
                "Skipping interval with endpoint {} because sequence {} has length {}",
                self.bed_line.end,
                self.bed_line.chr_name,
                seq.length()
            );
            return Ok(());
        }
        if self.bed_line.bed_type > 9 && self.bed_line.blocks.is_empty() {
            warn!("Skipping input line with 0 blocks");
            return Ok(());
        }

        let mut mapped = Vec::new();
        if self.bed_line.bed_type <= 9 {
            self.lift_interval(&seq, self.bed_line.start, self.bed_line.end, &mut mapped);
        } else {
            self.lift_block_intervals(&seq, &mut mapped);
        }

        let mut out_lines = if self.bed_line.bed_type > 9 {
            if mapped.is_empty() {
                Vec::new()
            } else {
                assign_blocks_to_intervals(mapped, self.out_psl, self.bed_line.strand)
            }
        } else {
            // only map the pieces and forget about block assembly
            mapped
        };

        self.clean_results(&mut out_lines);
        out_lines.sort_by(bed::cmp_src);
        for line in &out_lines {
            if self.out_psl {
                line.write_psl(writer, self.out_psl_with_name)?;
            } else {
                line.write(writer)?;
            }
        }
        Ok(())
    }

    /// Lift each block of the current record separately by narrowing the
    /// window to the block span.
    fn lift_block_intervals(&self, seq: &Sequence, out: &mut Vec<BedLine>) {
        let mut blocks = self.bed_line.blocks.clone();
        blocks.sort_by_key(|b| b.start);
        for block in &blocks {
            let start = self.bed_line.start + block.start;
            let end = start + block.length;
            if end > start {
                self.lift_interval(seq, start, end, out);
            }
        }
    }

    /// Project `[start, end)` on `seq` onto the target genome, appending one
    /// candidate record per mapped piece. Pieces carry their source
    /// correspondence in `src_start` and, in structured mode, per-piece
    /// match counters from base comparison.
    fn lift_interval(&self, seq: &Sequence, start: i64, end: i64, out: &mut Vec<BedLine>) {
        let gstart = seq.start as i64 + start;
        let gend = seq.start as i64 + end;
        if self.src == self.tgt {
            self.emit_mapped(gstart, gend, false, gstart, seq, out);
            return;
        }

        let ascend_steps = self.up_path.len() - 1;
        let mut cursors = if ascend_steps > 0 {
            self.seed_tops(gstart, gend)
        } else {
            self.seed_bottoms(gstart, gend)
        };

        // ascend to the coalescence boundary
        for step in 0..ascend_steps {
            let mut next = Vec::new();
            for cur in cursors {
                if let Cursor::Top(it, src_start) = cur {
                    if let Some(parent) = it.parent() {
                        next.push(Cursor::Bottom(parent, src_start));
                    }
                }
            }
            cursors = if step + 1 < ascend_steps {
                self.parse_up_all(next)
            } else {
                next
            };
        }

        // descend to the target, expanding paralogy rings along the way
        for step in 0..self.down_path.len() - 1 {
            let parent_g = self.down_path[step];
            let child_g = self.down_path[step + 1];
            let child_pos = self
                .aln
                .child_position(parent_g, child_g)
                .expect("path step is a parent/child edge");
            let mut next = Vec::new();
            for cur in cursors {
                let Cursor::Bottom(it, src_start) = cur else {
                    continue;
                };
                let Some(top) = it.child(child_pos) else {
                    continue;
                };
                if self.traverse_dupes {
                    let first_index = top.index();
                    let mut ring = top;
                    loop {
                        next.push(Cursor::Top(ring.clone(), src_start));
                        match ring.next_paralogy() {
                            Some(p) if p.index() != first_index => ring = p,
                            _ => break,
                        }
                    }
                } else {
                    next.push(Cursor::Top(top, src_start));
                }
            }
            cursors = if child_g != self.tgt {
                self.parse_down_all(next)
            } else {
                next
            };
        }

        for cur in &cursors {
            self.emit_mapped(
                cur.start_position(),
                cur.end_position(),
                cur.reversed(),
                cur.src_start(),
                seq,
                out,
            );
        }
    }

    /// Top segment cursors covering the source window, in coordinate order.
    fn seed_tops(&self, gstart: i64, gend: i64) -> Vec<Cursor<'a>> {
        let mut out = Vec::new();
        let Some(mut idx) = self.aln.top_index_from(self.src, gstart) else {
            return out;
        };
        let count = self.aln.genome_at(self.src).num_top_segments();
        while (idx as u64) < count {
            let it = self.aln.top_iter(self.src, idx);
            let Some(w) = it.windowed(gstart, gend) else {
                break;
            };
            let src_start = w.start_position();
            out.push(Cursor::Top(w, src_start));
            idx += 1;
        }
        out
    }

    fn seed_bottoms(&self, gstart: i64, gend: i64) -> Vec<Cursor<'a>> {
        let mut out = Vec::new();
        let Some(mut idx) = self.aln.bottom_index_from(self.src, gstart) else {
            return out;
        };
        let count = self.aln.genome_at(self.src).num_bottom_segments();
        while (idx as u64) < count {
            let it = self.aln.bottom_iter(self.src, idx);
            let Some(w) = it.windowed(gstart, gend) else {
                break;
            };
            let src_start = w.start_position();
            out.push(Cursor::Bottom(w, src_start));
            idx += 1;
        }
        out
    }

    /// Convert bottom cursors to the top cursors overlapping them in the
    /// same genome, splitting where segmentations do not line up.
    fn parse_up_all(&self, cursors: Vec<Cursor<'a>>) -> Vec<Cursor<'a>> {
        let mut out = Vec::new();
        for cur in cursors {
            let Cursor::Bottom(it, src_start) = cur else {
                continue;
            };
            let (a, b) = (it.start_position(), it.end_position());
            let mut window_start = a;
            while window_start < b {
                let Some(bw) = it.windowed(window_start, b) else {
                    break;
                };
                let Some(top) = bw.parse_up() else {
                    break;
                };
                let (sa, sb) = (top.start_position(), top.end_position());
                out.push(Cursor::Top(
                    top,
                    narrowed_src(src_start, it.reversed(), a, b, sa, sb),
                ));
                window_start = sb;
            }
        }
        out
    }

    fn parse_down_all(&self, cursors: Vec<Cursor<'a>>) -> Vec<Cursor<'a>> {
        let mut out = Vec::new();
        for cur in cursors {
            let Cursor::Top(it, src_start) = cur else {
                continue;
            };
            let (a, b) = (it.start_position(), it.end_position());
            let mut window_start = a;
            while window_start < b {
                let Some(tw) = it.windowed(window_start, b) else {
                    break;
                };
                let Some(bottom) = tw.parse_down() else {
                    break;
                };
                let (sa, sb) = (bottom.start_position(), bottom.end_position());
                out.push(Cursor::Bottom(
                    bottom,
                    narrowed_src(src_start, it.reversed(), a, b, sa, sb),
                ));
                window_start = sb;
            }
        }
        out
    }

    /// Append one candidate output record for a mapped piece.
    fn emit_mapped(
        &self,
        ts: i64,
        te: i64,
        parity: bool,
        src_start_g: i64,
        src_seq: &Sequence,
        out: &mut Vec<BedLine>,
    ) {
        if te <= ts {
            return;
        }
        let len = te - ts;
        let tgt_genome = self.aln.genome_at(self.tgt);
        let Some(tseq) = tgt_genome.sequence_at(ts as u64) else {
            return;
        };
        let in_neg = self.bed_line.strand == Some('-');
        let strand = if in_neg ^ parity { '-' } else { '+' };
        let src_start = src_start_g - src_seq.start as i64;
        let mut piece = BedLine {
            chr_name: tseq.name.clone(),
            start: ts - tseq.start as i64,
            end: te - tseq.start as i64,
            name: self.bed_line.name.clone(),
            score: self.bed_line.score.clone(),
            strand: Some(strand),
            thick_start: self.bed_line.thick_start,
            thick_end: self.bed_line.thick_end,
            item_rgb: self.bed_line.item_rgb.clone(),
            blocks: Vec::new(),
            bed_type: self.bed_line.bed_type,
            src_start,
            psl: None,
        };
        if self.out_psl {
            let mut info = PslInfo {
                q_strand: self.bed_line.strand_char(),
                q_size: src_seq.length,
                t_size: tseq.length,
                q_end: src_start + len,
                ..Default::default()
            };
            self.count_matches(src_start_g, ts, te, parity, &mut info);
            piece.psl = Some(info);
        }
        out.push(piece);
    }

    /// Per-piece base comparison: `N` on either side counts as nCount,
    /// case-insensitive equality as a match (repMatch when the target base
    /// is soft-masked), anything else as a mismatch.
    fn count_matches(&self, src_start_g: i64, ts: i64, te: i64, parity: bool, info: &mut PslInfo) {
        let len = (te - ts) as usize;
        let src = self
            .aln
            .dna_slice(self.src, src_start_g, src_start_g + len as i64);
        let tgt = self.aln.dna_slice(self.tgt, ts, te);
        for i in 0..len {
            let s = src[i];
            let t = if parity {
                complement(tgt[len - 1 - i])
            } else {
                tgt[i]
            };
            if s == b'N' || s == b'n' || t == b'N' || t == b'n' {
                info.n_count += 1;
            } else if s.eq_ignore_ascii_case(&t) {
                if t.is_ascii_lowercase() {
                    info.rep_matches += 1;
                } else {
                    info.matches += 1;
                }
            } else {
                info.mismatches += 1;
            }
        }
    }

    /// Post-process lifted records: relocate the thick interval onto the
    /// projected span, drop empty block lists in blocked mode and recompute
    /// the structured source span from the assembled blocks.
    fn clean_results(&mut self, lines: &mut Vec<BedLine>) {
        if self.bed_line.bed_type <= 6 {
            return;
        }
        let thick_set = self.bed_line.thick_start != 0 || self.bed_line.thick_end != 0;
        let mut i = 0;
        while i < lines.len() {
            if thick_set {
                if (self.bed_line.thick_start != self.bed_line.start
                    || self.bed_line.thick_end != self.bed_line.end)
                    && !self.warned_thick
                {
                    warn!(
                        "thickStart/thickEnd different from chromStart/chromEnd are not \
                         preserved across projection; assuming the projected span"
                    );
                    self.warned_thick = true;
                }
                lines[i].thick_start = lines[i].start;
                lines[i].thick_end = lines[i].end;
            }
            if self.bed_line.bed_type > 9 {
                if lines[i].blocks.is_empty() {
                    // no empty regions in blocked output
                    lines.remove(i);
                    continue;
                }
                if self.out_psl {
                    let line = &mut lines[i];
                    let mut psl = line.psl.take().expect("structured piece has info");
                    line.src_start = i64::MAX;
                    psl.q_end = 0;
                    for j in 0..psl.q_block_starts.len() {
                        line.src_start = min(line.src_start, psl.q_block_starts[j]);
                        psl.q_end =
                            max(psl.q_end, psl.q_block_starts[j] + line.blocks[j].length);
                    }
                    line.psl = Some(psl);
                }
            }
            i += 1;
        }
    }
}

/// Assemble sorted mapped pieces into output records.
///
/// Walking the pieces in source order, a piece opens a new record when there
/// is none yet, when structured output must keep duplicated source ranges on
/// separate records, or when it is not compatible with the record being
/// built; otherwise it is appended as another block. Block starts stay
/// absolute during the walk and are relativized at the end.
fn assign_blocks_to_intervals(
    mut mapped: Vec<BedLine>,
    out_psl: bool,
    in_strand: Option<char>,
) -> Vec<BedLine> {
    mapped.sort_by(bed::cmp_src);
    let mut out: Vec<BedLine> = Vec::new();
    let mut prev_src_end = NULL_INDEX;
    for i in 0..mapped.len() {
        let src_end = mapped[i].src_start + (mapped[i].end - mapped[i].start);
        let dupe = mapped[i].src_start < prev_src_end
            || (i + 1 < mapped.len() && mapped[i + 1].src_start < src_end);
        // filter dupes in structured output but let them share a record in
        // interval output
        if out.is_empty()
            || (out_psl && dupe)
            || !compatible(out.last().unwrap(), &mapped[i], in_strand)
        {
            out.push(mapped[i].clone());
        }
        prev_src_end = src_end;
        let block = &mapped[i];
        let last = out.last_mut().unwrap();
        last.start = min(last.start, block.start);
        last.end = max(last.end, block.end);
        // keep start absolute for now
        last.blocks.push(BedBlock {
            start: block.start,
            length: block.end - block.start,
        });
        if out_psl {
            let info = last.psl.as_mut().expect("structured piece has info");
            info.q_block_starts.push(block.src_start);
            // counters for the first block arrive with the record itself
            if last.blocks.len() > 1 {
                let bp = block.psl.as_ref().expect("structured piece has info");
                info.matches += bp.matches;
                info.mismatches += bp.mismatches;
                info.rep_matches += bp.rep_matches;
                info.n_count += bp.n_count;
            }
            debug_assert_eq!(last.blocks.len(), info.q_block_starts.len());
        }
    }

    for line in &mut out {
        for block in &mut line.blocks {
            debug_assert!(block.start >= line.start);
            block.start -= line.start;
        }
    }

    flip_blocks(&mut out, out_psl);
    if out_psl {
        compute_psl_inserts(&mut out);
    }
    out
}

/// A new block may extend the record being built only when it stays on the
/// same target chromosome and strand, advances the source coordinate, and
/// leaves a non-negative target-side gap under the record's strand
/// convention.
fn compatible(tgt_bed: &BedLine, new_block: &BedLine, in_strand: Option<char>) -> bool {
    if tgt_bed.strand != new_block.strand {
        return false;
    }
    debug_assert!(new_block.src_start >= tgt_bed.src_start);
    if tgt_bed.src_start == new_block.src_start {
        return false;
    }

    let tgt_block = tgt_bed.blocks.last().expect("record under construction");
    let delta = if tgt_bed.strand != in_strand {
        tgt_block.start - new_block.end
    } else {
        new_block.start - (tgt_block.start + tgt_block.length)
    };
    if delta < 0 {
        return false;
    }

    tgt_bed.chr_name == new_block.chr_name
}

/// Enforce the per-record block ordering convention: ascending in interval
/// output, strand-directed in structured output.
fn flip_blocks(lines: &mut [BedLine], out_psl: bool) {
    for line in lines.iter_mut() {
        if line.blocks.len() < 2 {
            continue;
        }
        let delta = line.blocks[1].start - (line.blocks[0].start + line.blocks[0].length);
        let must_flip = if !out_psl {
            delta < 0
        } else {
            (line.strand == Some('-') && delta >= 0) || (line.strand != Some('-') && delta < 0)
        };
        if must_flip {
            line.blocks.reverse();
            if out_psl {
                line.psl
                    .as_mut()
                    .expect("structured record has info")
                    .q_block_starts
                    .reverse();
            }
        }
    }
}

/// Fill the insert counters from adjacent block gaps. Indexing runs forward
/// on `+` strand and swapped on `-`, mirroring the block order convention.
fn compute_psl_inserts(lines: &mut [BedLine]) {
    for line in lines.iter_mut() {
        let Some(psl) = line.psl.as_mut() else {
            continue;
        };
        psl.q_num_insert = 0;
        psl.q_base_insert = 0;
        psl.t_num_insert = 0;
        psl.t_base_insert = 0;
        debug_assert_eq!(line.blocks.len(), psl.q_block_starts.len());
        let blocks = &line.blocks;
        for k in 1..blocks.len() {
            let (cur, prev) = if line.strand == Some('-') {
                (k - 1, k)
            } else {
                (k, k - 1)
            };
            let gap = blocks[cur].start - (blocks[prev].start + blocks[prev].length);
            debug_assert!(gap >= 0);
            if gap > 0 {
                psl.t_num_insert += 1;
                psl.t_base_insert += gap as u64;
            }

            let (qcur, qprev) = if psl.q_strand == '-' {
                (k - 1, k)
            } else {
                (k, k - 1)
            };
            // duplicated blocks can overlap on the query side
            let gap = psl.q_block_starts[qcur] - (psl.q_block_starts[qprev] + blocks[qprev].length);
            if gap > 0 {
                psl.q_num_insert += 1;
                psl.q_base_insert += gap as u64;
            }
        }
    }
}
