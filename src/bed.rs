//! Interval records at the lift-over boundary.
//!
//! Tab-separated records of types 3 through 12 are consumed and produced;
//! the type tag says which optional fields are populated. Structured output
//! additionally carries per-record alignment info with match and insert
//! counters. Supports BGZF-compressed input files.

use noodles::bgzf;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Error as IoError, Read, Seek, SeekFrom, Write};
use std::num::ParseIntError;

#[derive(Debug)]
pub enum ParseErr {
    NotEnoughFields { have: usize, want: usize },
    InvalidField(ParseIntError),
    InvalidStrand,
    BlockMismatch,
    UnsupportedType(u8),
    IoError(IoError),
}

impl std::fmt::Display for ParseErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseErr::NotEnoughFields { have, want } => {
                write!(f, "Not enough fields in record: have {}, want {}", have, want)
            }
            ParseErr::InvalidField(e) => write!(f, "Invalid field: {}", e),
            ParseErr::InvalidStrand => write!(f, "Invalid strand"),
            ParseErr::BlockMismatch => {
                write!(f, "Block count does not match block sizes/starts")
            }
            ParseErr::UnsupportedType(t) => write!(f, "Unsupported record type {}", t),
            ParseErr::IoError(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ParseErr {}

/// One block of a gapped record. `start` is relative to the record start on
/// input; during assembly the engine keeps it absolute and relativizes at
/// the end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BedBlock {
    pub start: i64,
    pub length: i64,
}

/// Structured-alignment companion of a record: per-block query starts plus
/// the match and insert counters.
#[derive(Debug, Clone, Default)]
pub struct PslInfo {
    pub matches: u64,
    pub mismatches: u64,
    pub rep_matches: u64,
    pub n_count: u64,
    pub q_num_insert: u64,
    pub q_base_insert: u64,
    pub t_num_insert: u64,
    pub t_base_insert: u64,
    pub q_strand: char,
    pub q_size: u64,
    pub t_size: u64,
    pub q_end: i64,
    pub q_block_starts: Vec<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct BedLine {
    pub chr_name: String,
    pub start: i64,
    pub end: i64,
    pub name: String,
    pub score: String,
    pub strand: Option<char>,
    pub thick_start: i64,
    pub thick_end: i64,
    pub item_rgb: String,
    pub blocks: Vec<BedBlock>,
    pub bed_type: u8,
    /// Source-side coordinate this record (or mapped piece) originates from.
    pub src_start: i64,
    pub psl: Option<PslInfo>,
}

const VALID_TYPES: [u8; 9] = [3, 4, 5, 6, 8, 9, 10, 11, 12];

fn detect_type(columns: usize) -> u8 {
    match columns {
        0..=3 => 3,
        7 => 6,
        c if c >= 12 => 12,
        c => c as u8,
    }
}

impl BedLine {
    /// Parse one tab-separated record. With `forced_type`, exactly that many
    /// leading columns are interpreted; otherwise the type is taken from the
    /// column count.
    pub fn parse(line: &str, forced_type: Option<u8>) -> Result<BedLine, ParseErr> {
        let fields: Vec<&str> = line.split('\t').collect();
        let bed_type = match forced_type {
            Some(t) if !VALID_TYPES.contains(&t) => return Err(ParseErr::UnsupportedType(t)),
            Some(t) => t,
            None => detect_type(fields.len()),
        };
        if fields.len() < bed_type as usize {
            return Err(ParseErr::NotEnoughFields {
                have: fields.len(),
                want: bed_type as usize,
            });
        }

        let mut bed = BedLine {
            chr_name: fields[0].to_string(),
            start: fields[1].parse().map_err(ParseErr::InvalidField)?,
            end: fields[2].parse().map_err(ParseErr::InvalidField)?,
            bed_type,
            ..Default::default()
        };
        bed.src_start = bed.start;
        if bed_type >= 4 {
            bed.name = fields[3].to_string();
        }
        if bed_type >= 5 {
            bed.score = fields[4].to_string();
        }
        if bed_type >= 6 {
            bed.strand = match fields[5] {
                "+" => Some('+'),
                "-" => Some('-'),
                "." => None,
                _ => return Err(ParseErr::InvalidStrand),
            };
        }
        if bed_type >= 8 {
            bed.thick_start = fields[6].parse().map_err(ParseErr::InvalidField)?;
            bed.thick_end = fields[7].parse().map_err(ParseErr::InvalidField)?;
        }
        if bed_type >= 9 {
            bed.item_rgb = fields[8].to_string();
        }
        if bed_type == 12 {
            let count: usize = fields[9].parse().map_err(ParseErr::InvalidField)?;
            let sizes = parse_comma_list(fields[10])?;
            let starts = parse_comma_list(fields[11])?;
            if sizes.len() != count || starts.len() != count {
                return Err(ParseErr::BlockMismatch);
            }
            bed.blocks = starts
                .iter()
                .zip(sizes.iter())
                .map(|(&start, &length)| BedBlock { start, length })
                .collect();
        }
        Ok(bed)
    }

    /// Promote a lower-type record to type 12 in place, synthesizing one
    /// block covering the whole record. Keeps the blocked path uniform.
    pub fn expand_to_bed12(&mut self) {
        if self.bed_type >= 12 {
            return;
        }
        self.blocks = vec![BedBlock {
            start: 0,
            length: self.end - self.start,
        }];
        self.bed_type = 12;
    }

    pub fn strand_char(&self) -> char {
        self.strand.unwrap_or('+')
    }

    /// Write in BED form, emitting the columns the record's type covers.
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write!(w, "{}\t{}\t{}", self.chr_name, self.start, self.end)?;
        if self.bed_type >= 4 {
            write!(w, "\t{}", if self.name.is_empty() { "." } else { &self.name })?;
        }
        if self.bed_type >= 5 {
            write!(w, "\t{}", if self.score.is_empty() { "0" } else { &self.score })?;
        }
        if self.bed_type >= 6 {
            write!(w, "\t{}", self.strand.unwrap_or('.'))?;
        }
        if self.bed_type >= 8 {
            write!(w, "\t{}\t{}", self.thick_start, self.thick_end)?;
        }
        if self.bed_type >= 9 {
            write!(
                w,
                "\t{}",
                if self.item_rgb.is_empty() { "0" } else { &self.item_rgb }
            )?;
        }
        if self.bed_type >= 10 {
            write!(w, "\t{}", self.blocks.len())?;
        }
        if self.bed_type >= 11 {
            write!(w, "\t")?;
            for b in &self.blocks {
                write!(w, "{},", b.length)?;
            }
        }
        if self.bed_type >= 12 {
            write!(w, "\t")?;
            for b in &self.blocks {
                write!(w, "{},", b.start)?;
            }
        }
        writeln!(w)
    }

    /// Write in structured-alignment form: the 21-field tab-separated layout
    /// with match and insert counters. `with_name` propagates the record
    /// name as the query name field.
    pub fn write_psl<W: Write>(&self, w: &mut W, with_name: bool) -> io::Result<()> {
        let psl = self
            .psl
            .as_ref()
            .expect("structured output requires alignment info");
        write!(
            w,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            psl.matches,
            psl.mismatches,
            psl.rep_matches,
            psl.n_count,
            psl.q_num_insert,
            psl.q_base_insert,
            psl.t_num_insert,
            psl.t_base_insert
        )?;
        write!(w, "\t{}{}", psl.q_strand, self.strand.unwrap_or('+'))?;
        if with_name {
            write!(w, "\t{}", if self.name.is_empty() { "." } else { &self.name })?;
        }
        write!(
            w,
            "\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            psl.q_size,
            self.src_start,
            psl.q_end,
            self.chr_name,
            psl.t_size,
            self.start,
            self.end,
            self.blocks.len()
        )?;
        write!(w, "\t")?;
        for b in &self.blocks {
            write!(w, "{},", b.length)?;
        }
        write!(w, "\t")?;
        for q in &psl.q_block_starts {
            write!(w, "{},", q)?;
        }
        write!(w, "\t")?;
        for b in &self.blocks {
            write!(w, "{},", self.start + b.start)?;
        }
        writeln!(w)
    }
}

/// Ordering by source coordinate, used to sort the engine's output.
pub fn cmp_src(a: &BedLine, b: &BedLine) -> Ordering {
    a.src_start.cmp(&b.src_start).then(a.start.cmp(&b.start))
}

fn parse_comma_list(field: &str) -> Result<Vec<i64>, ParseErr> {
    field
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(ParseErr::InvalidField))
        .collect()
}

const BGZF_HEADER_SIZE: usize = 18;

/// Check whether a file starts with a valid BGZF header.
/// Returns `Ok(false)` for regular gzip, too-small files, or plain text.
fn is_bgzf<R: Read + Seek>(reader: &mut R) -> io::Result<bool> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    let result = match reader.read_exact(&mut header) {
        Ok(()) => {
            Ok(header[0..2] == [0x1f, 0x8b]      // gzip magic
                && header[2] == 0x08              // DEFLATE
                && header[3] == 0x04              // FEXTRA
                && header[10..12] == [0x06, 0x00] // XLEN=6
                && header[12..14] == [b'B', b'C'] // BC subfield
                && header[14..16] == [0x02, 0x00]) // SLEN=2
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    };
    reader.seek(SeekFrom::Start(0))?;
    result
}

/// Open an interval file for reading; `-` means stdin. Files ending in
/// `.gz`/`.bgz` must be BGZF-compressed.
pub fn open_interval_reader(path: &str) -> io::Result<Box<dyn BufRead>> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let mut file = File::open(path)?;
    if [".gz", ".bgz"].iter().any(|e| path.ends_with(e)) {
        if !is_bgzf(&mut file)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "'{}' is regular gzip, not BGZF. Convert with: zcat '{}' | bgzip > output.bed.gz",
                    path, path
                ),
            ));
        }
        return Ok(Box::new(BufReader::new(bgzf::Reader::new(file))));
    }
    Ok(Box::new(BufReader::new(file)))
}
