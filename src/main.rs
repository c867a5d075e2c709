use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use treelift::alignment::MmapAlignment;
use treelift::bed;
use treelift::liftover::{Liftover, LiftoverOpts};
use treelift::mmap_store::AccessMode;

/// Project interval records from one genome of a stored alignment onto
/// another, walking the phylogenetic tree between them.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the alignment store file.
    store_file: String,

    /// Name of the genome the input intervals live on.
    src_genome: String,

    /// Input interval file (BED 3-12, optionally BGZF-compressed); `-` for stdin.
    src_intervals: String,

    /// Name of the genome to project onto.
    tgt_genome: String,

    /// Output file; `-` for stdout.
    tgt_intervals: String,

    /// Skip paralogous projections instead of traversing duplication rings.
    #[clap(long, action)]
    no_dupes: bool,

    /// Emit structured alignment records with match/insert counters instead
    /// of intervals.
    #[clap(long, action)]
    out_psl: bool,

    /// Like --out-psl, additionally propagating the input record name.
    #[clap(long, action)]
    out_psl_with_name: bool,

    /// Ancestral genome bounding the tree walk; defaults to the LCA of
    /// source and target.
    #[clap(long, value_parser)]
    coalescence_limit: Option<String>,

    /// Force the input record type (3-12) instead of detecting it per line.
    #[clap(long, value_parser)]
    bed_type: Option<u8>,

    /// Page the whole mapping in up front; useful on slow transports.
    #[clap(long, action)]
    preload: bool,
}

fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let aln = MmapAlignment::open(&args.store_file, AccessMode::ReadOnly).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to open alignment {}: {}", args.store_file, e),
        )
    })?;
    if args.preload {
        aln.store().warm();
    }

    let reader = bed::open_interval_reader(&args.src_intervals)?;
    let mut writer: Box<dyn Write> = if args.tgt_intervals == "-" {
        Box::new(BufWriter::new(io::stdout()))
    } else {
        Box::new(BufWriter::new(File::create(&args.tgt_intervals)?))
    };

    let opts = LiftoverOpts {
        bed_type: args.bed_type,
        traverse_dupes: !args.no_dupes,
        out_psl: args.out_psl,
        out_psl_with_name: args.out_psl_with_name,
        coalescence_limit: args.coalescence_limit,
    };
    let mut liftover = Liftover::new(&aln);
    liftover
        .convert(
            &args.src_genome,
            reader,
            &args.tgt_genome,
            &mut writer,
            &opts,
        )
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}", e)))?;

    writer.flush()
}
