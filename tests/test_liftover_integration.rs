//! End-to-end lift-over tests over small hand-built alignment stores.
//!
//! These tests verify:
//! 1. Identity projection returns the input interval
//! 2. Blocked records crossing a reversing edge come out strand-flipped
//!    with the block order convention enforced
//! 3. Duplications split structured output but share interval output
//! 4. Unknown chromosomes are skipped without aborting the run
//! 5. Multi-level walks split correctly at parse boundaries
//! 6. An unfinished writer leaves the store dirty

use std::io::Cursor;
use tempfile::TempDir;
use treelift::alignment::{
    AlignmentWriter, BottomSegmentDef, ChildSlotDef, GenomeDef, MmapAlignment, SequenceDef,
    TopSegmentDef,
};
use treelift::liftover::{LiftError, Liftover, LiftoverOpts};
use treelift::mmap_store::{AccessMode, StoreError};
use treelift::segment::NULL_INDEX;

fn bases(n: usize) -> Vec<u8> {
    b"ACGT".iter().cycle().take(n).copied().collect()
}

fn top(
    start: i64,
    length: i64,
    parent_index: i64,
    parent_reversed: bool,
    paralogy_next: i64,
    bottom_parse_index: i64,
) -> TopSegmentDef {
    TopSegmentDef {
        start,
        length,
        parent_index,
        parent_reversed,
        paralogy_next,
        bottom_parse_index,
    }
}

fn bottom(start: i64, length: i64, top_parse_index: i64, children: &[(i64, bool)]) -> BottomSegmentDef {
    BottomSegmentDef {
        start,
        length,
        top_parse_index,
        children: children
            .iter()
            .map(|&(top_index, reversed)| ChildSlotDef {
                top_index,
                reversed,
            })
            .collect(),
    }
}

/// anc -> {ref, qry} fork.
///
/// anc "aChr" is tiled by four 50-base bottom segments. ref "chr1" mirrors
/// them forward. qry "chrQ" (250 bases) carries a second copy of anc[0,50)
/// at [200,250) (paralogy ring) and maps anc[100,200) through two crossed
/// reversing edges.
fn build_fork(path: &std::path::Path) {
    let mut writer = AlignmentWriter::create(path, 1 << 20).unwrap();
    writer.add_genome(GenomeDef {
        name: "anc".to_string(),
        parent: None,
        sequences: vec![SequenceDef {
            name: "aChr".to_string(),
            bases: bases(200),
        }],
        top_segments: vec![],
        bottom_segments: vec![
            bottom(0, 50, NULL_INDEX, &[(0, false), (0, false)]),
            bottom(50, 50, NULL_INDEX, &[(1, false), (1, false)]),
            bottom(100, 50, NULL_INDEX, &[(2, false), (3, true)]),
            bottom(150, 50, NULL_INDEX, &[(3, false), (2, true)]),
        ],
    });
    writer.add_genome(GenomeDef {
        name: "ref".to_string(),
        parent: Some("anc".to_string()),
        sequences: vec![SequenceDef {
            name: "chr1".to_string(),
            bases: bases(200),
        }],
        top_segments: vec![
            top(0, 50, 0, false, NULL_INDEX, NULL_INDEX),
            top(50, 50, 1, false, NULL_INDEX, NULL_INDEX),
            top(100, 50, 2, false, NULL_INDEX, NULL_INDEX),
            top(150, 50, 3, false, NULL_INDEX, NULL_INDEX),
        ],
        bottom_segments: vec![],
    });
    writer.add_genome(GenomeDef {
        name: "qry".to_string(),
        parent: Some("anc".to_string()),
        sequences: vec![SequenceDef {
            name: "chrQ".to_string(),
            bases: bases(250),
        }],
        top_segments: vec![
            top(0, 50, 0, false, 4, NULL_INDEX),
            top(50, 50, 1, false, NULL_INDEX, NULL_INDEX),
            top(100, 50, 3, true, NULL_INDEX, NULL_INDEX),
            top(150, 50, 2, true, NULL_INDEX, NULL_INDEX),
            top(200, 50, 0, false, 0, NULL_INDEX),
        ],
        bottom_segments: vec![],
    });
    writer.finish().unwrap();
}

/// root -> mid -> sub chain whose mid-level segmentations do not line up,
/// forcing parse splits on the way up.
fn build_chain(path: &std::path::Path) {
    let mut writer = AlignmentWriter::create(path, 1 << 20).unwrap();
    writer.add_genome(GenomeDef {
        name: "root".to_string(),
        parent: None,
        sequences: vec![SequenceDef {
            name: "aChr".to_string(),
            bases: bases(200),
        }],
        top_segments: vec![],
        bottom_segments: vec![
            bottom(0, 100, NULL_INDEX, &[(0, false)]),
            bottom(100, 100, NULL_INDEX, &[(1, false)]),
        ],
    });
    writer.add_genome(GenomeDef {
        name: "mid".to_string(),
        parent: Some("root".to_string()),
        sequences: vec![SequenceDef {
            name: "mChr".to_string(),
            bases: bases(200),
        }],
        top_segments: vec![
            top(0, 100, 0, false, NULL_INDEX, 0),
            top(100, 100, 1, false, NULL_INDEX, 1),
        ],
        bottom_segments: vec![
            bottom(0, 60, 0, &[(0, false)]),
            bottom(60, 80, 0, &[(1, true)]),
            bottom(140, 60, 1, &[(2, false)]),
        ],
    });
    writer.add_genome(GenomeDef {
        name: "sub".to_string(),
        parent: Some("mid".to_string()),
        sequences: vec![SequenceDef {
            name: "subChr".to_string(),
            bases: bases(200),
        }],
        top_segments: vec![
            top(0, 60, 0, false, NULL_INDEX, NULL_INDEX),
            top(60, 80, 1, true, NULL_INDEX, NULL_INDEX),
            top(140, 60, 2, false, NULL_INDEX, NULL_INDEX),
        ],
        bottom_segments: vec![],
    });
    writer.finish().unwrap();
}

fn run_lift(
    aln: &MmapAlignment,
    src: &str,
    tgt: &str,
    input: &str,
    opts: &LiftoverOpts,
) -> Result<String, LiftError> {
    let mut out = Vec::new();
    let mut liftover = Liftover::new(aln);
    liftover.convert(src, Cursor::new(input.as_bytes()), tgt, &mut out, opts)?;
    Ok(String::from_utf8(out).unwrap())
}

fn lines(output: &str) -> Vec<&str> {
    output.lines().filter(|l| !l.is_empty()).collect()
}

#[test]
fn test_identity_scalar_lift() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let out = run_lift(
        &aln,
        "ref",
        "ref",
        "chr1\t100\t200\n",
        &LiftoverOpts::default(),
    )
    .unwrap();
    assert_eq!(lines(&out), vec!["chr1\t100\t200"]);
}

#[test]
fn test_scalar_lift_to_sibling() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    // anc[50,100) maps forward into both children.
    let out = run_lift(
        &aln,
        "ref",
        "qry",
        "chr1\t60\t90\n",
        &LiftoverOpts::default(),
    )
    .unwrap();
    assert_eq!(lines(&out), vec!["chrQ\t60\t90"]);
}

#[test]
fn test_blocked_lift_across_reverse_edge_psl() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let input = "chr1\t100\t200\tname\t0\t+\t100\t200\t0\t2\t30,30\t0,70\n";
    let opts = LiftoverOpts {
        out_psl: true,
        ..Default::default()
    };
    let out = run_lift(&aln, "ref", "qry", input, &opts).unwrap();
    let out_lines = lines(&out);
    assert_eq!(out_lines.len(), 1);

    let fields: Vec<&str> = out_lines[0].split('\t').collect();
    assert_eq!(fields.len(), 20);
    // query inserts, target inserts
    assert_eq!(&fields[4..8], &["1", "40", "1", "40"]);
    // strand pair: forward query, reversed target
    assert_eq!(fields[8], "+-");
    // query span recomputed from the assembled blocks
    assert_eq!(fields[9], "200"); // qSize
    assert_eq!(fields[10], "100"); // qStart
    assert_eq!(fields[11], "200"); // qEnd
    assert_eq!(fields[12], "chrQ");
    assert_eq!(fields[14], "100"); // tStart
    assert_eq!(fields[15], "200"); // tEnd
    assert_eq!(fields[16], "2");
    assert_eq!(fields[17], "30,30,");
    // query starts ascend while target starts descend on '-'
    assert_eq!(fields[18], "100,170,");
    assert_eq!(fields[19], "170,100,");
}

#[test]
fn test_blocked_lift_across_reverse_edge_bed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let input = "chr1\t100\t200\tname\t0\t+\t100\t200\t0\t2\t30,30\t0,70\n";
    let out = run_lift(&aln, "ref", "qry", input, &LiftoverOpts::default()).unwrap();
    // interval output keeps blocks ascending
    assert_eq!(
        lines(&out),
        vec!["chrQ\t100\t200\tname\t0\t-\t100\t200\t0\t2\t30,30,\t0,70,"]
    );
}

#[test]
fn test_duplicate_projection_modes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    // anc[0,50) has two copies in qry: [0,50) and [200,250).
    let input = "chr1\t0\t50\n";

    let out = run_lift(&aln, "ref", "qry", input, &LiftoverOpts::default()).unwrap();
    assert_eq!(lines(&out), vec!["chrQ\t0\t50", "chrQ\t200\t250"]);

    // structured mode keeps the duplicated source range on separate records
    let opts = LiftoverOpts {
        out_psl: true,
        ..Default::default()
    };
    let out = run_lift(&aln, "ref", "qry", input, &opts).unwrap();
    assert_eq!(lines(&out).len(), 2);
    for line in lines(&out) {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields[16], "1"); // one block each
        assert_eq!(fields[10], "0"); // both start at source 0
    }

    // skipping paralogy steps keeps only the canonical copy
    let opts = LiftoverOpts {
        traverse_dupes: false,
        ..Default::default()
    };
    let out = run_lift(&aln, "ref", "qry", input, &opts).unwrap();
    assert_eq!(lines(&out), vec!["chrQ\t0\t50"]);
}

#[test]
fn test_missing_chromosome_skips_and_continues() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let input = "chrX\t0\t10\nchrX\t20\t30\nchr1\t60\t70\n";
    let out = run_lift(&aln, "ref", "qry", input, &LiftoverOpts::default()).unwrap();
    assert_eq!(lines(&out), vec!["chrQ\t60\t70"]);
}

#[test]
fn test_out_of_range_interval_skipped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let out = run_lift(
        &aln,
        "ref",
        "qry",
        "chr1\t0\t999\nchr1\t60\t70\n",
        &LiftoverOpts::default(),
    )
    .unwrap();
    assert_eq!(lines(&out), vec!["chrQ\t60\t70"]);
}

#[test]
fn test_blocked_record_without_blocks_skipped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let input = "chr1\t0\t50\tn\t0\t+\t0\t50\t0\t0\t\t\n";
    let out = run_lift(&aln, "ref", "qry", input, &LiftoverOpts::default()).unwrap();
    assert!(lines(&out).is_empty());
}

#[test]
fn test_multilevel_walk_splits_at_parse_boundaries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chain.hal");
    build_chain(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    // sub[30,170) crosses the reversed mid segment [60,140), which in turn
    // straddles root's segmentation; the walk must split and flip.
    let input = "subChr\t30\t170\tx\t0\t+\n";
    let out = run_lift(&aln, "sub", "root", input, &LiftoverOpts::default()).unwrap();
    assert_eq!(
        lines(&out),
        vec![
            "aChr\t30\t60\tx\t0\t+",
            "aChr\t100\t140\tx\t0\t-",
            "aChr\t60\t100\tx\t0\t-",
            "aChr\t140\t170\tx\t0\t+",
        ]
    );
}

#[test]
fn test_descending_walk_from_ancestor() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chain.hal");
    build_chain(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let input = "aChr\t30\t60\n";
    let out = run_lift(&aln, "root", "sub", input, &LiftoverOpts::default()).unwrap();
    assert_eq!(lines(&out), vec!["subChr\t30\t60"]);
}

#[test]
fn test_invalid_coalescence_limit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let opts = LiftoverOpts {
        coalescence_limit: Some("ref".to_string()),
        ..Default::default()
    };
    let err = run_lift(&aln, "ref", "qry", "chr1\t0\t10\n", &opts).unwrap_err();
    assert!(matches!(err, LiftError::InvalidCoalescenceLimit { .. }));

    let opts = LiftoverOpts {
        coalescence_limit: Some("nope".to_string()),
        ..Default::default()
    };
    let err = run_lift(&aln, "ref", "qry", "chr1\t0\t10\n", &opts).unwrap_err();
    assert!(matches!(err, LiftError::UnknownGenome(_)));
}

#[test]
fn test_explicit_coalescence_limit_matches_default() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let explicit = LiftoverOpts {
        coalescence_limit: Some("anc".to_string()),
        ..Default::default()
    };
    let a = run_lift(&aln, "ref", "qry", "chr1\t60\t90\n", &explicit).unwrap();
    let b = run_lift(
        &aln,
        "ref",
        "qry",
        "chr1\t60\t90\n",
        &LiftoverOpts::default(),
    )
    .unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_unknown_genome_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fork.hal");
    build_fork(&path);
    let aln = MmapAlignment::open(&path, AccessMode::ReadOnly).unwrap();

    let err = run_lift(
        &aln,
        "marsupial",
        "qry",
        "chr1\t0\t10\n",
        &LiftoverOpts::default(),
    )
    .unwrap_err();
    assert!(matches!(err, LiftError::UnknownGenome(_)));
}

#[test]
fn test_unfinished_writer_leaves_store_dirty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dirty.hal");
    let mut writer = AlignmentWriter::create(&path, 1 << 16).unwrap();
    writer.add_genome(GenomeDef {
        name: "anc".to_string(),
        parent: None,
        sequences: vec![SequenceDef {
            name: "aChr".to_string(),
            bases: bases(10),
        }],
        top_segments: vec![],
        bottom_segments: vec![],
    });
    // Simulate a crash before finish().
    drop(writer);
    assert!(matches!(
        MmapAlignment::open(&path, AccessMode::ReadOnly),
        Err(StoreError::DirtyOnOpen { .. })
    ));
}
