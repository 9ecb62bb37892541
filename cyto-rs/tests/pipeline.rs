use assert_approx_eq::assert_approx_eq;
use cyto_rs::aggregate::AggregateOptions;
use cyto_rs::config::{run_pipeline, PipelineConfig};
use cyto_rs::consensus::{ConsensusOperation, ConsensusOptions};
use cyto_rs::io::{read_table, ReadOptions, WriteOptions};
use cyto_rs::normalize::NormalizeOptions;
use cyto_rs::{Predicate, ProfileTable, RowFilter};
use rusqlite::{params, Connection};
use std::path::Path;

const WELLS: [&str; 6] = ["A01", "A02", "A03", "A04", "A05", "A06"];
const AREA: [f64; 6] = [1.0, 1.0, 1.0, 2.0, 2.0, 2.0];
const INTENSITY: [f64; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

/// One image per well, two identical cells per image.
fn write_store(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE Image (TableNumber INTEGER, ImageNumber INTEGER, Metadata_Plate TEXT, Metadata_Well TEXT);
         CREATE TABLE Cells (TableNumber INTEGER, ImageNumber INTEGER, ObjectNumber INTEGER,
                             Cells_AreaShape_Area REAL, Cells_Intensity_MeanIntensity_DNA REAL);",
    )
    .unwrap();
    for (i, well) in WELLS.iter().enumerate() {
        let image = i as i64 + 1;
        conn.execute("INSERT INTO Image VALUES (1, ?1, 'P1', ?2)", params![image, well])
            .unwrap();
        for object in 1..=2 {
            conn.execute(
                "INSERT INTO Cells VALUES (1, ?1, ?2, ?3, ?4)",
                params![image, object, AREA[i], INTENSITY[i]],
            )
            .unwrap();
        }
    }
}

fn write_platemap(path: &Path) {
    let mut text = String::from("well_position\tclone_number\ttreatment\n");
    let clones = ["WT", "WT", "BZ001", "BZ001", "BZ002", "BZ002"];
    for (i, well) in WELLS.iter().enumerate() {
        let treatment = if i < 3 { "0.1% DMSO" } else { "2.1 nM bortezomib" };
        text.push_str(&format!("{}\t{}\t{}\n", well, clones[i], treatment));
    }
    std::fs::write(path, text).unwrap();
}

fn config(dir: &Path) -> PipelineConfig {
    write_store(&dir.join("P1.sqlite"));
    write_platemap(&dir.join("platemap.txt"));
    PipelineConfig {
        plate: "P1".to_string(),
        sqlite: dir.join("P1.sqlite"),
        platemap: dir.join("platemap.txt"),
        platemap_delimiter: None,
        external_metadata: None,
        blocklist: None,
        output_dir: dir.join("profiles"),
        write: WriteOptions::default(),
        aggregate: AggregateOptions {
            compartments: vec!["cells".to_string()],
            ..AggregateOptions::default()
        },
        annotate: Default::default(),
        normalize: NormalizeOptions {
            samples: RowFilter::Where(Predicate::equals("Metadata_treatment", "0.1% DMSO")),
            ..NormalizeOptions::default()
        },
        feature_select: Default::default(),
        consensus: ConsensusOptions {
            replicate_columns: vec!["Metadata_clone_number".to_string(), "Metadata_treatment".to_string()],
            operation: ConsensusOperation::Median,
            ..ConsensusOptions::default()
        },
    }
}

fn assert_same(a: &ProfileTable, b: &ProfileTable) {
    assert_eq!(a.metadata(), b.metadata());
    assert_eq!(a.feature_names(), b.feature_names());
    assert_eq!(a.features().dim(), b.features().dim());
    for (x, y) in a.features().iter().zip(b.features()) {
        assert!(x == y || (x.is_nan() && y.is_nan()), "{x} != {y}");
    }
}

#[test]
fn test_standardize_against_controls_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (tables, outputs) = run_pipeline(&config(dir.path())).unwrap();

    assert_eq!(tables.aggregated.nrows(), 6);
    assert_eq!(tables.augmented.nrows(), 6);

    let n = &tables.normalized;
    let area = n.feature_index("Cells_AreaShape_Area").unwrap();
    let intensity = n.feature_index("Cells_Intensity_MeanIntensity_DNA").unwrap();
    let treatment = n.metadata_values("Metadata_treatment").unwrap();
    let sd = (2.0f64 / 3.0).sqrt();
    for row in 0..6 {
        let control = treatment[row] == "0.1% DMSO";
        assert_eq!(control, row < 3);
        let a = n.features()[[row, area]];
        if control {
            assert_approx_eq!(a, 0.0);
        } else {
            // zero scale on the controls: centered on the control mean only
            assert!(a > 0.0);
            assert_approx_eq!(a, 1.0);
        }
        assert_approx_eq!(n.features()[[row, intensity]], (INTENSITY[row] - 2.0) / sd);
    }

    // both features survive selection; consensus has one row per (clone, treatment)
    assert_eq!(tables.feature_selected.n_features(), 2);
    assert_eq!(tables.consensus.nrows(), 4);
    assert_eq!(
        tables.consensus.metadata_names(),
        vec!["Metadata_clone_number", "Metadata_treatment"]
    );

    for (path, table) in [
        (&outputs.aggregated, &tables.aggregated),
        (&outputs.augmented, &tables.augmented),
        (&outputs.normalized, &tables.normalized),
        (&outputs.feature_selected, &tables.feature_selected),
        (&outputs.consensus, &tables.consensus),
    ] {
        let back = read_table(path, &ReadOptions::default()).unwrap();
        assert_same(table, &back);
    }

    let counts = read_table(&outputs.cell_counts, &ReadOptions::default()).unwrap();
    assert_eq!(counts.metadata_values("Metadata_Count_Cells").unwrap(), &["2"; 6]);
    // counts carry the platemap annotations of their well
    assert_eq!(
        counts.metadata_values("Metadata_clone_number").unwrap(),
        &["WT", "WT", "BZ001", "BZ001", "BZ002", "BZ002"]
    );
    assert_eq!(
        &counts.metadata_values("Metadata_treatment").unwrap()[..4],
        &["0.1% DMSO", "0.1% DMSO", "0.1% DMSO", "2.1 nM bortezomib"]
    );
    assert!(outputs.selection_report.exists());
}

#[test]
fn test_pipeline_outputs_are_reproducible() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let (_, out_a) = run_pipeline(&config(a.path())).unwrap();
    let (_, out_b) = run_pipeline(&config(b.path())).unwrap();
    assert_eq!(
        std::fs::read(&out_a.consensus).unwrap(),
        std::fs::read(&out_b.consensus).unwrap()
    );
}

#[test]
fn test_missing_platemap_join_column() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.annotate.join_on.metadata = "Metadata_plate_well".to_string();
    let err = run_pipeline(&cfg).unwrap_err();
    assert!(err.to_string().contains("Metadata_plate_well"));
}
