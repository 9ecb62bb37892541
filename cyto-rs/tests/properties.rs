use cyto_rs::aggregate::{aggregate, AggregateOptions};
use cyto_rs::annotate::{annotate, AnnotateOptions};
use cyto_rs::consensus::{consensus, ConsensusOptions};
use cyto_rs::normalize::{normalize, NormalizeOptions};
use cyto_rs::store::{InMemorySource, RawTable, Value};
use cyto_rs::{Predicate, RowFilter};
use profile_stats::Statistics;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::collections::BTreeSet;

fn raw(columns: &[&str], rows: Vec<Vec<Value>>) -> RawTable {
    RawTable::new(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
}

/// Random plate: every image lands in a random well of a 4x6 layout, and holds a random
/// number of cells.
fn random_source(rng: &mut Pcg64) -> (InMemorySource, BTreeSet<String>) {
    let n_images = rng.gen_range(5..40);
    let mut wells = BTreeSet::new();
    let mut image_rows = vec![];
    let mut cell_rows = vec![];
    for image in 1..=n_images {
        let well = format!("{}{:02}", ["A", "B", "C", "D"][rng.gen_range(0..4)], rng.gen_range(1..7));
        wells.insert(well.clone());
        image_rows.push(vec![
            Value::Integer(1),
            Value::Integer(image),
            Value::Text("P1".to_string()),
            Value::Text(well),
        ]);
        for object in 1..=rng.gen_range(1..20) {
            cell_rows.push(vec![
                Value::Integer(1),
                Value::Integer(image),
                Value::Integer(object),
                Value::Real(rng.gen_range(0.0..100.0)),
                Value::Real(rng.gen_range(-1.0..1.0)),
            ]);
        }
    }
    let image = raw(&["TableNumber", "ImageNumber", "Metadata_Plate", "Metadata_Well"], image_rows);
    let cells = raw(
        &["TableNumber", "ImageNumber", "ObjectNumber", "Cells_Area", "Cells_Texture"],
        cell_rows,
    );
    (InMemorySource::new(image).with_compartment("cells", cells), wells)
}

fn cells_only() -> AggregateOptions {
    AggregateOptions {
        compartments: vec!["cells".to_string()],
        ..AggregateOptions::default()
    }
}

#[test]
fn test_one_profile_per_stratum() {
    let mut rng = Pcg64::seed_from_u64(0);
    for _ in 0..20 {
        let (source, wells) = random_source(&mut rng);
        let out = aggregate(&source, &cells_only()).unwrap();
        assert_eq!(out.profiles.nrows(), wells.len());
        assert_eq!(out.cell_counts.nrows(), wells.len());
        let got: BTreeSet<String> = out.profiles.metadata_values("Metadata_Well").unwrap().iter().cloned().collect();
        assert_eq!(got, wells);
    }
}

#[test]
fn test_annotation_keeps_rows_and_consensus_counts_keys() {
    let mut rng = Pcg64::seed_from_u64(1);
    for _ in 0..20 {
        let (source, wells) = random_source(&mut rng);
        let profiles = aggregate(&source, &cells_only()).unwrap().profiles;

        // every well of the layout, two treatments
        let mut rows = vec![];
        for r in ["A", "B", "C", "D"] {
            for c in 1..7 {
                let treatment = if c % 2 == 0 { "DMSO" } else { "drug" };
                rows.push(vec![
                    Value::Text(format!("{r}{c:02}")),
                    Value::Text(treatment.to_string()),
                ]);
            }
        }
        let platemap = raw(&["well_position", "treatment"], rows);
        let annotated = annotate(&profiles, &platemap, &AnnotateOptions::default()).unwrap();
        assert_eq!(annotated.nrows(), profiles.nrows());

        let opts = ConsensusOptions {
            replicate_columns: vec!["Metadata_treatment".to_string()],
            ..ConsensusOptions::default()
        };
        let c = consensus(&annotated, &opts).unwrap();
        let treatments: BTreeSet<&String> = annotated.metadata_values("Metadata_treatment").unwrap().iter().collect();
        assert_eq!(c.nrows(), treatments.len());
        assert!(wells.len() >= c.nrows());
    }
}

#[test]
fn test_reference_rows_are_standardized() {
    let mut rng = Pcg64::seed_from_u64(2);
    let (source, _) = random_source(&mut rng);
    let mut profiles = aggregate(&source, &cells_only()).unwrap().profiles;
    let n = profiles.nrows();
    let groups: Vec<String> = (0..n).map(|i| if i % 2 == 0 { "ref" } else { "other" }.to_string()).collect();
    profiles
        .push_metadata(cyto_rs::MetadataColumn::new("Metadata_group", groups.clone()))
        .unwrap();

    let opts = NormalizeOptions {
        samples: RowFilter::Where(Predicate::equals("Metadata_group", "ref")),
        ..NormalizeOptions::default()
    };
    let out = normalize(&profiles, &opts).unwrap();
    let reference: Vec<usize> = (0..n).filter(|i| groups[*i] == "ref").collect();
    for j in 0..out.profiles.n_features() {
        let col = out.profiles.feature(j);
        let v: Vec<f64> = reference.iter().map(|&r| col[r]).collect();
        if out.zero_scale.contains(&out.profiles.feature_names()[j]) {
            continue;
        }
        assert!(v.mean().abs() < 1e-9);
        assert!((v.std(0.0) - 1.0).abs() < 1e-9);
    }
}
