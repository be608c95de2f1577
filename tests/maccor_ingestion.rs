use std::collections::BTreeSet;
use std::fs;

use cell_harvester::harvest::inspect;
use cell_harvester::ingestion::{classify, FormatTag};
use cell_harvester::processing::{resolve, ColumnOverrides, Derivation, DerivationEngine, DerivationState};
use cell_harvester::types::{CanonicalColumn, CanonicalValues, NativeRow, RawValue};
use cell_harvester::{HarvestError, HarvestResult};

const MACCOR_TSV: &str = "Today's Date\t04/02/2019\tDate of Test:\t03/26/2019 5:47:02 PM\tFilename:\tC:\\Data\\MIMS\\cell15.txt\n\
Rec#\tCyc#\tStep\tTest Time\tStep Time\tAmp-hr\tWatt-hr\tAmps\tVolts\tState\tES\n\
1\t0\t1\t00:00:00\t00:00:00\t0\t0\t0\t4.1\tR\t0\n\
2\t0\t1\t00:00:10\t00:00:10\t0\t0\t0\t4.1\tR\t1\n\
3\t0\t2\t00:00:20\t00:00:00\t0.001\t0.004\t0.5\t4.05\tD\t0\n\
4\t1\t2\t1d 00:00:00\t00:00:10\t0.002\t0.008\t0.5\t4.0\tD\t0\n";

fn fixture(name: &str, contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    (dir, path)
}

fn required(columns: &[CanonicalColumn]) -> BTreeSet<CanonicalColumn> {
    columns.iter().copied().collect()
}

#[test]
fn maccor_text_with_metadata_line_is_inspected() {
    let (_d, path) = fixture("cell15.txt", MACCOR_TSV);
    let (adapter, md) = inspect(&path).unwrap();

    assert_eq!(adapter.format(), FormatTag::MaccorTsv);
    assert_eq!(md.format.tags(), ["MACCOR", "TSV", "utf-8"]);
    assert_eq!(md.properties["Filename"], "C:\\Data\\MIMS\\cell15.txt");
    assert_eq!(md.start_date.unwrap().to_string(), "2019-03-26 17:47:02");

    let names: Vec<&str> = md.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names[0], "Rec#");
    assert_eq!(names.len(), 11);
    let numeric = md.numeric_columns_with_data();
    assert!(numeric.contains("Test Time"));
    assert!(!numeric.contains("State"));
}

#[test]
fn capacity_present_in_the_file_is_read_not_derived() {
    let (_d, path) = fixture("cell15.txt", MACCOR_TSV);
    let (adapter, md) = inspect(&path).unwrap();

    let plan = resolve(
        &required(&[CanonicalColumn::SampleNumber, CanonicalColumn::ChargeCapacity]),
        &ColumnOverrides::new(),
        adapter.as_ref(),
        &md,
    )
    .unwrap();
    assert!(plan.derived().is_empty());
    let natives: Vec<&str> = plan.sourced().iter().map(|s| s.native.as_str()).collect();
    assert_eq!(natives, vec!["Rec#", "Amp-hr"]);
}

#[test]
fn unmapping_a_default_column_forces_derivation() {
    let (_d, path) = fixture("cell15.txt", MACCOR_TSV);
    let (adapter, md) = inspect(&path).unwrap();

    let mut overrides = ColumnOverrides::new();
    overrides.insert("Amp-hr".to_string(), None);
    let plan = resolve(
        &required(&[CanonicalColumn::ChargeCapacity]),
        &overrides,
        adapter.as_ref(),
        &md,
    )
    .unwrap();
    assert_eq!(plan.derived(), &[Derivation::ChargeCapacity]);
    assert_eq!(
        plan.desired_native_columns(),
        ["Amps", "Test Time"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<String>>()
    );
}

#[test]
fn streamed_rows_convert_clock_durations_to_seconds() {
    let (_d, path) = fixture("cell15.txt", MACCOR_TSV);
    let (adapter, md) = inspect(&path).unwrap();
    let plan = resolve(
        &required(&[CanonicalColumn::TestTime, CanonicalColumn::StepTime]),
        &ColumnOverrides::new(),
        adapter.as_ref(),
        &md,
    )
    .unwrap();

    let rows: Vec<NativeRow> = adapter
        .stream_rows(&path, &plan.desired_native_columns())
        .unwrap()
        .collect::<HarvestResult<_>>()
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[2]["Test Time"], RawValue::Number(20.0));
    assert_eq!(rows[3]["Test Time"], RawValue::Number(86_400.0));
    // Only the projected columns are materialised.
    assert_eq!(rows[0].keys().collect::<Vec<_>>(), vec!["Step Time", "Test Time"]);
}

#[test]
fn comma_export_derives_power_and_capacity() {
    let (_d, path) = fixture(
        "cell16.csv",
        "Rec#,Test Time,Amps,Volts\n1,0,0,4.0\n2,10,0.5,4.0\n3,20,0.5,\n",
    );
    assert_eq!(classify(&path).unwrap(), FormatTag::MaccorCsv);
    let (adapter, md) = inspect(&path).unwrap();
    let plan = resolve(
        &required(&[
            CanonicalColumn::SampleNumber,
            CanonicalColumn::ChargeCapacity,
            CanonicalColumn::Power,
        ]),
        &ColumnOverrides::new(),
        adapter.as_ref(),
        &md,
    )
    .unwrap();
    let engine = DerivationEngine::new(plan);

    let mut state = DerivationState::fresh();
    let mut samples: Vec<CanonicalValues> = Vec::new();
    let stream = adapter
        .stream_rows(&path, &engine.plan().desired_native_columns())
        .unwrap();
    for (idx, native) in stream.enumerate() {
        let values = engine.plan().to_canonical(idx + 1, &native.unwrap()).unwrap();
        let (row, next) = engine.derive_row(idx as u64 + 1, values, state).unwrap();
        state = next;
        samples.push(row.values);
    }

    let capacity: Vec<f64> = samples
        .iter()
        .map(|s| s[&CanonicalColumn::ChargeCapacity].unwrap())
        .collect();
    assert_eq!(capacity, vec![0.0, 2.5, 7.5]);
    assert_eq!(samples[1][&CanonicalColumn::Power], Some(2.0));
    // Missing volts leave power null rather than failing the row.
    assert_eq!(samples[2][&CanonicalColumn::Power], None);
    assert_eq!(samples[2].len(), 3);
}

#[test]
fn text_that_is_not_a_table_is_unsupported() {
    let (_d, path) = fixture("readme.txt", "Cell 15 formation,\n");
    // A trailing comma is enough for the sniff; the header check rejects it.
    let Err(err) = inspect(&path) else {
        panic!("a one-column header must not inspect");
    };
    assert!(matches!(err, HarvestError::UnsupportedFileType { .. }));
}
