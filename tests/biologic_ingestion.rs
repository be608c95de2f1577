use std::fs;
use std::sync::Arc;

use chrono::{Duration, Utc};

use cell_harvester::config::HarvesterConfig;
use cell_harvester::harvest::{inspect, CycleReport, DatasetMetadata, HarvestOptions, Harvester, ImportRequest};
use cell_harvester::ingestion::FormatTag;
use cell_harvester::monitor::{MemoryStateStore, NeverOpen};
use cell_harvester::sink::MemoryRowSink;
use cell_harvester::types::{CanonicalColumn, CanonicalRow, FileState, MonitoredPath, ObservedFile, ObservedFileKey};
use cell_harvester::HarvestError;

const MPT: &[u8] = b"EC-Lab ASCII FILE\r\n\
Nb header lines : 5\r\n\
\r\n\
Acquisition started on : 03/26/2019 17:47:02.000\r\n\
mode\ttime/s\tEwe/V\tI/mA\t\r\n\
1\t0,0\t3,5\t0\t\r\n\
1\t1,0\t3,5\t500\t\r\n\
1\t3,0\t3,5\t1000\t\r\n";

/// Version-2 modular file holding one `VMP data` module.
fn mpr_file(ids: &[u16], records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = b"BIO-LOGIC MODULAR FILE\x1a".to_vec();
    out.resize(0x34, b' ');

    let mut data = vec![0u8; 405];
    data[0..4].copy_from_slice(&(records.len() as u32).to_le_bytes());
    data[4] = ids.len() as u8;
    for (i, id) in ids.iter().enumerate() {
        data[5 + 2 * i..7 + 2 * i].copy_from_slice(&id.to_le_bytes());
    }
    for r in records {
        data.extend_from_slice(r);
    }

    out.extend_from_slice(b"MODULE");
    out.extend_from_slice(format!("{:<10}", "VMP data").as_bytes());
    out.extend_from_slice(format!("{:<25}", "VMP data module").as_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(b"03/26/19");
    out.extend_from_slice(&data);
    out
}

/// `time/s` (f64), `Ewe/V` (f32), `I/mA` (f32).
fn gcpl_record(time: f64, volts: f32, milliamps: f32) -> Vec<u8> {
    let mut r = time.to_le_bytes().to_vec();
    r.extend_from_slice(&volts.to_le_bytes());
    r.extend_from_slice(&milliamps.to_le_bytes());
    r
}

fn gcpl_mpr() -> Vec<u8> {
    mpr_file(
        &[4, 6, 8],
        &[
            gcpl_record(0.0, 3.5, 0.0),
            gcpl_record(1.0, 3.5, 500.0),
            gcpl_record(3.0, 3.5, 1000.0),
        ],
    )
}

fn full_request() -> ImportRequest {
    ImportRequest::new(
        1,
        [
            CanonicalColumn::SampleNumber,
            CanonicalColumn::TestTime,
            CanonicalColumn::Volts,
            CanonicalColumn::Amps,
            CanonicalColumn::ChargeCapacity,
            CanonicalColumn::Power,
        ],
    )
}

/// Run one cycle over a directory holding just `name`, with the file already past its threshold.
fn harvest_one(name: &str, contents: &[u8]) -> (MemoryRowSink, CycleReport, ObservedFile) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(name), contents).unwrap();
    let monitored = MonitoredPath::new(1, "potentiostat", dir.path()).with_stable_time_secs(1);
    let harvester = Harvester::new(
        HarvesterConfig::new("potentiostat").with_monitored_path(monitored.clone()),
        Arc::new(MemoryStateStore::new()),
        Arc::new(NeverOpen),
        HarvestOptions::default(),
    )
    .unwrap();
    harvester
        .monitor()
        .poll_at(&monitored, Utc::now() - Duration::seconds(30))
        .unwrap();

    let mut sink = MemoryRowSink::new();
    let report = harvester
        .run_cycle(
            &mut |_: &ObservedFile, md: &DatasetMetadata| {
                assert_eq!(md.format().vendor(), "BIOLOGIC");
                Some(full_request())
            },
            &mut sink,
        )
        .unwrap();
    let file = harvester
        .store()
        .get(&ObservedFileKey::new(1, name))
        .unwrap()
        .unwrap();
    (sink, report, file)
}

fn column(rows: &[CanonicalRow], column: CanonicalColumn) -> Vec<f64> {
    rows.iter()
        .filter(|r| r.column == column)
        .map(|r| r.value.unwrap())
        .collect()
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-12, "{actual:?} vs {expected:?}");
    }
}

#[test]
fn mpt_metadata_comes_from_the_header_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gcpl.mpt");
    fs::write(&path, MPT).unwrap();

    let (adapter, md) = inspect(&path).unwrap();
    assert_eq!(adapter.format(), FormatTag::BiologicMpt);
    assert_eq!(md.start_date.unwrap().to_string(), "2019-03-26 17:47:02");
    assert_eq!(md.columns.len(), 4);
    assert_eq!(adapter.native_scale("I/mA"), 1e-3);
}

#[test]
fn mpt_current_is_harvested_in_amps() {
    let (sink, report, file) = harvest_one("gcpl.mpt", MPT);
    assert_eq!(report.imported.len(), 1);
    assert_eq!(file.state, FileState::Imported);

    let rows = sink.rows(1);
    assert_eq!(rows.len(), 3 * 6);
    assert_close(&column(rows, CanonicalColumn::SampleNumber), &[1.0, 2.0, 3.0]);
    assert_close(&column(rows, CanonicalColumn::Amps), &[0.0, 0.5, 1.0]);
    assert_close(&column(rows, CanonicalColumn::ChargeCapacity), &[0.0, 0.25, 1.75]);
    assert_close(&column(rows, CanonicalColumn::Power), &[0.0, 1.75, 3.5]);
}

#[test]
fn mpr_and_mpt_of_the_same_run_harvest_identically() {
    let (mpt_sink, _, _) = harvest_one("gcpl.mpt", MPT);
    let (mpr_sink, report, file) = harvest_one("gcpl.mpr", &gcpl_mpr());

    assert_eq!(report.imported[0].metadata.format(), FormatTag::BiologicMpr);
    assert_eq!(report.imported[0].metadata.file.properties["points"], "3");
    assert_eq!(file.state, FileState::Imported);
    assert_eq!(mpr_sink.rows(1), mpt_sink.rows(1));
}

#[test]
fn mpr_with_unknown_column_id_is_left_alone() {
    let bytes = mpr_file(&[4, 999], &[]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("odd.mpr");
    fs::write(&path, &bytes).unwrap();
    let Err(err) = inspect(&path) else {
        panic!("unknown column ids must be rejected");
    };
    assert!(err.to_string().contains("unknown column id 999"));
    assert!(matches!(err, HarvestError::UnsupportedFileType { .. }));

    let (sink, report, file) = harvest_one("odd.mpr", &bytes);
    assert_eq!(report.skipped, 1);
    assert_eq!(file.state, FileState::Stable);
    assert!(sink.rows(1).is_empty());
}
