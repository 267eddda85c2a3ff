//! Trace reader: record layout, repetition, id issue, and branch targets.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use tempfile::NamedTempFile;

use tracesim_core::sim::trace::{InstrIdSource, TraceReader, TRACE_RECORD_BYTES};

/// Builds one raw trace record.
fn record(ip: u64, is_branch: bool, branch_taken: bool, src_mem: u64, dst_mem: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TRACE_RECORD_BYTES);
    buf.extend_from_slice(&ip.to_le_bytes());
    buf.push(u8::from(is_branch));
    buf.push(u8::from(branch_taken));
    buf.extend_from_slice(&[0_u8; 2]); // destination registers
    buf.extend_from_slice(&[0_u8; 4]); // source registers
    buf.extend_from_slice(&dst_mem.to_le_bytes());
    buf.extend_from_slice(&0_u64.to_le_bytes());
    buf.extend_from_slice(&src_mem.to_le_bytes());
    for _ in 0..3 {
        buf.extend_from_slice(&0_u64.to_le_bytes());
    }
    buf
}

fn write_trace(records: &[Vec<u8>]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp trace");
    for rec in records {
        assert_eq!(rec.len(), TRACE_RECORD_BYTES);
        file.write_all(rec).expect("write record");
    }
    file.flush().expect("flush");
    file
}

fn reader_for(file: &NamedTempFile) -> TraceReader {
    let ids = Rc::new(RefCell::new(InstrIdSource::default()));
    TraceReader::new(file.path().to_str().expect("utf8 path"), 0, ids).expect("open trace")
}

#[test]
fn record_fields_decode() {
    let file = write_trace(&[
        record(0x400000, false, false, 0x5000, 0),
        record(0x400004, false, false, 0, 0x6000),
    ]);
    let mut reader = reader_for(&file);

    let first = reader.next_instr().expect("first");
    assert_eq!(first.ip.value(), 0x400000);
    assert!(!first.is_branch);

    let second = reader.next_instr().expect("second");
    assert_eq!(second.ip.value(), 0x400004);
    assert_eq!(second.destination_memory[0].value(), 0x6000);
}

/// Instruction ids are strictly increasing across repeats of the trace.
#[test]
fn instr_ids_strictly_increase() {
    let file = write_trace(&[
        record(0x1000, false, false, 0, 0),
        record(0x1004, false, false, 0, 0),
        record(0x1008, false, false, 0, 0),
    ]);
    let mut reader = reader_for(&file);

    let mut last_id = None;
    let mut ips = Vec::new();
    for _ in 0..10 {
        let instr = reader.next_instr().expect("instr");
        if let Some(prev) = last_id {
            assert!(instr.instr_id > prev, "ids must increase monotonically");
        }
        last_id = Some(instr.instr_id);
        ips.push(instr.ip.value());
    }

    // The trace repeats after three records.
    assert_eq!(&ips[0..3], &ips[3..6]);
    assert_eq!(&ips[0..3], &[0x1000, 0x1004, 0x1008]);
}

/// A taken branch's target is back-filled from the next record's address.
#[test]
fn branch_targets_back_fill() {
    let file = write_trace(&[
        record(0x2000, true, true, 0, 0),
        record(0x3000, false, false, 0, 0),
        record(0x3004, true, false, 0, 0),
        record(0x3008, false, false, 0, 0),
    ]);
    let mut reader = reader_for(&file);

    let taken = reader.next_instr().expect("taken branch");
    assert_eq!(taken.branch_target.value(), 0x3000);

    let _ = reader.next_instr().expect("fallthrough");
    let not_taken = reader.next_instr().expect("not-taken branch");
    assert_eq!(not_taken.branch_target.value(), 0, "not taken leaves no target");
}

/// Readers sharing an id source never issue the same id twice.
#[test]
fn shared_id_source_is_global() {
    let file_a = write_trace(&[record(0x1000, false, false, 0, 0)]);
    let file_b = write_trace(&[record(0x2000, false, false, 0, 0)]);

    let ids = Rc::new(RefCell::new(InstrIdSource::default()));
    let mut reader_a =
        TraceReader::new(file_a.path().to_str().expect("utf8"), 0, ids.clone()).expect("open a");
    let mut reader_b =
        TraceReader::new(file_b.path().to_str().expect("utf8"), 1, ids).expect("open b");

    let mut seen = std::collections::HashSet::new();
    for _ in 0..5 {
        assert!(seen.insert(reader_a.next_instr().expect("a").instr_id));
        assert!(seen.insert(reader_b.next_instr().expect("b").instr_id));
    }
}
