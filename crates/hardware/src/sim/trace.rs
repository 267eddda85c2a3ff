//! Trace reading.
//!
//! Traces are sequences of fixed-size little-endian records: the program
//! counter, branch flags, zero-terminated register index fields, and the
//! memory operand addresses. Readers repeat their trace on EOF, back-fill
//! each taken branch's target with the next record's instruction pointer,
//! and draw instruction ids from a fleet-wide counter so ids stay unique
//! across cores and strictly increasing per reader.
//!
//! Compressed traces (`.gz`, `.xz`, `.bz2`) and remote URIs (`http://`,
//! `https://`) are piped through the standard external tools rather than
//! decompressed in-process.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::rc::Rc;

use tracing::info;

use crate::common::constants::{NUM_INSTR_DESTINATIONS, NUM_INSTR_SOURCES};
use crate::core::instruction::OooInstr;

/// Size of one trace record in bytes.
pub const TRACE_RECORD_BYTES: usize =
    8 + 1 + 1 + NUM_INSTR_DESTINATIONS + NUM_INSTR_SOURCES + 8 * NUM_INSTR_DESTINATIONS
        + 8 * NUM_INSTR_SOURCES;

/// Fleet-wide instruction id counter.
///
/// One source is shared by every reader so ids are globally unique and
/// monotonic in issue order.
#[derive(Debug, Default)]
pub struct InstrIdSource {
    next: u64,
}

impl InstrIdSource {
    /// Issues the next id.
    pub fn issue(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Shared handle to the id source.
pub type InstrIdSourceRef = Rc<RefCell<InstrIdSource>>;

/// Sets a taken branch's target to the next fetched instruction's address.
pub fn apply_branch_target(mut branch: OooInstr, target: &OooInstr) -> OooInstr {
    if branch.is_branch && branch.branch_taken {
        branch.branch_target = target.ip;
    }
    branch
}

enum TraceSource {
    Plain(File),
    Piped {
        child: Child,
        stdout: std::process::ChildStdout,
    },
}

impl Read for TraceSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(f) => f.read(buf),
            Self::Piped { stdout, .. } => stdout.read(buf),
        }
    }
}

impl Drop for TraceSource {
    fn drop(&mut self) {
        if let Self::Piped { child, .. } = self {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn open_source(path: &str) -> io::Result<TraceSource> {
    let pipe_through = |program: &str, args: &[&str]| -> io::Result<TraceSource> {
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("no stdout from decompressor"))?;
        Ok(TraceSource::Piped { child, stdout })
    };

    if path.starts_with("http://") || path.starts_with("https://") {
        pipe_through("curl", &["-s", path])
    } else if path.ends_with(".gz") {
        pipe_through("gzip", &["-dc", path])
    } else if path.ends_with(".xz") {
        pipe_through("xz", &["-dc", path])
    } else if path.ends_with(".bz2") {
        pipe_through("bzip2", &["-dc", path])
    } else {
        Ok(TraceSource::Plain(File::open(path)?))
    }
}

/// A repeating reader over one trace file.
pub struct TraceReader {
    path: String,
    cpu: usize,
    source: TraceSource,
    lookahead: Option<OooInstr>,
    ids: InstrIdSourceRef,
}

impl TraceReader {
    /// Opens a trace for the given CPU.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or the decompressor cannot be
    /// spawned.
    pub fn new(path: &str, cpu: usize, ids: InstrIdSourceRef) -> io::Result<Self> {
        let source = open_source(path)?;
        Ok(Self {
            path: path.to_string(),
            cpu,
            source,
            lookahead: None,
            ids,
        })
    }

    /// The trace path this reader repeats.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn read_record(&mut self) -> io::Result<Option<OooInstr>> {
        let mut buf = [0_u8; TRACE_RECORD_BYTES];
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => return Err(io::Error::other("trace ends mid-record")),
                n => filled += n,
            }
        }

        fn u64_at(buf: &[u8], at: &mut usize) -> u64 {
            let v = u64::from_le_bytes(buf[*at..*at + 8].try_into().unwrap_or([0; 8]));
            *at += 8;
            v
        }

        let mut at = 0;
        let ip = u64_at(&buf, &mut at);
        let is_branch = buf[at] != 0;
        at += 1;
        let branch_taken = buf[at] != 0;
        at += 1;

        let mut destination_registers = [0_u8; NUM_INSTR_DESTINATIONS];
        destination_registers.copy_from_slice(&buf[at..at + NUM_INSTR_DESTINATIONS]);
        at += NUM_INSTR_DESTINATIONS;
        let mut source_registers = [0_u8; NUM_INSTR_SOURCES];
        source_registers.copy_from_slice(&buf[at..at + NUM_INSTR_SOURCES]);
        at += NUM_INSTR_SOURCES;

        let mut destination_memory = [0_u64; NUM_INSTR_DESTINATIONS];
        for slot in &mut destination_memory {
            *slot = u64_at(&buf, &mut at);
        }
        let mut source_memory = [0_u64; NUM_INSTR_SOURCES];
        for slot in &mut source_memory {
            *slot = u64_at(&buf, &mut at);
        }

        Ok(Some(OooInstr::new(
            self.cpu,
            ip,
            is_branch,
            branch_taken,
            destination_registers,
            source_registers,
            destination_memory,
            source_memory,
        )))
    }

    fn read_or_repeat(&mut self) -> io::Result<OooInstr> {
        if let Some(instr) = self.read_record()? {
            return Ok(instr);
        }
        info!(trace = %self.path, "reached end of trace, repeating");
        self.source = open_source(&self.path)?;
        self.read_record()?
            .ok_or_else(|| io::Error::other(format!("trace {} is empty", self.path)))
    }

    /// Produces the next instruction, with its branch target back-filled
    /// and a fresh id assigned.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or an empty trace.
    pub fn next_instr(&mut self) -> io::Result<OooInstr> {
        let current = match self.lookahead.take() {
            Some(instr) => instr,
            None => self.read_or_repeat()?,
        };
        let upcoming = self.read_or_repeat()?;
        let mut current = apply_branch_target(current, &upcoming);
        self.lookahead = Some(upcoming);

        current.instr_id = self.ids.borrow_mut().issue();
        Ok(current)
    }
}
