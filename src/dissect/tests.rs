use super::*;
use crate::core::memory::MemoryImage;

const CODE: u64 = 0x40_0000;
const DATA: u64 = 0x60_0000;

/// Tiny x86-64 assembler for the handful of encodings the tests need
struct Asm {
    base: u64,
    bytes: Vec<u8>,
}

impl Asm {
    fn new(base: u64) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    fn here(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    fn call(&mut self, target: u64) {
        let at = self.here();
        self.bytes.push(0xE8);
        let rel = target.wrapping_sub(at + 5) as i64 as i32;
        self.bytes.extend_from_slice(&rel.to_le_bytes());
    }

    fn short(&mut self, opcode: u8, target: u64) {
        let rel = target.wrapping_sub(self.here() + 2) as i64 as i8;
        self.bytes.extend_from_slice(&[opcode, rel as u8]);
    }

    fn jne(&mut self, target: u64) {
        self.short(0x75, target);
    }

    fn jmp(&mut self, target: u64) {
        self.short(0xEB, target);
    }

    fn lea_rdi(&mut self, target: u64) {
        let at = self.here();
        self.bytes.extend_from_slice(&[0x48, 0x8D, 0x3D]);
        let rel = target.wrapping_sub(at + 7) as i64 as i32;
        self.bytes.extend_from_slice(&rel.to_le_bytes());
    }

    fn mov_esi(&mut self, imm: u32) {
        self.bytes.push(0xBE);
        self.bytes.extend_from_slice(&imm.to_le_bytes());
    }

    fn nop(&mut self) {
        self.bytes.push(0x90);
    }

    fn ret(&mut self) {
        self.bytes.push(0xC3);
    }
}

fn data_segment() -> Vec<u8> {
    let mut data = vec![0u8; 0x30];
    data[..6].copy_from_slice(b"hello\0");
    data[0x10..0x13].copy_from_slice(&[0xFF, 0xFE, 0x00]);
    // 0x20 starts with NUL
    data
}

/// Code region with calls, jumps and data references, plus the function it calls
fn fixture() -> (MemoryImage, MemoryRegion) {
    let mut asm = Asm::new(CODE);
    let function = CODE + 0x200;
    for i in 0..12u64 {
        let top = asm.here();
        asm.lea_rdi(DATA + (i % 3) * 0x10);
        asm.call(function);
        asm.jne(top);
        asm.mov_esi((DATA + 0x10) as u32);
        asm.nop();
    }
    let after = asm.here() + 2;
    asm.jmp(after);
    asm.ret();
    while asm.here() < function {
        asm.nop();
    }
    asm.ret();

    let code = asm.bytes;
    let memory = MemoryImage::new()
        .with_segment(CODE, &code)
        .with_segment(DATA, &data_segment());
    let region = MemoryRegion::new(CODE, CODE + code.len() as u64, "r-xp", "/usr/bin/fixture");
    (memory, region)
}

fn options(chunk_size: usize) -> DissectOptions {
    DissectOptions {
        chunk_size,
        ..DissectOptions::default()
    }
}

fn dissect(memory: &MemoryImage, regions: &[MemoryRegion], chunk_size: usize, discard: bool) -> CrossReferenceStores {
    let dissector = CodeDissector::new(memory, DisassemblyEngine::new(), options(chunk_size));
    let mut stores = CrossReferenceStores::new();
    let outcome = dissector.run(
        regions,
        discard,
        &mut stores,
        &CancellationToken::new(),
        &mut NoopObserver,
    );
    assert_eq!(outcome, DissectionOutcome::Finished);
    stores
}

#[test]
fn test_indexes_calls_jumps_and_data() {
    let (memory, region) = fixture();
    let stores = dissect(&memory, &[region], 0x10000, false);

    assert_eq!(stores.calls[&(CODE + 0x200)].len(), 12);
    assert_eq!(stores.jumps[&CODE][&(CODE + 12)], "jne");
    assert_eq!(stores.jumps.len(), 13);
    assert_eq!(stores.strings.len(), 3);
    assert!(stores.strings.contains_key(&DATA));
    assert!(stores.strings.contains_key(&(DATA + 0x20)));
    // lea and mov both reference DATA + 0x10
    assert_eq!(stores.strings[&(DATA + 0x10)].len(), 4 + 12);
}

#[test]
fn test_chunk_size_does_not_change_the_result() {
    let (memory, region) = fixture();
    let regions = [region];
    let whole = dissect(&memory, &regions, 0x10000, false);
    for chunk in [16, 23, 64, 100] {
        assert_eq!(dissect(&memory, &regions, chunk, false), whole, "chunk size {}", chunk);
    }
}

#[test]
fn test_dissecting_twice_is_idempotent() {
    let (memory, region) = fixture();
    let regions = [region];
    let dissector = CodeDissector::new(&memory, DisassemblyEngine::new(), options(32));
    let mut stores = CrossReferenceStores::new();
    let cancel = CancellationToken::new();
    dissector.run(&regions, false, &mut stores, &cancel, &mut NoopObserver);
    let first = stores.clone();
    dissector.run(&regions, false, &mut stores, &cancel, &mut NoopObserver);
    assert_eq!(stores, first);
}

#[test]
fn test_discard_invalid_strings() {
    let (memory, region) = fixture();
    let stores = dissect(&memory, &[region], 0x10000, true);
    assert_eq!(stores.strings.len(), 1);
    assert!(stores.strings.contains_key(&DATA));
    // Code references are unaffected by the string filter
    assert_eq!(stores.calls.len(), 1);
    assert_eq!(stores.jumps.len(), 13);
}

#[test]
fn test_is_memory_valid() {
    let (memory, _) = fixture();
    let dissector = CodeDissector::new(&memory, DisassemblyEngine::new(), DissectOptions::default());
    assert!(dissector.is_memory_valid(DATA, true));
    assert!(!dissector.is_memory_valid(DATA + 0x10, true));
    assert!(!dissector.is_memory_valid(DATA + 0x20, true));
    assert!(dissector.is_memory_valid(DATA + 0x20, false));
    assert!(!dissector.is_memory_valid(0xdead_0000, false));
}

#[test]
fn test_unreadable_region_is_skipped() {
    let (memory, region) = fixture();
    let ghost = MemoryRegion::new(0x80_0000, 0x80_1000, "r-xp", "[ghost]");
    let with_ghost = dissect(&memory, &[ghost, region.clone()], 0x10000, false);
    assert_eq!(with_ghost, dissect(&memory, &[region], 0x10000, false));
}

#[test]
fn test_precancelled_run_leaves_stores_untouched() {
    let (memory, region) = fixture();
    let dissector = CodeDissector::new(&memory, DisassemblyEngine::new(), options(16));
    let mut stores = CrossReferenceStores::new();
    stores.insert_call(0x1234, 0x5678);
    let before = stores.clone();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = dissector.run(&[region], false, &mut stores, &cancel, &mut NoopObserver);
    assert_eq!(outcome, DissectionOutcome::Canceled);
    assert_eq!(stores, before);
}

/// Cancels after the first indexed chunk and keeps every progress report
struct CancelAfterFirst {
    cancel: CancellationToken,
    progress: Vec<DissectionProgress>,
    finished_regions: usize,
}

impl DissectionObserver for CancelAfterFirst {
    fn chunk_indexed(&mut self, progress: &DissectionProgress) {
        self.progress.push(progress.clone());
        self.cancel.cancel();
    }

    fn region_finished(&mut self, _stores: &CrossReferenceStores) {
        self.finished_regions += 1;
    }
}

#[test]
fn test_cancel_between_chunks_keeps_completed_chunks() {
    let (memory, region) = fixture();
    let dissector = CodeDissector::new(&memory, DisassemblyEngine::new(), options(32));
    let cancel = CancellationToken::new();
    let mut observer = CancelAfterFirst {
        cancel: cancel.clone(),
        progress: Vec::new(),
        finished_regions: 0,
    };
    let mut stores = CrossReferenceStores::new();
    let outcome = dissector.run(&[region.clone()], false, &mut stores, &cancel, &mut observer);

    assert_eq!(outcome, DissectionOutcome::Canceled);
    assert_eq!(observer.progress.len(), 1);
    assert_eq!(observer.finished_regions, 0);
    let first = &observer.progress[0];
    assert_eq!(first.counts, stores.counts());
    assert_eq!(first.scanned_range.0, region.start);
    assert!(first.scanned_range.1 <= region.start + 32);
    assert!(!stores.is_empty());
}

#[derive(Default)]
struct Recorder {
    progress: Vec<DissectionProgress>,
    finished_regions: usize,
}

impl DissectionObserver for Recorder {
    fn chunk_indexed(&mut self, progress: &DissectionProgress) {
        self.progress.push(progress.clone());
    }

    fn region_finished(&mut self, _stores: &CrossReferenceStores) {
        self.finished_regions += 1;
    }
}

#[test]
fn test_progress_reports_cover_every_region() {
    let (memory, region) = fixture();
    let data = MemoryRegion::new(DATA, DATA + 0x30, "r-xp", "/usr/bin/fixture");
    let dissector = CodeDissector::new(&memory, DisassemblyEngine::new(), options(64));
    let mut recorder = Recorder::default();
    let mut stores = CrossReferenceStores::new();
    dissector.run(
        &[region.clone(), data],
        false,
        &mut stores,
        &CancellationToken::new(),
        &mut recorder,
    );

    assert_eq!(recorder.finished_regions, 2);
    let last = recorder.progress.last().unwrap();
    assert_eq!(last.region_label(), "Region 2 of 2");
    assert_eq!(last.counts, stores.counts());

    // Chunks of one region are contiguous and ordered
    let first_region: Vec<_> = recorder
        .progress
        .iter()
        .filter(|p| p.region_index == 0)
        .collect();
    assert!(first_region.len() > 1);
    for pair in first_region.windows(2) {
        assert!(pair[1].scanned_range.0 > pair[0].scanned_range.0);
        assert!(pair[1].scanned_range.0 <= pair[0].scanned_range.1);
    }
    assert_eq!(first_region.last().unwrap().scanned_range.1, region.end);
}
