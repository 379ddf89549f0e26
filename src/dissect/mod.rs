//! Code Dissector
//!
//! Disassembles executable regions chunk by chunk and indexes every
//! referenced jump target, call target and data address.
//!
//! A chunk boundary can cut an instruction in half, so the trailing
//! `boundary_discard` instructions of every chunk except a region's last are
//! thrown away and decoded again at the start of the next chunk. A chunk is
//! either indexed completely or not at all; cancellation is only observed
//! between chunks.

pub mod search;
pub mod store;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::core::memory::{AddressSpace, MemoryRegion};
use crate::disasm::engine::{DisassembledInstruction, DisassemblyEngine, FlowKind};
use crate::ipc::cancel::CancellationToken;

pub use store::{CrossReferenceStores, ReferenceCounts};

/// Progress snapshot published after every chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DissectionProgress {
    pub current_region: MemoryRegion,
    /// Zero-based index into the region list
    pub region_index: u32,
    pub region_count: u32,
    /// Last indexed chunk, `[start, end)`
    pub scanned_range: (u64, u64),
    pub counts: ReferenceCounts,
}

impl DissectionProgress {
    /// `Region 2 of 7`
    pub fn region_label(&self) -> String {
        format!("Region {} of {}", self.region_index + 1, self.region_count)
    }
}

/// How a dissection run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DissectionOutcome {
    Finished,
    Canceled,
}

/// Lifecycle of the dissection of one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DissectState {
    Running,
    Finished,
    Canceled,
}

impl From<DissectionOutcome> for DissectState {
    fn from(outcome: DissectionOutcome) -> Self {
        match outcome {
            DissectionOutcome::Finished => DissectState::Finished,
            DissectionOutcome::Canceled => DissectState::Canceled,
        }
    }
}

/// Side-channel status blob of a dissection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DissectionStatus {
    pub state: DissectState,
    pub progress: Option<DissectionProgress>,
}

/// Receives progress while a dissection runs
pub trait DissectionObserver {
    /// Called after every indexed chunk
    fn chunk_indexed(&mut self, _progress: &DissectionProgress) {}

    /// Called when a region is done (fully scanned or abandoned)
    fn region_finished(&mut self, _stores: &CrossReferenceStores) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl DissectionObserver for NoopObserver {}

/// Dissection tunables
#[derive(Debug, Clone, Copy)]
pub struct DissectOptions {
    pub chunk_size: usize,
    pub boundary_discard: usize,
    pub string_probe_len: usize,
}

impl From<&EngineConfig> for DissectOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            boundary_discard: config.boundary_discard,
            string_probe_len: config.string_probe_len,
        }
    }
}

impl Default for DissectOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Disassembles regions and fills [`CrossReferenceStores`]
pub struct CodeDissector<'a> {
    memory: &'a dyn AddressSpace,
    engine: DisassemblyEngine,
    options: DissectOptions,
}

impl<'a> CodeDissector<'a> {
    pub fn new(memory: &'a dyn AddressSpace, engine: DisassemblyEngine, options: DissectOptions) -> Self {
        Self {
            memory,
            engine,
            options,
        }
    }

    /// Whether `address` can be indexed. With `discard_invalid_strings`
    /// the bytes there must also start a non-empty UTF-8 string.
    pub fn is_memory_valid(&self, address: u64, discard_invalid_strings: bool) -> bool {
        if !discard_invalid_strings {
            return self.memory.is_readable(address);
        }
        let probe = self.memory.read(address, self.options.string_probe_len);
        match probe.data.first() {
            None | Some(0) => false,
            Some(_) => {
                let end = probe
                    .data
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(probe.data.len());
                std::str::from_utf8(&probe.data[..end]).is_ok()
            }
        }
    }

    fn index(
        &self,
        instructions: &[DisassembledInstruction],
        discard_invalid_strings: bool,
        stores: &mut CrossReferenceStores,
    ) {
        for insn in instructions.iter().filter(|i| !i.invalid) {
            let Some(target) = insn.referenced_address else {
                continue;
            };
            match insn.flow {
                FlowKind::Jump => {
                    if self.is_memory_valid(target, false) {
                        stores.insert_jump(target, insn.address, &insn.mnemonic);
                    }
                }
                FlowKind::Call => {
                    if self.is_memory_valid(target, false) {
                        stores.insert_call(target, insn.address);
                    }
                }
                _ => {
                    if self.is_memory_valid(target, discard_invalid_strings) {
                        stores.insert_string(target, insn.address);
                    }
                }
            }
        }
    }

    /// Dissect `regions` in order, returning early if `cancel` trips
    pub fn run(
        &self,
        regions: &[MemoryRegion],
        discard_invalid_strings: bool,
        stores: &mut CrossReferenceStores,
        cancel: &CancellationToken,
        observer: &mut dyn DissectionObserver,
    ) -> DissectionOutcome {
        let chunk_size = self.options.chunk_size.max(1);
        let region_count = regions.len() as u32;

        for (region_index, region) in regions.iter().enumerate() {
            log::info!(
                "Dissecting region {} of {}: {} {}",
                region_index + 1,
                region_count,
                region.range_label(),
                region.backing_path
            );
            let mut start = region.start;

            while start < region.end {
                if cancel.is_cancelled() {
                    log::info!("Dissection canceled at {:#x}", start);
                    return DissectionOutcome::Canceled;
                }

                let remaining = region.end - start;
                let length = remaining.min(chunk_size as u64) as usize;
                let read = self.memory.read(start, length);
                if read.data.is_empty() {
                    log::warn!("Region {} unreadable at {:#x}, skipping", region.range_label(), start);
                    break;
                }
                // A fault part-way through ends the region
                let final_chunk = length as u64 == remaining || !read.is_complete();

                let mut instructions = self.engine.disassemble(&read.data, start).unwrap_or_else(|e| {
                    log::warn!("Decode failure at {:#x}: {}", start, e);
                    Vec::new()
                });

                let next_start = if final_chunk {
                    region.end
                } else {
                    // Always index at least one instruction so the scan advances
                    let keep = instructions
                        .len()
                        .saturating_sub(self.options.boundary_discard)
                        .max(1);
                    let anchor = instructions
                        .get(keep)
                        .map(|insn| insn.address)
                        .unwrap_or(start + read.data.len() as u64);
                    instructions.truncate(keep);
                    anchor
                };

                self.index(&instructions, discard_invalid_strings, stores);
                let scanned_end = instructions
                    .last()
                    .map(|insn| insn.next_address())
                    .unwrap_or(next_start);
                observer.chunk_indexed(&DissectionProgress {
                    current_region: region.clone(),
                    region_index: region_index as u32,
                    region_count,
                    scanned_range: (start, scanned_end),
                    counts: stores.counts(),
                });

                if final_chunk {
                    break;
                }
                start = next_start;
            }

            observer.region_finished(stores);
        }

        DissectionOutcome::Finished
    }
}
