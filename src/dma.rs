//! DMA engine.
//!
//! Register-triggered generator of Memory Read / Memory Write TLPs between
//! host memory and the internal buffer. Transfers are split into chunks no
//! larger than the negotiated Max Payload Size (writes) or Max Read Request
//! Size (reads); each chunk becomes one request TLP.
//!
//! Reads are tracked per tag: completions may arrive out of order across
//! tags, but beats within a tag arrive in order with `end` on the final
//! beat. Writes are posted. A tick-counted timeout covers outstanding read
//! completions; all failures latch into `DMASTATUS` until the host clears
//! it.

use std::collections::{HashMap, VecDeque};

use crate::atc::Atc;
use crate::buffer::DmaBuffer;
use crate::config::LinkConfig;
use crate::regs::{BsaRegisters, DmaParams, DMA_STATUS_INTERNAL, DMA_STATUS_OK, DMA_STATUS_RANGE};
use crate::tlp::{CompletionBeat, PasidTag, RequestBeat, AT_TRANSLATED, BEAT_BYTES, DW_BYTES};

/// Default read-completion timeout in ticks.
pub const DMA_TIMEOUT_TICKS: u32 = 65_536;

/// Tags at and above this value belong to the ATS engine.
const DMA_TAG_LIMIT: u8 = 0xF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaState {
    Idle,
    Setup,
    IssueRead,
    WaitCpl,
    IssueWrite,
    Complete,
}

#[derive(Debug, Clone, Copy)]
struct PendingRead {
    buf_off: u32,
    bytes_left: u32,
}

#[derive(Debug)]
pub struct DmaEngine {
    state: DmaState,
    params: Option<DmaParams>,

    cur_addr: u64,
    cur_offset: u32,
    remaining: u32,

    // Per-chunk state.
    chunk_bytes: u32,
    chunk_dwords: u32,
    chunk_addr: u64,
    beat: u32,
    beats_per_tlp: u32,

    next_tag: u8,
    pending: HashMap<u8, PendingRead>,
    wait_ticks: u32,
    timeout_ticks: u32,

    // Chunk limits latched from the collaborator at trigger time.
    mps: u32,
    mrrs: u32,

    result: u8,
    source: VecDeque<RequestBeat>,
}

impl Default for DmaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaEngine {
    pub fn new() -> Self {
        Self {
            state: DmaState::Idle,
            params: None,
            cur_addr: 0,
            cur_offset: 0,
            remaining: 0,
            chunk_bytes: 0,
            chunk_dwords: 0,
            chunk_addr: 0,
            beat: 0,
            beats_per_tlp: 0,
            next_tag: 0,
            pending: HashMap::new(),
            wait_ticks: 0,
            timeout_ticks: DMA_TIMEOUT_TICKS,
            mps: 0,
            mrrs: 0,
            result: DMA_STATUS_OK,
            source: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        let timeout = self.timeout_ticks;
        *self = Self::new();
        self.timeout_ticks = timeout;
    }

    pub fn set_timeout_ticks(&mut self, ticks: u32) {
        self.timeout_ticks = ticks.max(1);
    }

    pub fn busy(&self) -> bool {
        self.state != DmaState::Idle
    }

    /// True while a transfer with `use_atc` is in progress (the invalidation
    /// handler consults this before clearing the ATC).
    pub fn use_atc_active(&self) -> bool {
        self.busy() && self.params.map(|p| p.use_atc).unwrap_or(false)
    }

    /// True while the engine is inside a multi-beat TLP (between `first` and
    /// `last`). The invalidation handler only clears the ATC at TLP
    /// boundaries.
    pub fn mid_tlp(&self) -> bool {
        self.state == DmaState::IssueWrite && self.beat > 0
    }

    /// Outbound request stream, drained by the master arbiter.
    pub fn source_mut(&mut self) -> &mut VecDeque<RequestBeat> {
        &mut self.source
    }

    /// Coarse state discriminant for the top-level quiescence check.
    pub(crate) fn phase(&self) -> u8 {
        self.state as u8
    }

    pub(crate) fn source_len(&self) -> usize {
        self.source.len()
    }

    pub(crate) fn timeout_ticks(&self) -> u32 {
        self.timeout_ticks
    }

    pub fn tick(
        &mut self,
        regs: &mut BsaRegisters,
        buffer: &mut DmaBuffer,
        atc: &Atc,
        cfg: &LinkConfig,
    ) {
        if self.state != DmaState::Idle && regs.take_dma_trigger() {
            tracing::debug!("dma trigger while busy dropped");
        }
        match self.state {
            DmaState::Idle => {
                if regs.take_dma_trigger() {
                    self.accept_trigger(regs, buffer, cfg);
                }
            }
            DmaState::Setup => self.setup_chunk(atc),
            DmaState::IssueRead => self.issue_read(),
            DmaState::WaitCpl => {
                self.wait_ticks += 1;
                if self.pending.is_empty() {
                    self.state = DmaState::Complete;
                } else if self.wait_ticks >= self.timeout_ticks {
                    tracing::debug!(pending = self.pending.len(), "dma read completion timeout");
                    self.fail(DMA_STATUS_INTERNAL);
                }
            }
            DmaState::IssueWrite => self.issue_write_beat(buffer),
            DmaState::Complete => {
                regs.set_dma_status(self.result);
                self.params = None;
                self.pending.clear();
                self.state = DmaState::Idle;
            }
        }
    }

    fn accept_trigger(&mut self, regs: &BsaRegisters, buffer: &DmaBuffer, cfg: &LinkConfig) {
        let p = regs.dma_params(cfg);
        self.mps = cfg.max_payload_size.max(DW_BYTES);
        self.mrrs = cfg.max_request_size.max(DW_BYTES);
        self.result = DMA_STATUS_OK;
        self.params = Some(p);
        self.pending.clear();
        self.wait_ticks = 0;
        self.next_tag = 0;

        if p.len == 0 {
            self.state = DmaState::Complete;
            return;
        }
        let in_bounds = p
            .offset
            .checked_add(p.len)
            .map(|end| end <= buffer.size())
            .unwrap_or(false);
        if !in_bounds || p.bus_addr % u64::from(DW_BYTES) != 0 || p.len % DW_BYTES != 0 {
            self.result = DMA_STATUS_RANGE;
            self.state = DmaState::Complete;
            return;
        }
        if p.use_atc && p.addr_type == AT_TRANSLATED {
            // ATC-translated addresses must not be re-marked as translated.
            self.result = DMA_STATUS_INTERNAL;
            self.state = DmaState::Complete;
            return;
        }

        self.cur_addr = p.bus_addr;
        self.cur_offset = p.offset;
        self.remaining = p.len;
        self.state = DmaState::Setup;
    }

    fn setup_chunk(&mut self, atc: &Atc) {
        let Some(p) = self.params else {
            self.fail(DMA_STATUS_INTERNAL);
            return;
        };
        let limit = if p.direction { self.mps } else { self.mrrs };
        self.chunk_bytes = self.remaining.min(limit);
        self.chunk_dwords = self.chunk_bytes / DW_BYTES;
        self.beat = 0;
        self.beats_per_tlp = self.chunk_dwords.div_ceil(2);
        self.chunk_addr = self.effective_addr(&p, atc);
        self.state = if p.direction {
            DmaState::IssueWrite
        } else {
            DmaState::IssueRead
        };
    }

    fn effective_addr(&self, p: &DmaParams, atc: &Atc) -> u64 {
        if p.use_atc {
            if let Some(hit) = atc.lookup(self.cur_addr, p.pasid_en, p.pasid_val) {
                return hit.output_addr;
            }
        }
        self.cur_addr
    }

    fn pasid_tag(p: &DmaParams) -> PasidTag {
        PasidTag {
            en: p.pasid_en,
            val: p.pasid_val,
            privileged: p.privileged,
            execute: p.instruction,
        }
    }

    fn issue_read(&mut self) {
        let Some(p) = self.params else {
            self.fail(DMA_STATUS_INTERNAL);
            return;
        };
        let tag = self.next_tag;
        self.next_tag = (self.next_tag + 1) % DMA_TAG_LIMIT;
        self.source.push_back(RequestBeat {
            first: true,
            last: true,
            we: false,
            adr: self.chunk_addr,
            len: RequestBeat::encode_len(self.chunk_dwords),
            tag,
            req_id: p.req_id,
            first_be: 0xF,
            last_be: if self.chunk_dwords == 1 { 0 } else { 0xF },
            dat: 0,
            be: 0,
            bar_hit: 0,
            attr: p.no_snoop as u8,
            at: p.addr_type,
            pasid: Self::pasid_tag(&p),
        });
        self.pending.insert(
            tag,
            PendingRead {
                buf_off: self.cur_offset,
                bytes_left: self.chunk_bytes,
            },
        );
        self.advance_chunk();
        self.wait_ticks = 0;
        self.state = if self.remaining > 0 {
            DmaState::Setup
        } else {
            DmaState::WaitCpl
        };
    }

    fn issue_write_beat(&mut self, buffer: &mut DmaBuffer) {
        let Some(p) = self.params else {
            self.fail(DMA_STATUS_INTERNAL);
            return;
        };
        let beat_off = self.cur_offset + self.beat * BEAT_BYTES;
        let bytes = (self.chunk_bytes - self.beat * BEAT_BYTES).min(BEAT_BYTES);
        let dat = match buffer.a_read(beat_off, bytes) {
            Ok(dat) => dat,
            Err(err) => {
                tracing::debug!(%err, "dma buffer read failed");
                self.fail(DMA_STATUS_INTERNAL);
                return;
            }
        };
        let last = self.beat + 1 == self.beats_per_tlp;
        self.source.push_back(RequestBeat {
            first: self.beat == 0,
            last,
            we: true,
            adr: self.chunk_addr,
            len: RequestBeat::encode_len(self.chunk_dwords),
            tag: 0,
            req_id: p.req_id,
            first_be: 0xF,
            last_be: if self.chunk_dwords == 1 { 0 } else { 0xF },
            dat,
            be: if bytes == BEAT_BYTES { 0xFF } else { 0x0F },
            bar_hit: 0,
            attr: p.no_snoop as u8,
            at: p.addr_type,
            pasid: Self::pasid_tag(&p),
        });
        self.beat += 1;
        if last {
            self.advance_chunk();
            self.state = if self.remaining > 0 {
                DmaState::Setup
            } else {
                DmaState::Complete
            };
        }
    }

    fn advance_chunk(&mut self) {
        self.cur_addr += u64::from(self.chunk_bytes);
        self.cur_offset += self.chunk_bytes;
        self.remaining -= self.chunk_bytes;
    }

    fn fail(&mut self, status: u8) {
        self.result = status;
        self.pending.clear();
        self.state = DmaState::Complete;
    }

    /// Feed one read-completion beat from the link.
    ///
    /// Beats for tags the engine is not waiting on (stale completions after a
    /// timeout, or arbitrary link noise) are dropped.
    pub fn push_completion(&mut self, cpl: CompletionBeat, buffer: &mut DmaBuffer) {
        let reading = matches!(
            self.state,
            DmaState::Setup | DmaState::IssueRead | DmaState::WaitCpl
        );
        if !reading || !self.pending.contains_key(&cpl.tag) {
            tracing::trace!(tag = cpl.tag, "dropping stale dma completion beat");
            return;
        }
        if cpl.err {
            self.fail(DMA_STATUS_INTERNAL);
            return;
        }
        self.wait_ticks = 0;
        let entry = match self.pending.get_mut(&cpl.tag) {
            Some(entry) => entry,
            None => return,
        };
        let bytes = cpl.be.count_ones().min(entry.bytes_left);
        if bytes > 0 {
            if buffer.a_write(entry.buf_off, cpl.dat, bytes).is_err() {
                self.fail(DMA_STATUS_INTERNAL);
                return;
            }
            entry.buf_off += bytes;
            entry.bytes_left -= bytes;
        }
        if cpl.last && cpl.end {
            self.pending.remove(&cpl.tag);
        }
    }
}
