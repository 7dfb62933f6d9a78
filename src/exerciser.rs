//! Top-level wiring of the exerciser core.
//!
//! [`Exerciser`] owns every component and advances them with a deterministic
//! single-threaded [`Exerciser::tick`]. The step order is fixed:
//!
//! 1. depacketize one RX beat and dispatch completed TLPs (monitor tap here)
//! 2. completion arbiter moves one beat toward the packetizer
//! 3. MSI-X controller, DMA engine, ATS engine, invalidation handler
//! 4. master arbiter moves one beat toward the packetizer
//! 5. packetized TLPs run through the PASID injector onto the main TX path
//! 6. TX arbiter moves one beat to the outbound stream
//!
//! A test bench feeds raw beats with [`Exerciser::rx_push`] and drains
//! [`Exerciser::tx_pop`]; [`Exerciser::run_until_idle`] ticks until no
//! component changes state, which is the point to inject the next external
//! stimulus (or keep ticking to model time for the DMA timeout).

use std::collections::VecDeque;

use crate::atc::Atc;
use crate::ats::{AtsEngine, ATS_TAG_BASE};
use crate::ats_inv::AtsInvHandler;
use crate::buffer::{DmaBuffer, DMA_BUFFER_SIZE};
use crate::codec::{packetize_completion, packetize_request, Depacketizer, Tlp};
use crate::config::LinkConfig;
use crate::dma::DmaEngine;
use crate::monitor::TxnMonitor;
use crate::msix::{MsixController, MsixPba, MsixTable};
use crate::pasid::PasidInjector;
use crate::regs::BsaRegisters;
use crate::routing::{BarDispatcher, BarTarget, CompletionArbiter, MasterArbiter, StubHandler, TxArbiter};
use crate::tlp::{CompletionBeat, PhyBeat, RequestBeat, BEAT_BYTES, DW_BYTES};

/// Number of handler completion queues, in arbiter priority order.
const CPL_QUEUES: usize = 5;
const CPLQ_REGS: usize = 0;
const CPLQ_BUFFER: usize = 1;
const CPLQ_TABLE: usize = 2;
const CPLQ_PBA: usize = 3;
const CPLQ_STUB: usize = 4;

#[derive(Debug)]
pub struct Exerciser {
    cfg: LinkConfig,
    regs: BsaRegisters,
    buffer: DmaBuffer,
    msix_table: MsixTable,
    msix_pba: MsixPba,
    msix: MsixController,
    dma: DmaEngine,
    atc: Atc,
    ats: AtsEngine,
    ats_inv: AtsInvHandler,
    injector: PasidInjector,
    monitor: TxnMonitor,
    dispatcher: BarDispatcher,
    stub: StubHandler,
    cpl_arb: CompletionArbiter,
    master_arb: MasterArbiter,
    tx_arb: TxArbiter,
    depack: Depacketizer,

    rx_in: VecDeque<PhyBeat>,
    cpl_q: [VecDeque<CompletionBeat>; CPL_QUEUES],
    cpl_acc: Vec<CompletionBeat>,
    req_acc: Vec<RequestBeat>,
    tx_main: VecDeque<PhyBeat>,
    tx_out: VecDeque<PhyBeat>,

    rx_errors: u64,
}

/// Observable-state fingerprint used to detect quiescence.
#[derive(Debug, PartialEq, Eq)]
struct Signature {
    rx_in: usize,
    cpl_q: [usize; CPL_QUEUES],
    accs: (usize, usize),
    tx: (usize, usize),
    sources: (usize, usize, usize, usize, usize),
    phases: (u8, u8, u8, u8),
    pending: bool,
}

impl Default for Exerciser {
    fn default() -> Self {
        Self::new(LinkConfig::default())
    }
}

impl Exerciser {
    pub fn new(cfg: LinkConfig) -> Self {
        Self {
            cfg,
            regs: BsaRegisters::new(),
            buffer: DmaBuffer::new(),
            msix_table: MsixTable::new(),
            msix_pba: MsixPba::new(),
            msix: MsixController::new(),
            dma: DmaEngine::new(),
            atc: Atc::new(),
            ats: AtsEngine::new(),
            ats_inv: AtsInvHandler::new(),
            injector: PasidInjector::new(),
            monitor: TxnMonitor::new(),
            dispatcher: BarDispatcher::new(),
            stub: StubHandler,
            cpl_arb: CompletionArbiter::new(),
            master_arb: MasterArbiter::new(),
            tx_arb: TxArbiter::new(),
            depack: Depacketizer::new(),
            rx_in: VecDeque::new(),
            cpl_q: Default::default(),
            cpl_acc: Vec::new(),
            req_acc: Vec::new(),
            tx_main: VecDeque::new(),
            tx_out: VecDeque::new(),
            rx_errors: 0,
        }
    }

    /// Host reset: clears every component back to its power-on state. The
    /// link configuration and DMA timeout setting are preserved.
    pub fn reset(&mut self) {
        let cfg = self.cfg;
        let timeout = self.dma.timeout_ticks();
        *self = Self::new(cfg);
        self.dma.set_timeout_ticks(timeout);
    }

    // -------------------------------------------------------------------
    // External surface
    // -------------------------------------------------------------------

    pub fn config(&self) -> &LinkConfig {
        &self.cfg
    }

    pub fn config_mut(&mut self) -> &mut LinkConfig {
        &mut self.cfg
    }

    pub fn set_dma_timeout(&mut self, ticks: u32) {
        self.dma.set_timeout_ticks(ticks);
    }

    /// Feed one inbound beat from the link.
    pub fn rx_push(&mut self, beat: PhyBeat) {
        self.rx_in.push_back(beat);
    }

    /// Feed a whole inbound TLP.
    pub fn rx_push_tlp(&mut self, beats: impl IntoIterator<Item = PhyBeat>) {
        self.rx_in.extend(beats);
    }

    /// Drain one outbound beat.
    pub fn tx_pop(&mut self) -> Option<PhyBeat> {
        self.tx_out.pop_front()
    }

    /// Legacy INTx level, driven by `INTXCTL.assert`.
    pub fn intx_level(&self) -> bool {
        self.regs.intx_assert()
    }

    /// Malformed or unsupported RX TLPs dropped so far.
    pub fn rx_error_count(&self) -> u64 {
        self.rx_errors
    }

    /// Direct view of the register file (test benches normally go through
    /// BAR0 TLPs instead).
    pub fn regs(&self) -> &BsaRegisters {
        &self.regs
    }

    pub fn atc(&self) -> &Atc {
        &self.atc
    }

    pub fn dma_buffer(&self) -> &DmaBuffer {
        &self.buffer
    }

    pub fn msix_pba(&self) -> &MsixPba {
        &self.msix_pba
    }

    // -------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------

    /// Advance every component one step. Returns whether any observable
    /// state changed (used by [`Exerciser::run_until_idle`]).
    pub fn tick(&mut self) -> bool {
        let before = self.signature();

        self.step_rx();
        self.step_completion_path();
        self.msix
            .tick(&mut self.regs, &self.msix_table, &mut self.msix_pba, &self.cfg);
        self.dma
            .tick(&mut self.regs, &mut self.buffer, &self.atc, &self.cfg);
        self.ats.tick(&mut self.regs, &mut self.atc, &self.cfg);
        self.ats_inv.tick(
            &mut self.regs,
            &mut self.atc,
            &mut self.ats,
            &self.dma,
            &self.cfg,
        );
        self.step_master_path();
        self.step_tx();

        before != self.signature()
    }

    /// Tick until the core is quiescent: no beats in flight and every FSM
    /// parked in a wait state. DMA/ATS completion timeouts do not advance
    /// here; model time by calling [`Exerciser::tick`] directly.
    pub fn run_until_idle(&mut self) {
        while self.tick() {}
    }

    fn signature(&self) -> Signature {
        Signature {
            rx_in: self.rx_in.len(),
            cpl_q: [
                self.cpl_q[0].len(),
                self.cpl_q[1].len(),
                self.cpl_q[2].len(),
                self.cpl_q[3].len(),
                self.cpl_q[4].len(),
            ],
            accs: (self.cpl_acc.len(), self.req_acc.len()),
            tx: (self.tx_main.len(), self.tx_out.len()),
            sources: (
                self.dma.source_len(),
                self.msix.source_len(),
                self.ats.source_len(),
                self.ats_inv.msg_len(),
                self.ats_inv.inbox_len(),
            ),
            phases: (
                self.dma.phase(),
                self.msix.phase(),
                self.ats.phase(),
                self.ats_inv.phase(),
            ),
            pending: self.regs.has_pending_events(),
        }
    }

    // -------------------------------------------------------------------
    // RX path
    // -------------------------------------------------------------------

    fn step_rx(&mut self) {
        let Some(beat) = self.rx_in.pop_front() else {
            return;
        };
        let Some(result) = self.depack.push(beat) else {
            return;
        };
        match result {
            Ok(Tlp::Request(tlp)) => self.dispatch_request(&tlp),
            Ok(Tlp::Completion(tlp)) => self.dispatch_completion(&tlp),
            Ok(Tlp::AtsInvalidation(req)) => self.ats_inv.push_request(req),
            Err(err) => {
                tracing::debug!(%err, "malformed rx TLP dropped");
                self.rx_errors += 1;
            }
        }
    }

    fn dispatch_request(&mut self, tlp: &[RequestBeat]) {
        let Some(head) = tlp.first() else {
            return;
        };
        let target = self.dispatcher.route(head);
        for beat in &tlp[1..] {
            // Route consumption keeps the dispatcher's packet latch honest.
            let cont = self.dispatcher.route(beat);
            debug_assert_eq!(cont, target);
        }
        self.monitor.capture(head);

        match target {
            BarTarget::Registers => self.handle_bar0(tlp),
            BarTarget::DmaBuffer => self.handle_bar1(tlp),
            BarTarget::MsixTable => self.handle_bar2(tlp),
            BarTarget::MsixPba => self.handle_bar5(tlp),
            BarTarget::Stub => {
                if let Some(cpl) = self.stub.handle(tlp, self.cfg.endpoint_id) {
                    self.cpl_q[CPLQ_STUB].push_back(cpl);
                }
            }
        }
    }

    fn dispatch_completion(&mut self, tlp: &[CompletionBeat]) {
        for beat in tlp {
            if beat.tag >= ATS_TAG_BASE {
                self.ats
                    .push_completion(*beat, &mut self.regs, &mut self.atc);
            } else {
                self.dma.push_completion(*beat, &mut self.buffer);
            }
        }
    }

    // -------------------------------------------------------------------
    // Per-BAR handlers
    // -------------------------------------------------------------------

    fn handle_bar0(&mut self, tlp: &[RequestBeat]) {
        let head = tlp[0];
        let offset = (head.adr & 0xFFF) as u32;
        if head.we {
            self.apply_dword_writes(tlp, |ex, dw_index, value, be| {
                ex.regs
                    .bar_write(offset + dw_index * DW_BYTES, value, be, &mut ex.monitor);
            });
        } else {
            let len = head.len_dwords();
            let payload: Vec<u32> = (0..len)
                .map(|i| self.regs.bar_read(offset + i * DW_BYTES, &mut self.monitor))
                .collect();
            let cpl = self.build_read_completion(&head, &payload, head.adr);
            self.cpl_q[CPLQ_REGS].extend(cpl);
        }
    }

    fn handle_bar1(&mut self, tlp: &[RequestBeat]) {
        let head = tlp[0];
        let offset = (head.adr & u64::from(DMA_BUFFER_SIZE - 1)) as u32;
        if head.we {
            for (i, beat) in tlp.iter().enumerate() {
                self.buffer
                    .b_write(offset + (i as u32) * BEAT_BYTES, beat.dat, beat.be);
            }
        } else {
            // Split the read into completions no larger than the negotiated
            // Max Payload Size.
            let total_bytes = head.len_dwords() * DW_BYTES;
            let mps = self.cfg.max_payload_size.max(DW_BYTES);
            let mut consumed = 0u32;
            while consumed < total_bytes {
                let chunk = (total_bytes - consumed).min(mps);
                let base = offset + consumed;
                let payload: Vec<u32> = (0..chunk / DW_BYTES)
                    .map(|i| {
                        let qword = self.buffer.b_read_u64(base + i * DW_BYTES);
                        qword as u32
                    })
                    .collect();
                let mut chunk_head = head;
                chunk_head.len = RequestBeat::encode_len(chunk / DW_BYTES);
                let remaining = total_bytes - consumed;
                let beats = self.build_chunk_completion(
                    &chunk_head,
                    &payload,
                    head.adr + u64::from(consumed),
                    remaining as u16,
                );
                self.cpl_q[CPLQ_BUFFER].extend(beats);
                consumed += chunk;
            }
        }
    }

    fn handle_bar2(&mut self, tlp: &[RequestBeat]) {
        let head = tlp[0];
        let offset = head.adr & 0xFFF;
        if head.we {
            for (i, beat) in tlp.iter().enumerate() {
                self.msix_table.write(
                    offset + (i as u64) * u64::from(BEAT_BYTES),
                    &beat.dat.to_le_bytes(),
                    beat.be,
                );
            }
        } else {
            let len = head.len_dwords();
            let payload: Vec<u32> = (0..len)
                .map(|i| {
                    let mut dw = [0u8; 4];
                    self.msix_table
                        .read(offset + u64::from(i) * u64::from(DW_BYTES), &mut dw);
                    u32::from_le_bytes(dw)
                })
                .collect();
            let cpl = self.build_read_completion(&head, &payload, head.adr);
            self.cpl_q[CPLQ_TABLE].extend(cpl);
        }
    }

    fn handle_bar5(&mut self, tlp: &[RequestBeat]) {
        let head = tlp[0];
        let offset = head.adr & 0xFFF;
        if head.we {
            // The PBA is read-only from the host side.
            tracing::debug!(adr = head.adr, "pba write ignored");
            return;
        }
        let len = head.len_dwords();
        let payload: Vec<u32> = (0..len)
            .map(|i| {
                let mut dw = [0u8; 4];
                self.msix_pba
                    .read(offset + u64::from(i) * u64::from(DW_BYTES), &mut dw);
                u32::from_le_bytes(dw)
            })
            .collect();
        let cpl = self.build_read_completion(&head, &payload, head.adr);
        self.cpl_q[CPLQ_PBA].extend(cpl);
    }

    fn apply_dword_writes(
        &mut self,
        tlp: &[RequestBeat],
        mut commit: impl FnMut(&mut Self, u32, u32, u8),
    ) {
        for (i, beat) in tlp.iter().enumerate() {
            // Beat i carries the DWORDs at indices 2i and 2i+1.
            let base = (i as u32) * 2;
            if beat.be & 0x0F != 0 {
                commit(self, base, beat.dat as u32, beat.be & 0xF);
            }
            if beat.be & 0xF0 != 0 {
                commit(self, base + 1, (beat.dat >> 32) as u32, beat.be >> 4);
            }
        }
    }

    /// Single-completion read response (BAR0/BAR2/BAR5).
    fn build_read_completion(
        &self,
        head: &RequestBeat,
        payload: &[u32],
        lower_addr: u64,
    ) -> Vec<CompletionBeat> {
        self.build_chunk_completion(head, payload, lower_addr, (payload.len() * 4) as u16)
    }

    fn build_chunk_completion(
        &self,
        head: &RequestBeat,
        payload: &[u32],
        lower_addr: u64,
        byte_count: u16,
    ) -> Vec<CompletionBeat> {
        let template = CompletionBeat {
            adr: lower_addr & 0x7F,
            len: RequestBeat::encode_len(payload.len().max(1) as u32),
            tag: head.tag,
            req_id: head.req_id,
            cmp_id: self.cfg.endpoint_id,
            end: usize::from(byte_count) <= payload.len() * 4,
            err: false,
            byte_count,
            ..Default::default()
        };
        let n_beats = payload.len().div_ceil(2);
        (0..n_beats)
            .map(|i| {
                let low = payload[i * 2];
                let high = payload.get(i * 2 + 1).copied();
                CompletionBeat {
                    first: i == 0,
                    last: i == n_beats - 1,
                    dat: u64::from(low) | (u64::from(high.unwrap_or(0)) << 32),
                    be: if high.is_some() { 0xFF } else { 0x0F },
                    ..template
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------
    // TX paths
    // -------------------------------------------------------------------

    fn step_completion_path(&mut self) {
        let [q0, q1, q2, q3, q4] = &mut self.cpl_q;
        let Some(beat) = self
            .cpl_arb
            .tick(&mut [q0, q1, q2, q3, q4])
        else {
            return;
        };
        let done = beat.last;
        self.cpl_acc.push(beat);
        if done {
            let beats = packetize_completion(&self.cpl_acc);
            self.cpl_acc.clear();
            for beat in beats {
                self.injector.push(beat, &mut self.tx_main);
            }
        }
    }

    fn step_master_path(&mut self) {
        let Some(beat) = self.master_arb.tick(&mut [
            self.dma.source_mut(),
            self.msix.source_mut(),
            self.ats.source_mut(),
        ]) else {
            return;
        };
        let done = beat.last;
        self.req_acc.push(beat);
        if done {
            let beats = packetize_request(&self.req_acc);
            self.req_acc.clear();
            for beat in beats {
                self.injector.push(beat, &mut self.tx_main);
            }
        }
    }

    fn step_tx(&mut self) {
        if let Some(beat) = self
            .tx_arb
            .tick(&mut self.tx_main, self.ats_inv.msg_source_mut())
        {
            self.tx_out.push_back(beat);
        }
    }
}
