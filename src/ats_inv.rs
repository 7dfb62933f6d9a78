//! ATS invalidation handler.
//!
//! Processes inbound ATS Invalidate Request messages from the host IOMMU and
//! answers each with an Invalidate Completion message. Before clearing the
//! ATC it coordinates with the other engines:
//!
//! - an in-flight ATS translation over the invalidated range is asked to
//!   retry (its completion is discarded);
//! - a DMA transfer using the ATC is allowed to finish its current TLP.
//!
//! The completion is a Message TLP (routed by ID), which the standard
//! packetizer does not produce, so the handler owns a raw TX source drained
//! directly by the TX arbiter.

use std::collections::VecDeque;

use crate::atc::Atc;
use crate::ats::AtsEngine;
use crate::config::LinkConfig;
use crate::dma::DmaEngine;
use crate::regs::BsaRegisters;
use crate::tlp::{AtsInvRequest, PasidTag, PhyBeat};

/// Message code of the Invalidate Completion message.
pub const MSG_CODE_INV_COMPLETE: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvState {
    Idle,
    Check,
    WaitAts,
    WaitDma,
    Invalidate,
    /// Emitting the 4DW completion header, one 64-bit beat per step.
    SendCpl { beat: u8 },
}

#[derive(Debug)]
pub struct AtsInvHandler {
    state: InvState,
    inbox: VecDeque<AtsInvRequest>,
    current: Option<AtsInvRequest>,
    msg_source: VecDeque<PhyBeat>,
}

impl Default for AtsInvHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl AtsInvHandler {
    pub fn new() -> Self {
        Self {
            state: InvState::Idle,
            inbox: VecDeque::new(),
            current: None,
            msg_source: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Queue an inbound Invalidate Request parsed by the depacketizer.
    pub fn push_request(&mut self, req: AtsInvRequest) {
        self.inbox.push_back(req);
    }

    /// Raw TX source of completion messages, drained by the TX arbiter.
    pub fn msg_source_mut(&mut self) -> &mut VecDeque<PhyBeat> {
        &mut self.msg_source
    }

    /// Coarse state discriminant for the top-level quiescence check.
    pub(crate) fn phase(&self) -> u8 {
        match self.state {
            InvState::Idle => 0,
            InvState::Check => 1,
            InvState::WaitAts => 2,
            InvState::WaitDma => 3,
            InvState::Invalidate => 4,
            InvState::SendCpl { beat } => 5 + beat,
        }
    }

    /// Requests queued but not yet latched.
    pub(crate) fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    pub(crate) fn msg_len(&self) -> usize {
        self.msg_source.len()
    }

    pub fn tick(
        &mut self,
        regs: &mut BsaRegisters,
        atc: &mut Atc,
        ats: &mut AtsEngine,
        dma: &DmaEngine,
        cfg: &LinkConfig,
    ) {
        match self.state {
            InvState::Idle => {
                if let Some(req) = self.inbox.pop_front() {
                    self.current = Some(req);
                    self.state = InvState::Check;
                }
            }
            InvState::Check => {
                let Some(req) = self.current else {
                    self.state = InvState::Idle;
                    return;
                };
                let hits = atc.overlaps(
                    req.addr,
                    req.size,
                    req.global,
                    req.pasid_valid,
                    req.pasid_val,
                );
                if !hits {
                    // Nothing cached for the range: acknowledge immediately.
                    self.state = InvState::SendCpl { beat: 0 };
                } else if ats.in_flight() && self.ats_overlaps(ats, &req) {
                    ats.request_retry();
                    self.state = InvState::WaitAts;
                } else if dma.use_atc_active() {
                    self.state = InvState::WaitDma;
                } else {
                    self.state = InvState::Invalidate;
                }
            }
            InvState::WaitAts => {
                if !ats.in_flight() {
                    // Re-check: the discarded translation may have changed
                    // what is cached.
                    self.state = InvState::Check;
                }
            }
            InvState::WaitDma => {
                // Resume at a TLP boundary; the transfer itself may still be
                // in progress, but its next chunk will re-run the lookup.
                if !dma.busy() || !dma.mid_tlp() {
                    self.state = InvState::Invalidate;
                }
            }
            InvState::Invalidate => {
                atc.invalidate();
                regs.set_ats_invalidated();
                self.state = InvState::SendCpl { beat: 0 };
            }
            InvState::SendCpl { beat } => {
                let Some(req) = self.current else {
                    self.state = InvState::Idle;
                    return;
                };
                let (dw0, dw1, dw2, dw3) = Self::completion_dwords(&req, regs.requester_id(cfg));
                match beat {
                    0 => {
                        self.msg_source.push_back(PhyBeat {
                            first: true,
                            last: false,
                            dat: u64::from(dw0) | (u64::from(dw1) << 32),
                            be: 0xFF,
                            bar_hit: 0,
                            pasid: PasidTag::default(),
                        });
                        self.state = InvState::SendCpl { beat: 1 };
                    }
                    _ => {
                        self.msg_source.push_back(PhyBeat {
                            first: false,
                            last: true,
                            dat: u64::from(dw2) | (u64::from(dw3) << 32),
                            be: 0xFF,
                            bar_hit: 0,
                            pasid: PasidTag::default(),
                        });
                        self.current = None;
                        self.state = InvState::Idle;
                    }
                }
            }
        }
    }

    fn ats_overlaps(&self, ats: &AtsEngine, req: &AtsInvRequest) -> bool {
        match ats.pending_addr() {
            Some(addr) => req.size > 0 && addr >= req.addr && addr < req.addr + req.size,
            None => false,
        }
    }

    /// Invalidate Completion message header (4DW, no data, routed by ID):
    ///   DW0: fmt=001, type=10010
    ///   DW1: [31:16] our requester id, [15:8] tag, [7:0] message code 0x02
    ///   DW2: [31:16] target (the invalidation requester), [7:3] ITag, CC=0
    ///   DW3: reserved
    fn completion_dwords(req: &AtsInvRequest, our_id: u16) -> (u32, u32, u32, u32) {
        let dw0 = (0b001 << 29) | (0b1_0010 << 24);
        let dw1 = (u32::from(our_id) << 16) | u32::from(MSG_CODE_INV_COMPLETE);
        let dw2 = (u32::from(req.req_id) << 16) | (u32::from(req.itag & 0x1F) << 3);
        (dw0, dw1, dw2, 0)
    }
}
