//! ATS (Address Translation Services) engine.
//!
//! Issues Translation Request TLPs (Memory Read with AT=01) for the address
//! in `DMA_BUS_ADDR`, parses the Translation Completion, publishes the
//! result registers, and stores successful translations in the ATC.
//!
//! ATS is gated by the `ats_enabled` capability flag from the configuration
//! collaborator: while disabled the engine refuses triggers and drops any
//! cached translation. The invalidation handler can ask an in-flight
//! translation to be discarded via [`AtsEngine::request_retry`].

use std::collections::VecDeque;

use crate::atc::{Atc, AtcEntry, AtsPermissions};
use crate::config::LinkConfig;
use crate::regs::{AtsParams, BsaRegisters};
use crate::tlp::{CompletionBeat, PasidTag, RequestBeat, AT_TRANSLATION_REQUEST};

/// Tag range reserved for ATS translation requests.
pub const ATS_TAG_BASE: u8 = 0xF0;

/// Translation-completion timeout in ticks.
pub const ATS_TIMEOUT_TICKS: u32 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AtsState {
    Idle,
    IssueReq,
    WaitCpl,
}

#[derive(Debug)]
pub struct AtsEngine {
    state: AtsState,
    params: Option<AtsParams>,
    tag: u8,
    must_retry: bool,
    wait_ticks: u32,
    success: bool,
    cacheable: bool,
    source: VecDeque<RequestBeat>,
}

impl Default for AtsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AtsEngine {
    pub fn new() -> Self {
        Self {
            state: AtsState::Idle,
            params: None,
            tag: ATS_TAG_BASE,
            must_retry: false,
            wait_ticks: 0,
            success: false,
            cacheable: false,
            source: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn in_flight(&self) -> bool {
        self.state != AtsState::Idle
    }

    /// Asserted by the invalidation handler when an invalidation overlaps the
    /// pending translation: the completion, once it arrives, is discarded.
    pub fn request_retry(&mut self) {
        if self.in_flight() {
            self.must_retry = true;
        }
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

    pub fn tick(&mut self, regs: &mut BsaRegisters, atc: &mut Atc, cfg: &LinkConfig) {
        if !cfg.ats_enabled {
            // Capability disabled: refuse triggers and drop cached state.
            if regs.take_ats_trigger() {
                tracing::debug!("ats trigger refused: capability disabled");
            }
            if atc.valid() {
                atc.invalidate();
            }
            self.success = false;
            self.cacheable = false;
            self.params = None;
            self.state = AtsState::Idle;
            regs.clear_ats_result();
            self.publish_flags(regs);
            return;
        }

        if self.state != AtsState::Idle && regs.take_ats_trigger() {
            tracing::debug!("ats trigger while in flight dropped");
        }
        match self.state {
            AtsState::Idle => {
                if regs.take_clear_atc() {
                    atc.invalidate();
                    self.success = false;
                    self.cacheable = false;
                    regs.clear_ats_result();
                }
                if regs.take_ats_trigger() {
                    self.params = Some(regs.ats_params(cfg));
                    self.success = false;
                    self.must_retry = false;
                    self.state = AtsState::IssueReq;
                }
            }
            AtsState::IssueReq => {
                if let Some(p) = self.params {
                    self.issue_request(&p);
                }
            }
            AtsState::WaitCpl => {
                self.wait_ticks += 1;
                if self.wait_ticks >= ATS_TIMEOUT_TICKS {
                    tracing::debug!("ats translation completion timeout");
                    self.success = false;
                    self.state = AtsState::Idle;
                }
            }
        }
        self.publish_flags(regs);
    }

    fn issue_request(&mut self, p: &AtsParams) {
        self.source.push_back(RequestBeat {
            first: true,
            last: true,
            we: false,
            adr: p.addr,
            len: 1,
            tag: self.tag,
            req_id: p.req_id,
            // No-write hint travels in first_be[3].
            first_be: 0x7 | (u8::from(p.no_write) << 3),
            last_be: 0,
            dat: 0,
            be: 0,
            bar_hit: 0,
            attr: 0,
            at: AT_TRANSLATION_REQUEST,
            pasid: PasidTag {
                en: p.pasid_en,
                val: p.pasid_val,
                privileged: p.privileged,
                execute: p.exec_req,
            },
        });
        self.tag = if self.tag == 0xFF {
            ATS_TAG_BASE
        } else {
            self.tag + 1
        };
        self.wait_ticks = 0;
        self.state = AtsState::WaitCpl;
    }

    /// Feed one translation-completion beat from the link.
    pub fn push_completion(&mut self, cpl: CompletionBeat, regs: &mut BsaRegisters, atc: &mut Atc) {
        if self.state != AtsState::WaitCpl {
            tracing::trace!(tag = cpl.tag, "dropping stale ats completion");
            return;
        }
        if !(cpl.last && cpl.end) {
            return;
        }
        if self.must_retry {
            // An overlapping invalidation raced the translation: the result
            // must not be stored.
            self.must_retry = false;
            self.success = false;
            self.state = AtsState::Idle;
            self.publish_flags(regs);
            return;
        }
        if cpl.err {
            self.success = false;
            self.state = AtsState::Idle;
            self.publish_flags(regs);
            return;
        }
        self.parse_completion(cpl.dat, regs, atc);
        self.state = AtsState::Idle;
        self.publish_flags(regs);
    }

    fn parse_completion(&mut self, dat: u64, regs: &mut BsaRegisters, atc: &mut Atc) {
        // Translation completion entry:
        //   [63:12] translated address, [10:6] S (range = 2^(S+12) bytes),
        //   [5] N, [4] U (untranslated: failure), [1] W, [0] R.
        let u_bit = dat & (1 << 4) != 0;
        if u_bit {
            self.success = false;
            self.cacheable = false;
            return;
        }
        let trans_addr = dat & 0xFFFF_FFFF_FFFF_F000;
        let s_field = ((dat >> 6) & 0x1F) as u32;
        let range_size = (1u64 << (s_field + 12).min(31)) as u32;
        let mut perms = AtsPermissions::empty();
        if dat & (1 << 0) != 0 {
            perms |= AtsPermissions::READ;
        }
        if dat & (1 << 1) != 0 {
            perms |= AtsPermissions::WRITE;
        }

        let Some(p) = self.params else {
            return;
        };
        self.success = true;
        self.cacheable = !perms.is_empty();
        regs.set_ats_result(trans_addr, range_size, u32::from(perms.bits()));
        atc.store(AtcEntry {
            input_addr: p.addr & !(u64::from(range_size) - 1),
            output_addr: trans_addr,
            range_size,
            permissions: perms,
            pasid_valid: p.pasid_en,
            pasid_val: p.pasid_val,
        });
    }

    fn publish_flags(&self, regs: &mut BsaRegisters) {
        regs.set_ats_flags(self.in_flight(), self.success, self.cacheable);
    }

    /// Untranslated range of the pending request, for overlap checks while
    /// in flight.
    pub fn pending_addr(&self) -> Option<u64> {
        if self.in_flight() {
            self.params.map(|p| p.addr)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{REG_ATSCTL, REG_ATS_ADDR_LO, REG_ATS_PERM, REG_ATS_RANGE_SIZE, REG_DMA_BUS_ADDR_LO};
    use pretty_assertions::assert_eq;

    struct Bench {
        regs: BsaRegisters,
        atc: Atc,
        cfg: LinkConfig,
        ats: AtsEngine,
    }

    impl Bench {
        fn new() -> Self {
            Self {
                regs: BsaRegisters::new(),
                atc: Atc::new(),
                cfg: LinkConfig::default(),
                ats: AtsEngine::new(),
            }
        }

        fn run(&mut self, ticks: usize) {
            for _ in 0..ticks {
                self.ats.tick(&mut self.regs, &mut self.atc, &self.cfg);
            }
        }

        fn trigger(&mut self, addr: u32, ctl: u32) {
            self.regs.host_write(REG_DMA_BUS_ADDR_LO, addr, 0xF);
            self.regs.host_write(REG_ATSCTL, ctl | 0x1, 0xF);
        }

        fn complete(&mut self, dat: u64) {
            let tag = self.ats.source.back().map(|b| b.tag).unwrap_or(ATS_TAG_BASE);
            self.ats.push_completion(
                CompletionBeat {
                    first: true,
                    last: true,
                    end: true,
                    tag,
                    len: 2,
                    dat,
                    be: 0xFF,
                    ..Default::default()
                },
                &mut self.regs,
                &mut self.atc,
            );
        }
    }

    #[test]
    fn translation_request_uses_at_01_and_reserved_tag() {
        let mut b = Bench::new();
        b.trigger(0x10000, 1 << 2); // no_write
        b.run(4);
        let beat = b.ats.source.pop_front().unwrap();
        assert_eq!(beat.at, AT_TRANSLATION_REQUEST);
        assert_eq!(beat.len, 1);
        assert!(beat.tag >= ATS_TAG_BASE);
        assert_eq!(beat.first_be, 0xF); // 0x7 | no_write << 3
        assert!(b.ats.in_flight());
        assert_eq!(b.regs.host_read(REG_ATSCTL) & (1 << 6), 1 << 6);
    }

    #[test]
    fn successful_translation_fills_registers_and_atc() {
        let mut b = Bench::new();
        b.trigger(0x10000, 0);
        b.run(4);
        // Translated 0x9000_0000, S=0 (4 KiB), R|W.
        b.complete(0x9000_0000 | 0x3);
        b.run(2);
        assert!(!b.ats.in_flight());
        assert_eq!(b.regs.host_read(REG_ATSCTL) & (1 << 7), 1 << 7); // success
        assert_eq!(b.regs.host_read(REG_ATSCTL) & (1 << 8), 1 << 8); // cacheable
        assert_eq!(b.regs.host_read(REG_ATS_ADDR_LO), 0x9000_0000);
        assert_eq!(b.regs.host_read(REG_ATS_RANGE_SIZE), 0x1000);
        assert_eq!(
            b.regs.host_read(REG_ATS_PERM),
            (AtsPermissions::READ | AtsPermissions::WRITE).bits() as u32
        );
        let hit = b.atc.lookup(0x10800, false, 0).unwrap();
        assert_eq!(hit.output_addr, 0x9000_0800);
    }

    #[test]
    fn untranslated_bit_reports_failure() {
        let mut b = Bench::new();
        b.trigger(0x10000, 0);
        b.run(4);
        b.complete(0x9000_0000 | (1 << 4));
        b.run(2);
        assert_eq!(b.regs.host_read(REG_ATSCTL) & (1 << 7), 0);
        assert!(!b.atc.valid());
    }

    #[test]
    fn retry_discards_completion() {
        let mut b = Bench::new();
        b.trigger(0x10000, 0);
        b.run(4);
        b.ats.request_retry();
        b.complete(0x9000_0000 | 0x3);
        b.run(2);
        assert!(!b.ats.in_flight());
        assert_eq!(b.regs.host_read(REG_ATSCTL) & (1 << 7), 0);
        assert!(!b.atc.valid());
    }

    #[test]
    fn clear_atc_drops_entry_and_results() {
        let mut b = Bench::new();
        b.trigger(0x10000, 0);
        b.run(4);
        b.complete(0x9000_0000 | 0x3);
        b.run(2);
        assert!(b.atc.valid());
        b.regs.host_write(REG_ATSCTL, 1 << 5, 0xF);
        b.run(2);
        assert!(!b.atc.valid());
        assert_eq!(b.regs.host_read(REG_ATS_ADDR_LO), 0);
    }

    #[test]
    fn disabled_ats_refuses_trigger_and_flushes_cache() {
        let mut b = Bench::new();
        b.trigger(0x10000, 0);
        b.run(4);
        b.complete(0x9000_0000 | 0x3);
        b.run(2);
        assert!(b.atc.valid());

        b.cfg.ats_enabled = false;
        b.trigger(0x20000, 0);
        b.run(4);
        // Only the first translation's request was ever emitted.
        assert_eq!(b.ats.source.len(), 1);
        assert!(!b.atc.valid());
        assert!(!b.ats.in_flight());
    }
}
