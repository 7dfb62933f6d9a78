//! BAR dispatch and stream arbitration.
//!
//! - [`BarDispatcher`] routes each inbound request TLP to exactly one
//!   per-BAR handler, latching the route on the first beat so multi-beat
//!   TLPs are never split across handlers.
//! - [`StubHandler`] services disabled BARs: writes are dropped, reads get
//!   an Unsupported Request completion.
//! - [`CompletionArbiter`] merges handler completion streams (fixed
//!   priority, lowest BAR first) and [`MasterArbiter`] merges the outbound
//!   request masters (round-robin). Both switch grant only at TLP
//!   boundaries.
//! - [`TxArbiter`] merges the main packetized path with raw message sources;
//!   raw TLPs may only preempt between main-path packets.

use std::collections::VecDeque;

use crate::tlp::{CompletionBeat, PhyBeat, RequestBeat};

/// Where an inbound request TLP is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarTarget {
    /// BAR0: register file.
    Registers,
    /// BAR1: DMA buffer.
    DmaBuffer,
    /// BAR2: MSI-X table.
    MsixTable,
    /// BAR5: MSI-X PBA.
    MsixPba,
    /// BAR3/BAR4 and unmatched requests.
    Stub,
}

fn decode_bar_hit(bar_hit: u8) -> BarTarget {
    match bar_hit.trailing_zeros() {
        0 => BarTarget::Registers,
        1 => BarTarget::DmaBuffer,
        2 => BarTarget::MsixTable,
        5 => BarTarget::MsixPba,
        // BAR3/BAR4 are disabled; bar_hit == 0 is unmatched.
        _ => BarTarget::Stub,
    }
}

/// Routes request beats by `bar_hit`, holding the selection for the whole
/// TLP.
#[derive(Debug, Default)]
pub struct BarDispatcher {
    current: Option<BarTarget>,
}

impl BarDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Route one beat. The first beat of a TLP decides; every following
    /// beat up to `last` goes to the same handler.
    pub fn route(&mut self, beat: &RequestBeat) -> BarTarget {
        let target = match self.current {
            Some(target) if !beat.first => target,
            _ => decode_bar_hit(beat.bar_hit),
        };
        self.current = if beat.last { None } else { Some(target) };
        target
    }
}

/// Handler for disabled BARs (BAR3/BAR4) and unmatched requests.
#[derive(Debug, Default)]
pub struct StubHandler;

impl StubHandler {
    /// Service one whole request TLP: reads get a single UR completion with
    /// the request length echoed; writes are accepted and dropped.
    pub fn handle(&self, tlp: &[RequestBeat], cmp_id: u16) -> Option<CompletionBeat> {
        let head = tlp.first()?;
        if head.we {
            tracing::debug!(adr = head.adr, "stub BAR write dropped");
            return None;
        }
        Some(CompletionBeat {
            first: true,
            last: true,
            end: true,
            err: true,
            len: head.len,
            tag: head.tag,
            req_id: head.req_id,
            cmp_id,
            ..Default::default()
        })
    }
}

/// Fixed-priority completion merge: lower BAR number wins, grant held to the
/// end of the current TLP.
#[derive(Debug, Default)]
pub struct CompletionArbiter {
    grant: Option<usize>,
}

impl CompletionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.grant = None;
    }

    /// Move at most one beat from the granted source.
    pub fn tick(&mut self, sources: &mut [&mut VecDeque<CompletionBeat>]) -> Option<CompletionBeat> {
        let grant = match self.grant {
            Some(g) => g,
            None => sources.iter().position(|s| !s.is_empty())?,
        };
        let beat = sources[grant].pop_front()?;
        self.grant = if beat.last { None } else { Some(grant) };
        Some(beat)
    }
}

/// Round-robin merge of the outbound request masters (DMA, MSI-X, ATS).
///
/// A granted master holds the stream until `last`; afterwards the scan
/// resumes from the next index, so no master with a pending TLP is starved
/// for more than one full round.
#[derive(Debug, Default)]
pub struct MasterArbiter {
    grant: Option<usize>,
    rr_next: usize,
}

impl MasterArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.grant = None;
        self.rr_next = 0;
    }

    /// Move at most one beat from the granted master.
    pub fn tick(&mut self, sources: &mut [&mut VecDeque<RequestBeat>]) -> Option<RequestBeat> {
        let n = sources.len();
        if n == 0 {
            return None;
        }
        let grant = match self.grant {
            Some(g) => g,
            None => (0..n)
                .map(|i| (self.rr_next + i) % n)
                .find(|&i| !sources[i].is_empty())?,
        };
        let beat = sources[grant].pop_front()?;
        if beat.last {
            self.grant = None;
            self.rr_next = (grant + 1) % n;
        } else {
            self.grant = Some(grant);
        }
        Some(beat)
    }
}

/// Merges the main TX path (packetizer -> PASID injector) with raw message
/// sources. Raw TLPs are emitted atomically and only between main-path
/// packets.
#[derive(Debug, Default)]
pub struct TxArbiter {
    main_in_packet: bool,
    raw_in_packet: bool,
}

impl TxArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.main_in_packet = false;
        self.raw_in_packet = false;
    }

    /// Move at most one beat to the TX stream.
    pub fn tick(
        &mut self,
        main: &mut VecDeque<PhyBeat>,
        raw: &mut VecDeque<PhyBeat>,
    ) -> Option<PhyBeat> {
        if self.raw_in_packet {
            let beat = raw.pop_front()?;
            self.raw_in_packet = !beat.last;
            return Some(beat);
        }
        if self.main_in_packet {
            let beat = main.pop_front()?;
            self.main_in_packet = !beat.last;
            return Some(beat);
        }
        if let Some(beat) = raw.pop_front() {
            self.raw_in_packet = !beat.last;
            return Some(beat);
        }
        let beat = main.pop_front()?;
        self.main_in_packet = !beat.last;
        Some(beat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn req(first: bool, last: bool, tag: u8) -> RequestBeat {
        RequestBeat {
            first,
            last,
            tag,
            ..Default::default()
        }
    }

    #[test]
    fn dispatcher_latches_route_for_whole_tlp() {
        let mut disp = BarDispatcher::new();
        let mut first = req(true, false, 0);
        first.bar_hit = 1 << 1;
        assert_eq!(disp.route(&first), BarTarget::DmaBuffer);
        // Continuation beats carry stale bar_hit; the latch must win.
        let mut mid = req(false, false, 0);
        mid.bar_hit = 1 << 2;
        assert_eq!(disp.route(&mid), BarTarget::DmaBuffer);
        let mut last = req(false, true, 0);
        last.bar_hit = 0;
        assert_eq!(disp.route(&last), BarTarget::DmaBuffer);
        // Next TLP decodes afresh.
        let mut next = req(true, true, 0);
        next.bar_hit = 1 << 5;
        assert_eq!(disp.route(&next), BarTarget::MsixPba);
    }

    #[test]
    fn unmatched_and_disabled_bars_go_to_stub() {
        let mut disp = BarDispatcher::new();
        for bar_hit in [0u8, 1 << 3, 1 << 4] {
            let mut beat = req(true, true, 0);
            beat.bar_hit = bar_hit;
            assert_eq!(disp.route(&beat), BarTarget::Stub);
        }
    }

    #[test]
    fn stub_answers_reads_with_ur_and_drops_writes() {
        let stub = StubHandler;
        let read = RequestBeat {
            first: true,
            last: true,
            we: false,
            len: 4,
            tag: 9,
            req_id: 0x0100,
            ..Default::default()
        };
        let cpl = stub.handle(&[read], 0xBEEF).unwrap();
        assert!(cpl.err && cpl.end);
        assert_eq!(cpl.tag, 9);
        assert_eq!(cpl.len, 4);
        assert_eq!(cpl.cmp_id, 0xBEEF);

        let write = RequestBeat {
            we: true,
            first: true,
            last: true,
            ..Default::default()
        };
        assert!(stub.handle(&[write], 0xBEEF).is_none());
    }

    #[test]
    fn master_arbiter_is_round_robin_at_tlp_boundaries() {
        let mut arb = MasterArbiter::new();
        let mut a: VecDeque<RequestBeat> = [req(true, false, 0), req(false, true, 0)].into();
        let mut b: VecDeque<RequestBeat> = [req(true, true, 1)].into();
        let mut c: VecDeque<RequestBeat> = [req(true, true, 2)].into();

        let mut order = Vec::new();
        loop {
            let Some(beat) = arb.tick(&mut [&mut a, &mut b, &mut c]) else {
                break;
            };
            order.push((beat.tag, beat.last));
        }
        // Master 0's two-beat TLP is atomic, then 1 and 2 each get a turn.
        assert_eq!(order, vec![(0, false), (0, true), (1, true), (2, true)]);
    }

    #[test]
    fn master_arbiter_does_not_starve() {
        let mut arb = MasterArbiter::new();
        let mut a: VecDeque<RequestBeat> = (0..4).map(|_| req(true, true, 0)).collect();
        let mut b: VecDeque<RequestBeat> = (0..4).map(|_| req(true, true, 1)).collect();
        let mut c: VecDeque<RequestBeat> = (0..4).map(|_| req(true, true, 2)).collect();

        let mut tags = Vec::new();
        for _ in 0..6 {
            if let Some(beat) = arb.tick(&mut [&mut a, &mut b, &mut c]) {
                tags.push(beat.tag);
            }
        }
        // Within any window of 2N grants every pending master appears.
        for master in 0..3u8 {
            assert!(tags.contains(&master), "master {master} starved: {tags:?}");
        }
    }

    #[test]
    fn completion_arbiter_prefers_lower_bar_but_finishes_packets() {
        let mut arb = CompletionArbiter::new();
        let mk = |tag: u8, first: bool, last: bool| CompletionBeat {
            first,
            last,
            tag,
            ..Default::default()
        };
        let mut low: VecDeque<CompletionBeat> = VecDeque::new();
        let mut high: VecDeque<CompletionBeat> = [mk(1, true, false), mk(1, false, true)].into();

        // Grant goes to the only requester; low-priority data arriving
        // mid-packet must not steal the stream.
        let first = arb.tick(&mut [&mut low, &mut high]).unwrap();
        assert_eq!(first.tag, 1);
        low.push_back(mk(0, true, true));
        let second = arb.tick(&mut [&mut low, &mut high]).unwrap();
        assert_eq!(second.tag, 1);
        assert!(second.last);
        let third = arb.tick(&mut [&mut low, &mut high]).unwrap();
        assert_eq!(third.tag, 0);
    }

    #[test]
    fn tx_arbiter_lets_raw_preempt_only_between_packets() {
        let mut arb = TxArbiter::new();
        let phy = |first: bool, last: bool, dat: u64| PhyBeat {
            first,
            last,
            dat,
            be: 0xFF,
            ..Default::default()
        };
        let mut main: VecDeque<PhyBeat> =
            [phy(true, false, 1), phy(false, false, 2), phy(false, true, 3)].into();
        let mut raw: VecDeque<PhyBeat> = VecDeque::new();

        assert_eq!(arb.tick(&mut main, &mut raw).unwrap().dat, 1);
        // A raw message arrives mid-packet: it must wait.
        raw.push_back(phy(true, false, 100));
        raw.push_back(phy(false, true, 101));
        assert_eq!(arb.tick(&mut main, &mut raw).unwrap().dat, 2);
        assert_eq!(arb.tick(&mut main, &mut raw).unwrap().dat, 3);
        // Packet boundary: raw wins now, atomically.
        main.push_back(phy(true, true, 4));
        assert_eq!(arb.tick(&mut main, &mut raw).unwrap().dat, 100);
        assert_eq!(arb.tick(&mut main, &mut raw).unwrap().dat, 101);
        assert_eq!(arb.tick(&mut main, &mut raw).unwrap().dat, 4);
    }
}
