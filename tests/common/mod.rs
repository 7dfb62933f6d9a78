//! Host-side bench: acts as the root complex driving the exerciser over raw
//! TLP beats, the way the compliance suites do.

use bsa_exerciser::codec::{self, Tlp};
use bsa_exerciser::{Exerciser, LinkConfig, PhyBeat};

/// Requester ID the bench uses for host-originated requests.
pub const HOST_ID: u16 = 0x0008;

pub struct Host {
    pub ex: Exerciser,
    next_tag: u8,
    tx_tlps: Vec<Vec<PhyBeat>>,
}

impl Host {
    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    pub fn with_config(cfg: LinkConfig) -> Self {
        Self {
            ex: Exerciser::new(cfg),
            next_tag: 0,
            tx_tlps: Vec::new(),
        }
    }

    fn alloc_tag(&mut self) -> u8 {
        let tag = self.next_tag;
        self.next_tag = (self.next_tag + 1) % 0xE0;
        tag
    }

    /// Run the core until quiescent and harvest TX beats into whole TLPs,
    /// checking TLP atomicity (exactly one `first`, one `last`, contiguous).
    pub fn pump(&mut self) {
        self.ex.run_until_idle();
        let mut cur: Vec<PhyBeat> = Vec::new();
        while let Some(beat) = self.ex.tx_pop() {
            if cur.is_empty() {
                assert!(beat.first, "TX beat outside a TLP");
            } else {
                assert!(!beat.first, "nested `first` inside a TLP");
            }
            let last = beat.last;
            cur.push(beat);
            if last {
                self.tx_tlps.push(std::mem::take(&mut cur));
            }
        }
        assert!(cur.is_empty(), "truncated TLP left on TX");
    }

    /// All TX TLPs captured so far, clearing the store.
    pub fn take_tx_tlps(&mut self) -> Vec<Vec<PhyBeat>> {
        std::mem::take(&mut self.tx_tlps)
    }

    /// Parsed outbound request TLPs (posted writes, reads), clearing them
    /// from the store. Completions stay queued.
    pub fn take_tx_requests(&mut self) -> Vec<Vec<bsa_exerciser::RequestBeat>> {
        let mut requests = Vec::new();
        self.tx_tlps.retain(|tlp| match codec::parse_tlp(tlp) {
            Ok(Tlp::Request(req)) => {
                requests.push(req);
                false
            }
            _ => true,
        });
        requests
    }

    pub fn bar_write(&mut self, bar: u8, adr: u64, payload: &[u32]) {
        let tag = self.alloc_tag();
        let beats = codec::build_memory_write(bar, adr, HOST_ID, tag, payload);
        self.ex.rx_push_tlp(beats);
        self.pump();
    }

    pub fn bar_read(&mut self, bar: u8, adr: u64, len_dw: u32) -> Vec<u32> {
        match self.bar_read_raw(bar, adr, len_dw) {
            ReadResult::Data(dws) => dws,
            ReadResult::Unsupported => panic!("unexpected UR completion for BAR{bar} read"),
        }
    }

    pub fn bar_read_expect_ur(&mut self, bar: u8, adr: u64, len_dw: u32) {
        match self.bar_read_raw(bar, adr, len_dw) {
            ReadResult::Unsupported => {}
            ReadResult::Data(dws) => panic!("expected UR, got data {dws:x?}"),
        }
    }

    fn bar_read_raw(&mut self, bar: u8, adr: u64, len_dw: u32) -> ReadResult {
        let tag = self.alloc_tag();
        let beats = codec::build_memory_read(bar, adr, HOST_ID, tag, len_dw);
        self.ex.rx_push_tlp(beats);
        self.pump();

        let mut dws = Vec::new();
        let mut saw_ur = false;
        let mut done = false;
        self.tx_tlps.retain(|tlp| {
            if done {
                return true;
            }
            match codec::parse_tlp(tlp) {
                Ok(Tlp::Completion(cpl)) if cpl[0].tag == tag => {
                    if cpl[0].err {
                        saw_ur = true;
                        done = true;
                        return false;
                    }
                    let mut want = cpl[0].len_dwords() as usize;
                    for beat in &cpl {
                        if want > 0 && beat.be & 0x0F != 0 {
                            dws.push(beat.dat as u32);
                            want -= 1;
                        }
                        if want > 0 && beat.be & 0xF0 != 0 {
                            dws.push((beat.dat >> 32) as u32);
                            want -= 1;
                        }
                    }
                    if cpl[0].end {
                        done = true;
                    }
                    false
                }
                _ => true,
            }
        });
        assert!(done, "read of BAR{bar} never completed");
        if saw_ur {
            ReadResult::Unsupported
        } else {
            assert_eq!(dws.len() as u32, len_dw, "short read payload");
            ReadResult::Data(dws)
        }
    }

    // Convenience register access through real BAR0 TLPs.

    pub fn reg_write(&mut self, offset: u32, value: u32) {
        self.bar_write(0, u64::from(offset), &[value]);
    }

    pub fn reg_read(&mut self, offset: u32) -> u32 {
        self.bar_read(0, u64::from(offset), 1)[0]
    }

    /// Answer the oldest outstanding DMA read request with completion data.
    /// Returns the tag answered.
    pub fn complete_read(&mut self, req: &[bsa_exerciser::RequestBeat], payload: &[u32]) -> u8 {
        let head = req[0];
        assert!(!head.we, "cannot complete a posted write");
        assert_eq!(payload.len() as u32, head.len_dwords(), "payload size mismatch");
        let beats =
            codec::build_read_completion(head.req_id, HOST_ID, head.tag, payload, false);
        self.ex.rx_push_tlp(beats);
        self.pump();
        head.tag
    }
}

enum ReadResult {
    Data(Vec<u32>),
    Unsupported,
}
