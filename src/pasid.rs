//! PASID E2E TLP prefix injector.
//!
//! Sits between the packetizer and the TX arbiter. When the first beat of a
//! TLP carries `pasid.en`, the whole TLP is shifted one DWORD down and the
//! prefix DWORD (format 0x91) is emitted in front of the header; otherwise
//! beats pass through untouched. The PASID metadata is consumed here and
//! never reaches the link.
//!
//! On the 64-bit datapath the shift works as:
//!
//! ```text
//! without prefix: [HDR0|HDR1][HDR2|HDR3][DATA...]
//! with prefix:    [PFX |HDR0][HDR1|HDR2][HDR3|DATA0][DATA...]
//! ```
//!
//! A final flush beat carries the residual upper DWORD when the shifted TLP
//! no longer fits, so the output is one beat longer at most and never
//! shorter.

use std::collections::VecDeque;

use crate::tlp::{PasidTag, PhyBeat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Passthrough,
    Shift,
}

#[derive(Debug)]
pub struct PasidInjector {
    state: State,
    /// Upper DWORD of the previous input beat, pending emission.
    buffered: u32,
    buffered_be: u8,
}

impl Default for PasidInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl PasidInjector {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            buffered: 0,
            buffered_be: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed one beat; transformed beats are appended to `out`.
    pub fn push(&mut self, beat: PhyBeat, out: &mut VecDeque<PhyBeat>) {
        match self.state {
            State::Idle => {
                if !beat.first {
                    // Mid-packet beat with no packet open: malformed input.
                    tracing::debug!("pasid injector dropped beat outside packet");
                    return;
                }
                if beat.pasid.en {
                    self.start_shifted(beat, out);
                } else {
                    let last = beat.last;
                    out.push_back(Self::scrub(beat));
                    self.state = if last { State::Idle } else { State::Passthrough };
                }
            }
            State::Passthrough => {
                let last = beat.last;
                out.push_back(Self::scrub(beat));
                if last {
                    self.state = State::Idle;
                }
            }
            State::Shift => self.shift(beat, out),
        }
    }

    fn start_shifted(&mut self, beat: PhyBeat, out: &mut VecDeque<PhyBeat>) {
        let prefix = beat.pasid.prefix_dword();
        out.push_back(PhyBeat {
            first: true,
            last: false,
            dat: u64::from(prefix) | (u64::from(beat.low_dw()) << 32),
            be: 0xFF,
            bar_hit: 0,
            pasid: PasidTag::default(),
        });
        self.buffered = beat.high_dw();
        self.buffered_be = beat.be >> 4;
        if beat.last {
            // Single-beat input: the shifted-out upper DWORD becomes the
            // final beat.
            self.flush(out);
        } else {
            self.state = State::Shift;
        }
    }

    fn shift(&mut self, beat: PhyBeat, out: &mut VecDeque<PhyBeat>) {
        let residue = beat.be >> 4;
        let closes_here = beat.last && residue == 0;
        out.push_back(PhyBeat {
            first: false,
            last: closes_here,
            dat: u64::from(self.buffered) | (u64::from(beat.low_dw()) << 32),
            be: self.buffered_be | ((beat.be & 0x0F) << 4),
            bar_hit: 0,
            pasid: PasidTag::default(),
        });
        self.buffered = beat.high_dw();
        self.buffered_be = residue;
        if beat.last {
            if closes_here {
                self.state = State::Idle;
            } else {
                self.flush(out);
            }
        }
    }

    fn flush(&mut self, out: &mut VecDeque<PhyBeat>) {
        out.push_back(PhyBeat {
            first: false,
            last: true,
            dat: u64::from(self.buffered),
            be: self.buffered_be,
            bar_hit: 0,
            pasid: PasidTag::default(),
        });
        self.buffered = 0;
        self.buffered_be = 0;
        self.state = State::Idle;
    }

    fn scrub(beat: PhyBeat) -> PhyBeat {
        PhyBeat {
            bar_hit: 0,
            pasid: PasidTag::default(),
            ..beat
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tlp(dws: &[u32], pasid: PasidTag) -> Vec<PhyBeat> {
        let beats = dws.len().div_ceil(2);
        (0..beats)
            .map(|i| {
                let low = dws[i * 2];
                let high = dws.get(i * 2 + 1).copied().unwrap_or(0);
                let high_valid = dws.len() > i * 2 + 1;
                PhyBeat {
                    first: i == 0,
                    last: i == beats - 1,
                    dat: u64::from(low) | (u64::from(high) << 32),
                    be: if high_valid { 0xFF } else { 0x0F },
                    bar_hit: 0,
                    pasid,
                }
            })
            .collect()
    }

    fn run(beats: Vec<PhyBeat>) -> Vec<PhyBeat> {
        let mut inj = PasidInjector::new();
        let mut out = VecDeque::new();
        for beat in beats {
            inj.push(beat, &mut out);
        }
        out.into()
    }

    fn output_dwords(beats: &[PhyBeat]) -> Vec<u32> {
        let mut dws = Vec::new();
        for beat in beats {
            if beat.be & 0x0F != 0 {
                dws.push(beat.low_dw());
            }
            if beat.be & 0xF0 != 0 {
                dws.push(beat.high_dw());
            }
        }
        dws
    }

    #[test]
    fn passthrough_without_pasid() {
        let input = tlp(&[0x11, 0x22, 0x33, 0x44], PasidTag::default());
        let out = run(input.clone());
        assert_eq!(out.len(), input.len());
        assert_eq!(output_dwords(&out), vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn prefix_shifts_whole_tlp_one_dword() {
        let pasid = PasidTag {
            en: true,
            val: 0x42,
            privileged: true,
            execute: false,
        };
        let out = run(tlp(&[0xA0, 0xA1, 0xA2], pasid));
        assert_eq!(output_dwords(&out), vec![0x9120_0042, 0xA0, 0xA1, 0xA2]);
        // Exactly one first and one last.
        assert_eq!(out.iter().filter(|b| b.first).count(), 1);
        assert_eq!(out.iter().filter(|b| b.last).count(), 1);
        assert!(out.last().unwrap().last);
    }

    #[test]
    fn odd_length_avoids_flush_beat() {
        // 3 input DWORDs -> 4 shifted DWORDs: fits in the same beat count.
        let pasid = PasidTag {
            en: true,
            val: 1,
            ..Default::default()
        };
        let input = tlp(&[0xA0, 0xA1, 0xA2], pasid);
        let out = run(input.clone());
        assert_eq!(out.len(), input.len());
    }

    #[test]
    fn even_length_emits_flush_beat() {
        let pasid = PasidTag {
            en: true,
            val: 1,
            ..Default::default()
        };
        let input = tlp(&[0xA0, 0xA1, 0xA2, 0xA3], pasid);
        let out = run(input.clone());
        assert_eq!(out.len(), input.len() + 1);
        assert_eq!(output_dwords(&out), vec![0x9100_0001, 0xA0, 0xA1, 0xA2, 0xA3]);
    }

    proptest! {
        #[test]
        fn beat_count_invariant(dws in proptest::collection::vec(any::<u32>(), 1..64),
                                en in any::<bool>(),
                                val in 0u32..0x10_0000) {
            let pasid = PasidTag { en, val, privileged: false, execute: false };
            let input = tlp(&dws, pasid);
            let out = run(input.clone());
            if en {
                prop_assert!(out.len() == input.len() || out.len() == input.len() + 1);
                prop_assert_eq!(out[0].low_dw() >> 24, 0x91);
                let mut expect = vec![pasid.prefix_dword()];
                expect.extend(&dws);
                prop_assert_eq!(output_dwords(&out), expect);
            } else {
                prop_assert_eq!(out.len(), input.len());
                prop_assert_eq!(output_dwords(&out), dws);
            }
            prop_assert_eq!(out.iter().filter(|b| b.first).count(), 1);
            prop_assert_eq!(out.iter().filter(|b| b.last).count(), 1);
        }
    }
}
