//! TLP codec: bit-exact packing and parsing of TLP headers at the link
//! boundary.
//!
//! The packetizer turns request/completion beat streams into raw DWORD
//! beats; the depacketizer does the reverse and additionally recognizes ATS
//! Invalidate Request messages. Headers use PCIe bit positions directly;
//! payload DWORDs keep their byte positions, no swapping anywhere.

use thiserror::Error;

use crate::tlp::{
    AtsInvRequest, CompletionBeat, PasidTag, PhyBeat, RequestBeat, DW_BYTES,
};

const TYPE_MEM: u8 = 0b0_0000;
const TYPE_CPL: u8 = 0b0_1010;
const TYPE_MSG_BY_ID: u8 = 0b1_0010;

/// Message code of the inbound Invalidate Request message.
pub const MSG_CODE_INV_REQUEST: u8 = 0x01;

/// Completion status field value for Unsupported Request.
pub const CPL_STATUS_UR: u8 = 0b001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TlpError {
    #[error("empty TLP")]
    Empty,
    #[error("truncated TLP: expected {expected} DWORDs, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("unsupported TLP fmt={fmt:#05b} type={typ:#07b}")]
    Unsupported { fmt: u8, typ: u8 },
    #[error("malformed TLP: {0}")]
    Malformed(&'static str),
}

/// A whole parsed inbound TLP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tlp {
    Request(Vec<RequestBeat>),
    Completion(Vec<CompletionBeat>),
    AtsInvalidation(AtsInvRequest),
}

fn decode_len(raw: u32) -> u32 {
    if raw & 0x3FF == 0 {
        1024
    } else {
        raw & 0x3FF
    }
}

/// Gather the valid DWORDs of a TLP from its beats.
fn collect_dwords(beats: &[PhyBeat]) -> Vec<u32> {
    let mut dws = Vec::with_capacity(beats.len() * 2);
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

/// Pack DWORDs into 64-bit beats, low DWORD first.
fn pack_dwords(dws: &[u32], bar_hit: u8, pasid: PasidTag) -> Vec<PhyBeat> {
    let n_beats = dws.len().div_ceil(2);
    (0..n_beats)
        .map(|i| {
            let low = dws[i * 2];
            let high = dws.get(i * 2 + 1).copied();
            PhyBeat {
                first: i == 0,
                last: i == n_beats - 1,
                dat: u64::from(low) | (u64::from(high.unwrap_or(0)) << 32),
                be: if high.is_some() { 0xFF } else { 0x0F },
                bar_hit,
                pasid,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Packetizer
// ---------------------------------------------------------------------------

/// Pack one request TLP (all beats, `first..last`) into raw beats.
///
/// The PASID metadata and (for host-side test benches) the `bar_hit` of the
/// first beat are carried through on every emitted beat.
pub fn packetize_request(beats: &[RequestBeat]) -> Vec<PhyBeat> {
    let Some(head) = beats.first() else {
        return Vec::new();
    };
    let four_dw = head.adr > u64::from(u32::MAX);
    let fmt = (u8::from(head.we) << 1) | u8::from(four_dw);
    let dw0 = (u32::from(fmt) << 29)
        | (u32::from(TYPE_MEM) << 24)
        | (u32::from(head.attr >> 2) << 18)
        | (u32::from(head.attr & 0x3) << 12)
        | (u32::from(head.at & 0x3) << 10)
        | u32::from(head.len & 0x3FF);
    let dw1 = (u32::from(head.req_id) << 16)
        | (u32::from(head.tag) << 8)
        | (u32::from(head.last_be & 0xF) << 4)
        | u32::from(head.first_be & 0xF);

    let mut dws = vec![dw0, dw1];
    if four_dw {
        dws.push((head.adr >> 32) as u32);
    }
    dws.push(head.adr as u32 & !0x3);

    if head.we {
        let payload = head.len_dwords() as usize;
        let mut pushed = 0;
        for beat in beats {
            if pushed < payload && beat.be & 0x0F != 0 {
                dws.push(beat.low_dw());
                pushed += 1;
            }
            if pushed < payload && beat.be & 0xF0 != 0 {
                dws.push(beat.high_dw());
                pushed += 1;
            }
        }
    }
    pack_dwords(&dws, head.bar_hit, head.pasid)
}

/// Pack one completion TLP into raw beats.
///
/// Completions with `err` become a data-less Cpl with UR status; everything
/// else is a CplD.
pub fn packetize_completion(beats: &[CompletionBeat]) -> Vec<PhyBeat> {
    let Some(head) = beats.first() else {
        return Vec::new();
    };
    let has_data = !head.err;
    let fmt: u8 = if has_data { 0b010 } else { 0b000 };
    let status: u8 = if head.err { CPL_STATUS_UR } else { 0 };
    let len_field = if has_data { u32::from(head.len & 0x3FF) } else { 0 };
    let dw0 = (u32::from(fmt) << 29) | (u32::from(TYPE_CPL) << 24) | len_field;
    let dw1 = (u32::from(head.cmp_id) << 16)
        | (u32::from(status) << 13)
        | u32::from(head.byte_count & 0xFFF);
    let dw2 = (u32::from(head.req_id) << 16)
        | (u32::from(head.tag) << 8)
        | (head.adr as u32 & 0x7F);

    let mut dws = vec![dw0, dw1, dw2];
    if has_data {
        let payload = head.len_dwords() as usize;
        let mut pushed = 0;
        for beat in beats {
            if pushed < payload && beat.be & 0x0F != 0 {
                dws.push(beat.low_dw());
                pushed += 1;
            }
            if pushed < payload && beat.be & 0xF0 != 0 {
                dws.push(beat.high_dw());
                pushed += 1;
            }
        }
    }
    pack_dwords(&dws, 0, PasidTag::default())
}

// ---------------------------------------------------------------------------
// Depacketizer
// ---------------------------------------------------------------------------

/// Accumulates raw beats and yields one parsed TLP per `first..last` run.
#[derive(Debug, Default)]
pub struct Depacketizer {
    beats: Vec<PhyBeat>,
}

impl Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.beats.clear();
    }

    /// Feed one beat; returns the parse result once a whole TLP is in.
    ///
    /// Beats outside a `first..last` run are dropped (protocol violation:
    /// the TLP is discarded without touching any internal state).
    pub fn push(&mut self, beat: PhyBeat) -> Option<Result<Tlp, TlpError>> {
        if self.beats.is_empty() && !beat.first {
            tracing::debug!("rx beat outside TLP dropped");
            return None;
        }
        if !self.beats.is_empty() && beat.first {
            tracing::debug!("rx TLP restarted mid-packet, discarding previous beats");
            self.beats.clear();
        }
        let last = beat.last;
        self.beats.push(beat);
        if !last {
            return None;
        }
        let tlp = parse_tlp(&self.beats);
        self.beats.clear();
        Some(tlp)
    }
}

/// Parse one whole TLP from its raw beats.
pub fn parse_tlp(beats: &[PhyBeat]) -> Result<Tlp, TlpError> {
    let dws = collect_dwords(beats);
    if dws.is_empty() {
        return Err(TlpError::Empty);
    }
    let dw0 = dws[0];
    let fmt = (dw0 >> 29) as u8 & 0x7;
    let typ = (dw0 >> 24) as u8 & 0x1F;
    match typ {
        TYPE_MEM => parse_request(&dws, fmt, beats),
        TYPE_CPL => parse_completion(&dws, fmt),
        TYPE_MSG_BY_ID => parse_message(&dws, fmt),
        _ => Err(TlpError::Unsupported { fmt, typ }),
    }
}

fn need(dws: &[u32], expected: usize) -> Result<(), TlpError> {
    if dws.len() < expected {
        return Err(TlpError::Truncated {
            expected,
            got: dws.len(),
        });
    }
    Ok(())
}

fn parse_request(dws: &[u32], fmt: u8, beats: &[PhyBeat]) -> Result<Tlp, TlpError> {
    let four_dw = fmt & 0b001 != 0;
    let we = fmt & 0b010 != 0;
    let header_len = if four_dw { 4 } else { 3 };
    need(dws, header_len)?;

    let dw0 = dws[0];
    let dw1 = dws[1];
    let len_raw = (dw0 & 0x3FF) as u16;
    let len_dw = decode_len(dw0);
    let attr = (((dw0 >> 18) & 1) << 2 | ((dw0 >> 12) & 0x3)) as u8;
    let at = ((dw0 >> 10) & 0x3) as u8;
    let req_id = (dw1 >> 16) as u16;
    let tag = (dw1 >> 8) as u8;
    let last_be = ((dw1 >> 4) & 0xF) as u8;
    let first_be = (dw1 & 0xF) as u8;
    let adr = if four_dw {
        (u64::from(dws[2]) << 32) | u64::from(dws[3] & !0x3)
    } else {
        u64::from(dws[2] & !0x3)
    };
    let bar_hit = beats.first().map(|b| b.bar_hit).unwrap_or(0);

    let template = RequestBeat {
        we,
        adr,
        len: len_raw,
        tag,
        req_id,
        first_be,
        last_be,
        bar_hit,
        attr,
        at,
        ..Default::default()
    };

    if !we {
        return Ok(Tlp::Request(vec![RequestBeat {
            first: true,
            last: true,
            ..template
        }]));
    }

    let payload = &dws[header_len..];
    need(dws, header_len + len_dw as usize)?;
    // Per-DWORD byte enables: first/last DWORDs take the header enables.
    let dw_be = |i: u32| -> u8 {
        if i == 0 {
            first_be
        } else if i + 1 == len_dw {
            if len_dw == 1 {
                first_be
            } else {
                last_be
            }
        } else {
            0xF
        }
    };
    let n_beats = (len_dw as usize).div_ceil(2);
    let mut out = Vec::with_capacity(n_beats);
    for i in 0..n_beats {
        let low = payload[i * 2];
        let high = payload.get(i * 2 + 1).copied().unwrap_or(0);
        let low_be = dw_be(i as u32 * 2);
        let high_be = if (i * 2 + 1) < len_dw as usize {
            dw_be(i as u32 * 2 + 1)
        } else {
            0
        };
        out.push(RequestBeat {
            first: i == 0,
            last: i == n_beats - 1,
            dat: u64::from(low) | (u64::from(high) << 32),
            be: low_be | (high_be << 4),
            ..template
        });
    }
    Ok(Tlp::Request(out))
}

fn parse_completion(dws: &[u32], fmt: u8) -> Result<Tlp, TlpError> {
    let has_data = fmt & 0b010 != 0;
    need(dws, 3)?;
    let dw0 = dws[0];
    let dw1 = dws[1];
    let dw2 = dws[2];
    let len_raw = (dw0 & 0x3FF) as u16;
    let len_dw = if has_data { decode_len(dw0) } else { 0 };
    let cmp_id = (dw1 >> 16) as u16;
    let status = ((dw1 >> 13) & 0x7) as u8;
    let byte_count = (dw1 & 0xFFF) as u16;
    let req_id = (dw2 >> 16) as u16;
    let tag = (dw2 >> 8) as u8;
    let lower_addr = u64::from(dw2 & 0x7F);
    let err = status != 0;
    // Final completion for the request when it carries (at least) the whole
    // remaining byte count.
    let end = err || u32::from(byte_count) <= len_dw * DW_BYTES;

    let template = CompletionBeat {
        adr: lower_addr,
        len: len_raw,
        tag,
        req_id,
        cmp_id,
        end,
        err,
        byte_count,
        ..Default::default()
    };

    if !has_data {
        return Ok(Tlp::Completion(vec![CompletionBeat {
            first: true,
            last: true,
            ..template
        }]));
    }

    need(dws, 3 + len_dw as usize)?;
    let payload = &dws[3..];
    let n_beats = (len_dw as usize).div_ceil(2);
    let mut out = Vec::with_capacity(n_beats);
    for i in 0..n_beats {
        let low = payload[i * 2];
        let high = payload.get(i * 2 + 1).copied();
        let high_in_payload = (i * 2 + 1) < len_dw as usize;
        out.push(CompletionBeat {
            first: i == 0,
            last: i == n_beats - 1,
            dat: u64::from(low) | (u64::from(high.unwrap_or(0)) << 32),
            be: if high_in_payload { 0xFF } else { 0x0F },
            ..template
        });
    }
    Ok(Tlp::Completion(out))
}

fn parse_message(dws: &[u32], fmt: u8) -> Result<Tlp, TlpError> {
    let typ = TYPE_MSG_BY_ID;
    // Only the Invalidate Request (4DW header + 8-byte payload) is consumed.
    if fmt != 0b011 {
        return Err(TlpError::Unsupported { fmt, typ });
    }
    need(dws, 6)?;
    let dw1 = dws[1];
    if (dw1 & 0xFF) as u8 != MSG_CODE_INV_REQUEST {
        return Err(TlpError::Unsupported { fmt, typ });
    }
    let req_id = (dw1 >> 16) as u16;
    let itag = (dw1 >> 8) as u8;
    let body = u64::from(dws[4]) | (u64::from(dws[5]) << 32);
    let global = body & 0x1 != 0;
    let s_bit = body & (1 << 11) != 0;
    let (addr, size) = if s_bit {
        // Range size is encoded by the run of 1s above bit 12.
        let mut bit = 12u32;
        while bit < 63 && body & (1 << bit) != 0 {
            bit += 1;
        }
        let size = 1u64 << (bit + 1);
        (body & !(size - 1), size)
    } else {
        (body & !0xFFF, 4096)
    };
    Ok(Tlp::AtsInvalidation(AtsInvRequest {
        req_id,
        itag,
        addr,
        size,
        global,
        pasid_valid: false,
        pasid_val: 0,
    }))
}

// ---------------------------------------------------------------------------
// Host-side builders (used by test benches acting as the root complex)
// ---------------------------------------------------------------------------

/// Build the raw beats of a memory write request aimed at a BAR.
pub fn build_memory_write(bar: u8, adr: u64, req_id: u16, tag: u8, payload: &[u32]) -> Vec<PhyBeat> {
    debug_assert!(!payload.is_empty());
    let len = RequestBeat::encode_len(payload.len() as u32);
    let head = RequestBeat {
        we: true,
        adr,
        len,
        tag,
        req_id,
        first_be: 0xF,
        last_be: if payload.len() == 1 { 0 } else { 0xF },
        bar_hit: 1 << bar,
        ..Default::default()
    };
    let n_beats = payload.len().div_ceil(2);
    let beats: Vec<RequestBeat> = (0..n_beats)
        .map(|i| {
            let low = payload[i * 2];
            let high = payload.get(i * 2 + 1).copied();
            RequestBeat {
                first: i == 0,
                last: i == n_beats - 1,
                dat: u64::from(low) | (u64::from(high.unwrap_or(0)) << 32),
                be: if high.is_some() { 0xFF } else { 0x0F },
                ..head
            }
        })
        .collect();
    packetize_request(&beats)
}

/// Build the raw beats of a memory read request aimed at a BAR.
pub fn build_memory_read(bar: u8, adr: u64, req_id: u16, tag: u8, len_dw: u32) -> Vec<PhyBeat> {
    packetize_request(&[RequestBeat {
        first: true,
        last: true,
        we: false,
        adr,
        len: RequestBeat::encode_len(len_dw),
        tag,
        req_id,
        first_be: 0xF,
        last_be: if len_dw == 1 { 0 } else { 0xF },
        bar_hit: 1 << bar,
        ..Default::default()
    }])
}

/// Build the raw beats of a read completion returned to the endpoint.
pub fn build_read_completion(
    req_id: u16,
    cmp_id: u16,
    tag: u8,
    payload: &[u32],
    err: bool,
) -> Vec<PhyBeat> {
    let len = RequestBeat::encode_len(payload.len().max(1) as u32);
    let byte_count = (payload.len() as u16) * 4;
    let head = CompletionBeat {
        len,
        tag,
        req_id,
        cmp_id,
        end: true,
        err,
        byte_count,
        ..Default::default()
    };
    if err || payload.is_empty() {
        return packetize_completion(&[CompletionBeat {
            first: true,
            last: true,
            err: true,
            ..head
        }]);
    }
    let n_beats = payload.len().div_ceil(2);
    let beats: Vec<CompletionBeat> = (0..n_beats)
        .map(|i| {
            let low = payload[i * 2];
            let high = payload.get(i * 2 + 1).copied();
            CompletionBeat {
                first: i == 0,
                last: i == n_beats - 1,
                dat: u64::from(low) | (u64::from(high.unwrap_or(0)) << 32),
                be: if high.is_some() { 0xFF } else { 0x0F },
                ..head
            }
        })
        .collect();
    packetize_completion(&beats)
}

/// Build an ATS Invalidate Request message covering `[addr, addr + size)`.
pub fn build_ats_invalidate(req_id: u16, itag: u8, addr: u64, size: u64, global: bool) -> Vec<PhyBeat> {
    let dw0 = (0b011u32 << 29) | (u32::from(TYPE_MSG_BY_ID) << 24) | 2;
    let dw1 = (u32::from(req_id) << 16) | (u32::from(itag) << 8) | u32::from(MSG_CODE_INV_REQUEST);
    let mut body = addr & !0xFFF;
    if size > 4096 {
        // Encode the range with the S bit and a run of 1s above bit 12.
        let span = size.next_power_of_two().max(8192);
        body = (addr & !(span - 1)) | ((span / 2 - 1) & !0xFFF) | (1 << 11);
    }
    if global {
        body |= 1;
    }
    let dws = [dw0, dw1, 0, 0, body as u32, (body >> 32) as u32];
    pack_dwords(&dws, 0, PasidTag::default())
}
