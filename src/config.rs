//! Configuration-space collaborator surface.
//!
//! The real exerciser exposes ATS/PASID/ACS/DPC capability structures through
//! an external configuration-space block. The core consumes only a handful of
//! values from it; they are collected here so the rest of the model has a
//! single seam to the outside.

/// Link/identity parameters supplied by the configuration collaborator.
///
/// `max_payload_size` and `max_request_size` are re-read by the DMA engine on
/// every trigger, so a test bench may change them between transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Bus/Device/Function assigned to the endpoint, used as the requester or
    /// completer ID when the RID override is inactive.
    pub endpoint_id: u16,
    /// ATS ECAP enable bit. With ATS disabled the ATS engine refuses new
    /// triggers and drops cached translations.
    pub ats_enabled: bool,
    /// Negotiated Max Payload Size in bytes.
    pub max_payload_size: u32,
    /// Negotiated Max Read Request Size in bytes.
    pub max_request_size: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint_id: 0x0100,
            ats_enabled: true,
            max_payload_size: 256,
            max_request_size: 512,
        }
    }
}
