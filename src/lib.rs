//! Behavioral model of an ARM BSA PCIe Exerciser endpoint.
//!
//! The exerciser is a register-driven PCIe endpoint that BSA/ACS-style
//! compliance suites use to stimulate a Root Complex, IOMMU and interrupt
//! controller. This crate models its transaction layer bit-exactly at the
//! TLP boundary: raw 64-bit DWORD beats in, raw beats out, a BAR0 register
//! file as the control surface in between.
//!
//! What is modeled:
//! - multi-BAR request dispatch with per-BAR handlers and completion merge
//! - the DMA engine (chunked reads/writes, tags, timeout, ATC lookups)
//! - the MSI-X table/PBA/controller
//! - the ATS engine, single-entry ATC, and invalidation handling
//! - the PASID E2E prefix injector on the TX path
//! - the lossy transaction monitor behind `TXN_TRACE`
//!
//! The link and physical layers, config-space capability structures, and
//! host-side transports are external collaborators; see [`config::LinkConfig`]
//! for the values the core consumes from them.
//!
//! Everything is driven by a deterministic, single-threaded
//! [`exerciser::Exerciser::tick`] loop; see that type for the step order.

pub mod atc;
pub mod ats;
pub mod ats_inv;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod dma;
pub mod exerciser;
pub mod monitor;
pub mod msix;
pub mod pasid;
pub mod regs;
pub mod routing;
pub mod tlp;

pub use atc::{Atc, AtcEntry, AtsPermissions};
pub use buffer::{DmaBuffer, DMA_BUFFER_SIZE};
pub use config::LinkConfig;
pub use exerciser::Exerciser;
pub use monitor::{TxnMonitor, TXN_FIFO_DEPTH, TXN_TRACE_EMPTY};
pub use msix::MSIX_VECTORS;
pub use tlp::{AtsInvRequest, CompletionBeat, PasidTag, PhyBeat, RequestBeat};
