//! Single-entry Address Translation Cache.
//!
//! The exerciser caches at most one ATS translation result. The ATS engine
//! stores into it on a successful translation, the DMA engine looks it up
//! when `use_atc` is set, and the invalidation handler clears it.

use bitflags::bitflags;

bitflags! {
    /// Permission bits as exposed through `ATS_PERM`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AtsPermissions: u8 {
        const EXEC = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
        const EXEC_PRIV = 1 << 3;
        const WRITE_PRIV = 1 << 4;
        const READ_PRIV = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtcEntry {
    /// Untranslated base, aligned to `range_size`.
    pub input_addr: u64,
    /// Translated base.
    pub output_addr: u64,
    /// Power-of-two range size in bytes.
    pub range_size: u32,
    pub permissions: AtsPermissions,
    pub pasid_valid: bool,
    pub pasid_val: u32,
}

impl AtcEntry {
    fn input_end(&self) -> u64 {
        self.input_addr + u64::from(self.range_size) - 1
    }

    fn pasid_matches(&self, pasid_valid: bool, pasid_val: u32) -> bool {
        (!self.pasid_valid && !pasid_valid)
            || (self.pasid_valid && pasid_valid && self.pasid_val == pasid_val)
    }
}

/// A successful lookup: the translated address plus the cached permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtcLookup {
    pub output_addr: u64,
    pub permissions: AtsPermissions,
}

#[derive(Debug, Clone, Default)]
pub struct Atc {
    entry: Option<AtcEntry>,
}

impl Atc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valid(&self) -> bool {
        self.entry.is_some()
    }

    pub fn entry(&self) -> Option<&AtcEntry> {
        self.entry.as_ref()
    }

    pub fn store(&mut self, entry: AtcEntry) {
        self.entry = Some(entry);
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    /// Translate `addr` if it falls inside the cached range and the PASID
    /// context matches.
    pub fn lookup(&self, addr: u64, pasid_valid: bool, pasid_val: u32) -> Option<AtcLookup> {
        let entry = self.entry.as_ref()?;
        if addr < entry.input_addr || addr > entry.input_end() {
            return None;
        }
        if !entry.pasid_matches(pasid_valid, pasid_val) {
            return None;
        }
        Some(AtcLookup {
            output_addr: entry.output_addr + (addr - entry.input_addr),
            permissions: entry.permissions,
        })
    }

    /// Overlap test for an invalidation range `[addr, addr + size)`.
    ///
    /// A global invalidation matches regardless of PASID; otherwise the usual
    /// both-absent-or-equal PASID rule applies.
    pub fn overlaps(
        &self,
        addr: u64,
        size: u64,
        global: bool,
        pasid_valid: bool,
        pasid_val: u32,
    ) -> bool {
        let Some(entry) = self.entry.as_ref() else {
            return false;
        };
        if size == 0 {
            return false;
        }
        let inv_end = addr + size - 1;
        let ranges_overlap = entry.input_addr <= inv_end && addr <= entry.input_end();
        ranges_overlap && (global || entry.pasid_matches(pasid_valid, pasid_val))
    }
}
