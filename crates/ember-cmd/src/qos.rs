//! # Quality of Service
//!
//! Per-context QoS requests and the static priority bands they map to.
//!
//! ```text
//!   priority   0x000 ─ 0x17f   0x180 ─ 0x1ff   0x200 ─ 0x27f   0x280 ─ ...
//!   band         Realtime          High           Normal           Low
//! ```
//!
//! Values below `0x100` clamp into the realtime band and values past
//! `0x280` into the low band. Nothing is ever rejected for its priority.

use core::fmt;

// =============================================================================
// QOS DESCRIPTOR
// =============================================================================

/// QoS requested at context creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosInfo {
    /// Giga operations per second
    pub gops: u32,
    /// Frames per second
    pub fps: u32,
    /// DMA bandwidth
    pub dma_bandwidth: u32,
    /// Latency target
    pub latency: u32,
    /// Frame execution time
    pub frame_exec_time: u32,
    /// Raw priority value
    pub priority: u32,
}

impl QosInfo {
    /// Descriptor asking only for a priority
    pub const fn with_priority(priority: u32) -> Self {
        Self {
            gops: 0,
            fps: 0,
            dma_bandwidth: 0,
            latency: 0,
            frame_exec_time: 0,
            priority,
        }
    }

    /// Band the context's commands are queued in
    pub const fn band(&self) -> PriorityBand {
        PriorityBand::from_priority(self.priority)
    }
}

// =============================================================================
// PRIORITY BAND
// =============================================================================

/// Static-priority run queue band
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PriorityBand {
    /// Highest priority
    Realtime = 0,
    /// Above normal
    High     = 1,
    /// Default
    Normal   = 2,
    /// Background
    Low      = 3,
}

impl PriorityBand {
    /// Number of bands
    pub const COUNT: usize = 4;

    /// Bands from highest to lowest
    pub const ALL: [Self; Self::COUNT] = [Self::Realtime, Self::High, Self::Normal, Self::Low];

    /// Map a raw priority value to its band
    pub const fn from_priority(priority: u32) -> Self {
        if priority < Self::High.base() {
            Self::Realtime
        } else if priority < Self::Normal.base() {
            Self::High
        } else if priority < Self::Low.base() {
            Self::Normal
        } else {
            Self::Low
        }
    }

    /// Canonical priority value of the band
    pub const fn base(self) -> u32 {
        match self {
            Self::Realtime => 0x100,
            Self::High => 0x180,
            Self::Normal => 0x200,
            Self::Low => 0x280,
        }
    }

    /// Run queue index, 0 is served first
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether this band is served strictly before `other`
    pub fn outranks(self, other: Self) -> bool {
        self < other
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Realtime => "realtime",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_boundaries() {
        assert_eq!(PriorityBand::from_priority(0x100), PriorityBand::Realtime);
        assert_eq!(PriorityBand::from_priority(0x17f), PriorityBand::Realtime);
        assert_eq!(PriorityBand::from_priority(0x180), PriorityBand::High);
        assert_eq!(PriorityBand::from_priority(0x200), PriorityBand::Normal);
        assert_eq!(PriorityBand::from_priority(0x27f), PriorityBand::Normal);
        assert_eq!(PriorityBand::from_priority(0x280), PriorityBand::Low);
    }

    #[test]
    fn test_out_of_range_values_clamp() {
        assert_eq!(PriorityBand::from_priority(0), PriorityBand::Realtime);
        assert_eq!(PriorityBand::from_priority(u32::MAX), PriorityBand::Low);
    }

    #[test]
    fn test_ordering() {
        assert!(PriorityBand::Realtime.outranks(PriorityBand::High));
        assert!(!PriorityBand::Low.outranks(PriorityBand::Normal));
        assert_eq!(QosInfo::with_priority(0x200).band(), PriorityBand::Normal);
    }
}
