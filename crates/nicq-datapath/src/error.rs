//! Error types for the data path

use thiserror::Error;

/// Data path error type
#[derive(Error, Debug)]
pub enum DatapathError {
    /// Hardware-visible memory could not be allocated
    #[error("DMA allocation failed: {0}")]
    DmaAllocation(String),

    /// A DMA sync reported a fault
    #[error("DMA sync fault on {0}")]
    DmaSyncFault(&'static str),

    /// Hardware control command failed
    #[error("hardware command {op} failed: {reason}")]
    HardwareCommand {
        /// Command name
        op: &'static str,
        /// Failure detail reported by the device
        reason: String,
    },

    /// Doorbell write kept faulting past the retry bound
    #[error("doorbell write failed after {attempts} attempts")]
    DoorbellFault {
        /// Attempts made
        attempts: u32,
    },

    /// Not enough ring slots for the request
    #[error("work queue full: need {needed} slots, {available} available")]
    RingFull {
        /// Slots the request needs
        needed: usize,
        /// Slots currently available
        available: usize,
    },

    /// Object asked to move to a state its transition table forbids
    #[error("invalid {object} transition: {from} -> {to}")]
    InvalidTransition {
        /// Object kind
        object: &'static str,
        /// Current state
        from: &'static str,
        /// Requested state
        to: &'static str,
    },

    /// Buffer shard is not accepting takes
    #[error("buffer shard not ready")]
    ShardNotReady,

    /// No free buffers available
    #[error("no free buffers")]
    NoBuffers,

    /// No event queue can serve the requested ring type
    #[error("no event queue available for {0} rings")]
    NoEventQueue(&'static str),

    /// Flow table has no free entries in the target group
    #[error("flow table full")]
    FlowTableFull,

    /// Flow entry lookup failed
    #[error("unknown flow entry: {0}")]
    UnknownFlowEntry(String),

    /// Ring group index outside the port
    #[error("no {0} ring group {1}")]
    NoSuchGroup(&'static str, usize),

    /// Ring index outside the group
    #[error("no ring {0} in group")]
    NoSuchRing(usize),

    /// Object is being torn down
    #[error("object is being torn down")]
    Teardown,

    /// Work queue is not accepting descriptors
    #[error("work queue {0} is not started")]
    NotStarted(u32),

    /// Malformed descriptor request
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Worker thread could not be spawned
    #[error("failed to spawn worker: {0}")]
    WorkerSpawn(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatapathError {
    /// Build a hardware command failure
    pub fn hw(op: &'static str, reason: impl Into<String>) -> Self {
        Self::HardwareCommand {
            op,
            reason: reason.into(),
        }
    }
}

/// Result type for the data path
pub type DatapathResult<T> = Result<T, DatapathError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DatapathError::RingFull { needed: 3, available: 1 };
        assert_eq!(err.to_string(), "work queue full: need 3 slots, 1 available");

        let err = DatapathError::hw("CREATE_CQ", "bad param");
        assert_eq!(err.to_string(), "hardware command CREATE_CQ failed: bad param");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: DatapathError = io.into();
        assert!(matches!(err, DatapathError::Io(_)));
    }
}
