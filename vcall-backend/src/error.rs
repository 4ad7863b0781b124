/// Failures reported by the IR backend or AD engine while servicing a
/// dispatcher request.
///
/// This is deliberately small: most of the dispatcher's own error taxonomy
/// is raised by the dispatcher itself after inspecting backend
/// results, not by the backend. What the backend can fail at is the
/// handful of things no amount of caller-side validation can rule out in
/// advance — running out of device/host memory, or a registry entry
/// disappearing between two lookups.
#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// `IrBackend::malloc` could not satisfy the request.
    #[cfg_attr(feature = "std", error("allocation of {bytes} bytes failed"))]
    OutOfMemory {
        /// The requested allocation size, in bytes.
        bytes: usize,
    },
    /// `IrBackend::registry_ptr` or `registry_id_bound` failed for a
    /// domain name the caller expected to be registered.
    #[cfg_attr(feature = "std", error("no registry bound for domain {domain:?}"))]
    UnknownDomain {
        /// The domain name that failed to resolve.
        domain: &'static str,
    },
}

#[cfg(not(feature = "std"))]
impl core::fmt::Display for BackendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory { bytes } => write!(f, "allocation of {bytes} bytes failed"),
            Self::UnknownDomain { domain } => write!(f, "no registry bound for domain {domain:?}"),
        }
    }
}
