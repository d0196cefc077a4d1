use crate::backend::DescriptorHeapKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A native API call failed. There is no retry path: the frame loop is
    /// expected to stop.
    #[error("native call `{call}` failed: {message}")]
    Device { call: &'static str, message: String },

    /// No descriptor page could be created or grown to hold the request.
    #[error("out of {kind:?} descriptors ({requested} requested)")]
    OutOfDescriptors {
        kind: DescriptorHeapKind,
        requested: u32,
    },

    /// The request does not fit into the staging buffer even when it is
    /// empty. The caller has to split the transfer.
    #[error("staging request of {requested} bytes exceeds the {capacity} byte staging buffer")]
    StagingTooSmall { requested: u64, capacity: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    pub(crate) fn device(call: &'static str, message: impl ToString) -> Self {
        Self::Device {
            call,
            message: message.to_string(),
        }
    }

    /// Whether the error leaves the GPU timeline in an unknown state.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Device { .. })
    }
}
