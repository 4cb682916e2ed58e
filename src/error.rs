use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum CaptureError {
    /// Device, adapter, output surface, staging or readback resource
    /// creation failed.
    ResourceCreation(anyhow::Error),

    /// CPU access to GPU memory could not be established.
    Mapping(anyhow::Error),

    /// Fence signal/wait or command submission failed.
    Synchronization(anyhow::Error),

    /// A capture request is already active.
    Busy,

    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The detour could not be installed or removed.
    Patch(String),

    InvalidConfig(String),

    UnsupportedFormat(String),

    BufferOverflow,

    BackendUnavailable(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureErrorClass {
    InvalidInput,
    Unsupported,
    /// Aborts the current frame only; the next present may succeed.
    FrameScoped,
    Fatal,
}

impl CaptureError {
    pub fn class(&self) -> CaptureErrorClass {
        match self {
            Self::Busy | Self::InvalidConfig(_) => CaptureErrorClass::InvalidInput,
            Self::UnsupportedFormat(_) | Self::BackendUnavailable(_) => {
                CaptureErrorClass::Unsupported
            }
            Self::ResourceCreation(_)
            | Self::Mapping(_)
            | Self::Synchronization(_)
            | Self::Io { .. } => CaptureErrorClass::FrameScoped,
            Self::Patch(_) | Self::BufferOverflow => CaptureErrorClass::Fatal,
        }
    }

    /// Whether the failure only costs the frame being captured.
    pub fn is_frame_scoped(&self) -> bool {
        matches!(self.class(), CaptureErrorClass::FrameScoped)
    }

    /// This error followed by each of its causes, separated by `: `.
    pub fn chain_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = std::error::Error::source(cause);
        }
        message
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceCreation(_) => write!(f, "failed to create resource"),
            Self::Mapping(_) => write!(f, "failed to map GPU memory"),
            Self::Synchronization(_) => write!(f, "GPU synchronization failed"),
            Self::Busy => write!(f, "a capture request is already active"),
            Self::Io { path, .. } => write!(f, "failed to write {}", path.display()),
            Self::Patch(message) => write!(f, "failed to patch present method: {message}"),
            Self::InvalidConfig(message) => write!(f, "invalid capture configuration: {message}"),
            Self::UnsupportedFormat(fmt_name) => {
                write!(f, "unsupported back buffer format: {fmt_name}")
            }
            Self::BufferOverflow => write!(f, "frame buffer size overflow"),
            Self::BackendUnavailable(message) => {
                write!(f, "no available backend implementation: {message}")
            }
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::ResourceCreation(inner) | Self::Mapping(inner) | Self::Synchronization(inner) => {
                Some(inner.as_ref())
            }
            _ => None,
        }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;
