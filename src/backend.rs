use std::str::FromStr;

use crate::error::{CaptureError, CaptureResult};
use crate::frame::RawFrame;
use crate::surface::SurfaceId;

/// Graphics API whose swap chains are hooked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GraphicsApi {
    /// Implicit synchronization: mapping a staging texture waits for the copy.
    #[default]
    D3D11,
    /// Explicit synchronization: command list + fence.
    D3D12,
}

impl GraphicsApi {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::D3D11 => "d3d11",
            Self::D3D12 => "d3d12",
        }
    }
}

impl FromStr for GraphicsApi {
    type Err = CaptureError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "11" | "d3d11" | "dx11" => Ok(Self::D3D11),
            "12" | "d3d12" | "dx12" => Ok(Self::D3D12),
            other => Err(CaptureError::InvalidConfig(format!(
                "unsupported graphics API {other:?}; expected 11 or 12"
            ))),
        }
    }
}

const IUNKNOWN_METHODS: usize = 3;
const IDXGIOBJECT_METHODS: usize = 4;
const IDXGIDEVICESUBOBJECT_METHODS: usize = 1;

/// Index of `IDXGISwapChain::Present` in the swap chain dispatch table:
/// it is the first method declared after the inherited ones.
pub const PRESENT_VTABLE_SLOT: usize =
    IUNKNOWN_METHODS + IDXGIOBJECT_METHODS + IDXGIDEVICESUBOBJECT_METHODS;

/// The shared `Present` implementation found through a throwaway swap chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedPresent {
    pub address: usize,
    /// Byte offset of the command queue pointer inside a D3D12 swap chain
    /// object. `None` for D3D11.
    pub command_queue_offset: Option<usize>,
}

/// Back-end specific GPU to CPU readback of a presented frame.
pub trait CapturePipeline: Send {
    /// The object handed to the intercepted present call.
    type Source: ?Sized;

    /// Identity of the surface `source` presents into, or `None` when it
    /// cannot be determined.
    fn surface_id(&self, source: &Self::Source) -> Option<SurfaceId>;

    /// Read the frame about to be presented. Runs on the presenting thread
    /// and blocks until the pixels are in CPU memory.
    fn capture_frame(&mut self, source: &Self::Source) -> CaptureResult<RawFrame>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterPreference {
    /// Discrete, high-performance GPU.
    HighPerformance,
    /// Any adapter that is not a software rasterizer.
    Hardware,
    /// WARP / reference rasterizer.
    Software,
}

impl AdapterPreference {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HighPerformance => "high-performance",
            Self::Hardware => "hardware",
            Self::Software => "software",
        }
    }
}

pub const DEFAULT_ADAPTER_PRIORITY: [AdapterPreference; 3] = [
    AdapterPreference::HighPerformance,
    AdapterPreference::Hardware,
    AdapterPreference::Software,
];

#[derive(Clone, Debug)]
pub struct AdapterPolicy {
    pub priority: Vec<AdapterPreference>,
}

impl AdapterPolicy {
    /// Start with the software rasterizer, then fall back to hardware.
    pub fn software_first() -> Self {
        Self {
            priority: vec![
                AdapterPreference::Software,
                AdapterPreference::HighPerformance,
                AdapterPreference::Hardware,
            ],
        }
    }

    pub fn normalized_priority(&self) -> Vec<AdapterPreference> {
        let mut normalized = Vec::new();
        for preference in &self.priority {
            if !normalized.contains(preference) {
                normalized.push(*preference);
            }
        }
        if normalized.is_empty() {
            normalized.extend(DEFAULT_ADAPTER_PRIORITY);
        }
        normalized
    }

    /// Normalized priority with `PRESENT_HOOK_FORCE_WARP` applied.
    pub(crate) fn effective_priority(&self) -> Vec<AdapterPreference> {
        let priority = self.normalized_priority();
        if crate::env_config::force_warp() {
            software_to_front(priority)
        } else {
            priority
        }
    }
}

fn software_to_front(mut priority: Vec<AdapterPreference>) -> Vec<AdapterPreference> {
    priority.retain(|preference| *preference != AdapterPreference::Software);
    priority.insert(0, AdapterPreference::Software);
    priority
}

impl Default for AdapterPolicy {
    fn default() -> Self {
        Self {
            priority: DEFAULT_ADAPTER_PRIORITY.to_vec(),
        }
    }
}

/// One adapter a device may be created on.
///
/// `key` identifies the physical adapter (LUID or driver type) so the same
/// adapter reached through two enumerations is only tried once.
#[derive(Clone, Debug)]
pub struct AdapterCandidate<A> {
    pub preference: AdapterPreference,
    pub key: u64,
    pub label: String,
    pub adapter: A,
}

/// Try candidates in order and return the first one a device could be
/// created on. Fails only after every distinct candidate failed.
pub fn select_adapter<A, D, I, F>(
    candidates: I,
    mut create: F,
) -> CaptureResult<(AdapterCandidate<A>, D)>
where
    I: IntoIterator<Item = AdapterCandidate<A>>,
    F: FnMut(&AdapterCandidate<A>) -> CaptureResult<D>,
{
    let mut tried: Vec<u64> = Vec::new();
    let mut errors: Vec<(AdapterPreference, String, CaptureError)> = Vec::new();

    for candidate in candidates {
        if tried.contains(&candidate.key) {
            continue;
        }
        tried.push(candidate.key);

        match create(&candidate) {
            Ok(device) => {
                tracing::debug!(
                    preference = candidate.preference.as_str(),
                    adapter = %candidate.label,
                    "created device"
                );
                return Ok((candidate, device));
            }
            Err(err) => {
                tracing::debug!(
                    preference = candidate.preference.as_str(),
                    adapter = %candidate.label,
                    error = %err.chain_message(),
                    "device creation failed, trying next adapter"
                );
                errors.push((candidate.preference, candidate.label, err));
            }
        }
    }

    if errors.is_empty() {
        return Err(CaptureError::ResourceCreation(anyhow::anyhow!(
            "no graphics adapter is available"
        )));
    }
    Err(CaptureError::ResourceCreation(anyhow::anyhow!(
        "no adapter could create a device: {}",
        format_adapter_errors(&errors)
    )))
}

fn format_adapter_errors(errors: &[(AdapterPreference, String, CaptureError)]) -> String {
    let mut combined = String::new();
    for (index, (preference, label, error)) in errors.iter().enumerate() {
        if index != 0 {
            combined.push_str("; ");
        }
        combined.push_str(preference.as_str());
        combined.push_str(" (");
        combined.push_str(label);
        combined.push_str("): ");
        combined.push_str(&error.chain_message());
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(preference: AdapterPreference, key: u64) -> AdapterCandidate<u64> {
        AdapterCandidate {
            preference,
            key,
            label: format!("adapter-{key}"),
            adapter: key,
        }
    }

    #[test]
    fn present_is_the_ninth_dispatch_entry() {
        assert_eq!(PRESENT_VTABLE_SLOT, 8);
    }

    #[test]
    fn parses_api_selector() {
        assert_eq!("11".parse::<GraphicsApi>().unwrap(), GraphicsApi::D3D11);
        assert_eq!(" 12 ".parse::<GraphicsApi>().unwrap(), GraphicsApi::D3D12);
        assert_eq!("D3D12".parse::<GraphicsApi>().unwrap(), GraphicsApi::D3D12);
        assert!("9".parse::<GraphicsApi>().is_err());
    }

    #[test]
    fn normalized_priority_dedupes_and_defaults() {
        let policy = AdapterPolicy {
            priority: vec![
                AdapterPreference::Software,
                AdapterPreference::Software,
                AdapterPreference::Hardware,
            ],
        };
        assert_eq!(
            policy.normalized_priority(),
            vec![AdapterPreference::Software, AdapterPreference::Hardware]
        );
        let empty = AdapterPolicy { priority: vec![] };
        assert_eq!(empty.normalized_priority(), DEFAULT_ADAPTER_PRIORITY.to_vec());
    }

    #[test]
    fn forcing_warp_moves_software_first() {
        assert_eq!(
            software_to_front(DEFAULT_ADAPTER_PRIORITY.to_vec()),
            vec![
                AdapterPreference::Software,
                AdapterPreference::HighPerformance,
                AdapterPreference::Hardware,
            ]
        );
        assert_eq!(
            software_to_front(vec![AdapterPreference::Hardware]),
            vec![AdapterPreference::Software, AdapterPreference::Hardware]
        );
    }

    #[test]
    fn picks_first_successful_candidate_in_order() {
        let mut attempts = Vec::new();
        let (chosen, device) = select_adapter(
            vec![
                candidate(AdapterPreference::HighPerformance, 1),
                candidate(AdapterPreference::Hardware, 2),
                candidate(AdapterPreference::Software, 3),
            ],
            |c| {
                attempts.push(c.key);
                if c.key == 1 {
                    Err(CaptureError::ResourceCreation(anyhow::anyhow!("no d3d12")))
                } else {
                    Ok(c.key * 100)
                }
            },
        )
        .unwrap();
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(chosen.preference, AdapterPreference::Hardware);
        assert_eq!(device, 200);
    }

    #[test]
    fn never_retries_a_failed_adapter() {
        let mut attempts = Vec::new();
        let result: CaptureResult<(AdapterCandidate<u64>, ())> = select_adapter(
            vec![
                candidate(AdapterPreference::HighPerformance, 1),
                candidate(AdapterPreference::Hardware, 1),
                candidate(AdapterPreference::Software, 9),
            ],
            |c| {
                attempts.push(c.key);
                Err(CaptureError::ResourceCreation(anyhow::anyhow!("key {}", c.key)))
            },
        );
        assert_eq!(attempts, vec![1, 9]);
        let err = result.unwrap_err();
        let message = err.chain_message();
        assert!(message.contains("high-performance (adapter-1)"), "{message}");
        assert!(message.contains("software (adapter-9)"), "{message}");
    }

    #[test]
    fn empty_candidate_list_fails() {
        let result: CaptureResult<(AdapterCandidate<u64>, ())> =
            select_adapter(Vec::new(), |_| Ok(()));
        assert!(matches!(result, Err(CaptureError::ResourceCreation(_))));
    }
}
