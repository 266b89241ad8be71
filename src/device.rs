//! Device capability description
//!
//! A `DeviceCapability` is what the tiling selector knows about the target
//! GPU. It can come from a live Vulkan device (`vulkan::VulkanDevice`), from a
//! vendor preset, or from a JSON profile on disk.
//!
//! Vendor-specific heuristic constants live in static tables keyed by
//! `GpuVendor`; nothing here is mutable global state.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ConvError, Result};
use crate::shape::Dim3;
use crate::tiling::WeightsUploadType;

/// GPU family, as far as tuning is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    PowerVr,
    Adreno,
    Mali,
    Amd,
    Intel,
    Apple,
    Unknown,
}

impl GpuVendor {
    pub const ALL: [GpuVendor; 8] = [
        GpuVendor::Nvidia,
        GpuVendor::PowerVr,
        GpuVendor::Adreno,
        GpuVendor::Mali,
        GpuVendor::Amd,
        GpuVendor::Intel,
        GpuVendor::Apple,
        GpuVendor::Unknown,
    ];

    /// Map a PCI vendor ID (as reported by `VkPhysicalDeviceProperties`).
    pub fn from_pci_id(vendor_id: u32) -> Self {
        match vendor_id {
            0x10DE => GpuVendor::Nvidia,
            0x1010 => GpuVendor::PowerVr,
            0x5143 => GpuVendor::Adreno,
            0x13B5 => GpuVendor::Mali,
            0x1002 | 0x1022 => GpuVendor::Amd,
            0x8086 => GpuVendor::Intel,
            0x106B => GpuVendor::Apple,
            _ => GpuVendor::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GpuVendor::Nvidia => "nvidia",
            GpuVendor::PowerVr => "powervr",
            GpuVendor::Adreno => "adreno",
            GpuVendor::Mali => "mali",
            GpuVendor::Amd => "amd",
            GpuVendor::Intel => "intel",
            GpuVendor::Apple => "apple",
            GpuVendor::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for GpuVendor {
    type Err = ConvError;

    fn from_str(s: &str) -> Result<Self> {
        GpuVendor::ALL
            .iter()
            .copied()
            .find(|v| v.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConvError::InvalidProfile(format!("unknown vendor '{}'", s)))
    }
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable description of the target device's compute limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub vendor: GpuVendor,
    /// Human-readable device name, informational only.
    #[serde(default)]
    pub name: String,
    /// Per-axis work-group limit.
    pub max_work_group_size: Dim3,
    /// Limit on `x * y * z` of a work-group.
    pub max_work_group_invocations: u32,
    /// Fixed subgroup width, if the device reports one.
    #[serde(default)]
    pub subgroup_size: Option<u32>,
    /// Cooperative asynchronous copy of global memory into local memory.
    #[serde(default)]
    pub supports_async_subgroup_copy: bool,
    pub supports_local_memory: bool,
    pub max_local_memory_bytes: u32,
    /// Preferred number of 32-bit lanes per vector load.
    pub preferred_vector_width: u32,
}

impl DeviceCapability {
    /// Typical limits for a vendor's current desktop/mobile parts.
    pub fn preset(vendor: GpuVendor) -> Self {
        let (max_wg, invocations, subgroup, async_copy, local_mem) = match vendor {
            GpuVendor::Nvidia => (Dim3::new(1024, 1024, 64), 1024, Some(32), false, 49152),
            GpuVendor::PowerVr => (Dim3::new(512, 512, 512), 512, Some(32), true, 16384),
            GpuVendor::Adreno => (Dim3::new(1024, 1024, 1024), 1024, Some(64), false, 32768),
            GpuVendor::Mali => (Dim3::new(384, 384, 384), 384, Some(16), false, 32768),
            GpuVendor::Amd => (Dim3::new(1024, 1024, 1024), 1024, Some(64), false, 65536),
            GpuVendor::Intel => (Dim3::new(512, 512, 512), 512, Some(16), false, 65536),
            GpuVendor::Apple => (Dim3::new(1024, 1024, 1024), 1024, Some(32), false, 32768),
            GpuVendor::Unknown => (Dim3::new(256, 256, 64), 256, None, false, 16384),
        };

        Self {
            vendor,
            name: format!("{} (preset)", vendor),
            max_work_group_size: max_wg,
            max_work_group_invocations: invocations,
            subgroup_size: subgroup,
            supports_async_subgroup_copy: async_copy,
            supports_local_memory: local_mem > 0,
            max_local_memory_bytes: local_mem,
            preferred_vector_width: 4,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let capability: DeviceCapability = serde_json::from_str(json)?;
        capability.validate()?;
        Ok(capability)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a JSON profile from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConvError::InvalidProfile(format!("failed to read {}: {}", path.display(), e))
        })?;
        log::debug!("Loaded device profile from {}", path.display());
        Self::from_json(&text)
    }

    /// Reject profiles no work-group could ever fit.
    pub fn validate(&self) -> Result<()> {
        if self.max_work_group_size.min_component() == 0 || self.max_work_group_invocations == 0 {
            return Err(ConvError::unsupported(format!(
                "device '{}' reports an empty work-group limit ({} / {} invocations)",
                self.name, self.max_work_group_size, self.max_work_group_invocations
            )));
        }
        if self.preferred_vector_width == 0 {
            return Err(ConvError::InvalidProfile(
                "preferred_vector_width must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// True if `wg` fits both the per-axis and total limits.
    pub fn fits_work_group(&self, wg: Dim3) -> bool {
        wg.x <= self.max_work_group_size.x
            && wg.y <= self.max_work_group_size.y
            && wg.z <= self.max_work_group_size.z
            && wg.product() <= self.max_work_group_invocations
    }
}

/// Heuristic starting point for one vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorTuning {
    pub block_size: Dim3,
    pub work_group_size: Dim3,
    pub work_group_launch_order: Dim3,
    /// Largest output-slice block worth the register pressure.
    pub max_block_z: u32,
    /// Upper bound on `block.x * block.y * block.z` per invocation.
    pub register_budget: u32,
    /// Unroll the input-slice loop when the slice count allows it.
    pub unroll_src_depth: bool,
    pub upload_preference: WeightsUploadType,
}

static NVIDIA_TUNING: VendorTuning = VendorTuning {
    block_size: Dim3::new(1, 1, 4),
    work_group_size: Dim3::new(8, 4, 1),
    work_group_launch_order: Dim3::new(2, 0, 1),
    max_block_z: 4,
    register_budget: 8,
    unroll_src_depth: true,
    upload_preference: WeightsUploadType::ThreadCooperativeCopy,
};

static POWERVR_TUNING: VendorTuning = VendorTuning {
    block_size: Dim3::new(1, 1, 4),
    work_group_size: Dim3::new(8, 4, 1),
    work_group_launch_order: Dim3::new(2, 0, 1),
    max_block_z: 8,
    register_budget: 8,
    unroll_src_depth: false,
    upload_preference: WeightsUploadType::AsyncSubgroupCopy,
};

static ADRENO_TUNING: VendorTuning = VendorTuning {
    block_size: Dim3::new(2, 2, 1),
    work_group_size: Dim3::new(8, 2, 1),
    work_group_launch_order: Dim3::new(0, 1, 2),
    max_block_z: 2,
    register_budget: 8,
    unroll_src_depth: false,
    upload_preference: WeightsUploadType::DirectGlobalRead,
};

static MALI_TUNING: VendorTuning = VendorTuning {
    block_size: Dim3::new(1, 1, 4),
    work_group_size: Dim3::new(8, 4, 1),
    work_group_launch_order: Dim3::new(0, 1, 2),
    max_block_z: 4,
    register_budget: 8,
    unroll_src_depth: true,
    upload_preference: WeightsUploadType::DirectGlobalRead,
};

static GENERIC_TUNING: VendorTuning = VendorTuning {
    block_size: Dim3::new(1, 1, 4),
    work_group_size: Dim3::new(8, 2, 1),
    work_group_launch_order: Dim3::new(0, 1, 2),
    max_block_z: 4,
    register_budget: 8,
    unroll_src_depth: true,
    upload_preference: WeightsUploadType::DirectGlobalRead,
};

/// Static tuning entry for a vendor.
pub fn tuning_for(vendor: GpuVendor) -> &'static VendorTuning {
    match vendor {
        GpuVendor::Nvidia => &NVIDIA_TUNING,
        GpuVendor::PowerVr => &POWERVR_TUNING,
        GpuVendor::Adreno => &ADRENO_TUNING,
        GpuVendor::Mali => &MALI_TUNING,
        GpuVendor::Amd | GpuVendor::Intel | GpuVendor::Apple | GpuVendor::Unknown => {
            &GENERIC_TUNING
        }
    }
}
