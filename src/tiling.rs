//! Tiling selector
//!
//! Maps (device capability, problem shape, precision) to a `TilingConfig`.
//! This is a heuristic, not a search: each vendor starts from a static
//! tuning entry which is then adjusted to the channel counts and clamped to
//! the device limits. The same inputs always produce the same config.

use serde::{Deserialize, Serialize};

use crate::device::{tuning_for, DeviceCapability, GpuVendor, VendorTuning};
use crate::error::{ConvError, Result};
use crate::packing::{CalculationsPrecision, Precision};
use crate::shape::{align_by_n, divide_round_up, Dim3, Hw, ProblemShape};

/// Work-group size the async subgroup copy path is written for.
pub const ASYNC_SUBGROUP_INVOCATIONS: u32 = 32;

/// Ceiling on `src_depth_loop_size * block_size.z`, the number of weight
/// slices one unrolled loop body touches.
pub const MAX_UNROLLED_SLICES: u32 = 8;

/// Output-slice block sizes and the slice count above which each is taken
/// even when it does not divide `dst_depth`.
const BLOCK_Z_RULES: [(u32, u32); 3] = [(8, 32), (4, 8), (2, 4)];

/// How the kernel stages weights from global memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeightsUploadType {
    /// Subgroup-wide async copy into local memory, fixed 32-invocation groups.
    AsyncSubgroupCopy,
    /// All invocations of the work-group cooperatively copy into local memory.
    ThreadCooperativeCopy,
    /// No staging, weights are read straight from global memory.
    DirectGlobalRead,
}

impl WeightsUploadType {
    /// Local-memory strategies are written for one specific work-group shape.
    pub fn fixes_work_group(&self) -> bool {
        !matches!(self, WeightsUploadType::DirectGlobalRead)
    }

    pub fn uses_local_memory(&self) -> bool {
        self.fixes_work_group()
    }
}

impl std::fmt::Display for WeightsUploadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WeightsUploadType::AsyncSubgroupCopy => "async-subgroup-copy",
            WeightsUploadType::ThreadCooperativeCopy => "thread-cooperative-copy",
            WeightsUploadType::DirectGlobalRead => "direct-global-read",
        };
        f.write_str(s)
    }
}

/// Tiling and parallelization of one convolution kernel.
///
/// Axis convention for all three `Dim3` fields: x = output width (times
/// batch), y = output height, z = output channel slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilingConfig {
    pub block_size: Dim3,
    pub work_group_size: Dim3,
    /// Dispatch slot `k` takes the work-group count of logical axis `order[k]`.
    pub work_group_launch_order: Dim3,
    pub src_depth_loop_size: u32,
    pub weights_upload_type: WeightsUploadType,
    pub x_kernel_is_1: bool,
    pub y_kernel_is_1: bool,
}

impl TilingConfig {
    /// `dst_depth` rounded up to a whole number of output-slice blocks.
    pub fn aligned_dst_depth(&self, dst_depth: u32) -> u32 {
        align_by_n(dst_depth, self.block_size.z)
    }

    pub fn is_1x1(&self) -> bool {
        self.x_kernel_is_1 && self.y_kernel_is_1
    }

    /// Local memory one loop iteration stages, in bytes.
    pub fn local_memory_bytes(&self, precision: Precision) -> u32 {
        staging_bytes(self.block_size.z, self.src_depth_loop_size, precision)
    }

    /// Hard constraints every config must meet before anything is compiled.
    pub fn validate(&self, capability: &DeviceCapability) -> Result<()> {
        if self.block_size.min_component() == 0 {
            return Err(ConvError::unsupported(format!(
                "block size {} has a zero component",
                self.block_size
            )));
        }
        if self.work_group_size.min_component() == 0 {
            return Err(ConvError::unsupported(format!(
                "work-group size {} has a zero component",
                self.work_group_size
            )));
        }
        if self.src_depth_loop_size == 0 {
            return Err(ConvError::unsupported("src_depth_loop_size must be positive"));
        }
        if !self.work_group_launch_order.is_axis_permutation() {
            return Err(ConvError::unsupported(format!(
                "launch order {} is not a permutation of the dispatch axes",
                self.work_group_launch_order
            )));
        }
        if !capability.fits_work_group(self.work_group_size) {
            return Err(ConvError::unsupported(format!(
                "work-group size {} ({} invocations) exceeds device maximum {} ({} invocations)",
                self.work_group_size,
                self.work_group_size.product(),
                capability.max_work_group_size,
                capability.max_work_group_invocations
            )));
        }
        if self.weights_upload_type == WeightsUploadType::AsyncSubgroupCopy {
            if !capability.supports_async_subgroup_copy {
                return Err(ConvError::unsupported(
                    "async subgroup copy requested on a device without support",
                ));
            }
            if self.work_group_size.product() != ASYNC_SUBGROUP_INVOCATIONS {
                return Err(ConvError::unsupported(format!(
                    "async subgroup copy needs {} invocations per work-group, got {}",
                    ASYNC_SUBGROUP_INVOCATIONS,
                    self.work_group_size.product()
                )));
            }
        }
        Ok(())
    }
}

/// Pick a tiling for `shape` on `capability`.
///
/// Fails with `InvalidShape` for malformed problems and with
/// `UnsupportedCapability` when no config satisfies the device limits.
pub fn select_config(
    capability: &DeviceCapability,
    shape: &ProblemShape,
    precision: CalculationsPrecision,
) -> Result<TilingConfig> {
    capability.validate()?;
    shape.validate()?;

    let src_depth = shape.src_depth();
    let dst_depth = shape.dst_depth();
    let tuning = tuning_for(capability.vendor);
    let powervr_f16 =
        capability.vendor == GpuVendor::PowerVr && precision == CalculationsPrecision::F16;

    let mut block = tuning.block_size;
    block.z = output_block_z(dst_depth, tuning.max_block_z);
    if powervr_f16 {
        block.z = block.z.min(4);
        block.x = 2;
    }
    if shape.is_fully_connected() {
        block = fold_y_into_x(block);
    }
    clamp_block_to_budget(&mut block, tuning.register_budget);

    let src_depth_loop_size = select_src_depth_loop(src_depth, block.z, tuning, powervr_f16);

    let mut work_group = if powervr_f16 {
        Dim3::new(4, 8, 1)
    } else {
        tuning.work_group_size
    };
    if shape.is_fully_connected() {
        work_group = fold_y_into_x(work_group);
    }

    let weights_upload_type = resolve_upload_type(
        capability,
        tuning.upload_preference,
        work_group,
        staging_bytes(block.z, src_depth_loop_size, precision.storage()),
    );

    if !weights_upload_type.fixes_work_group() {
        work_group = clamp_work_group(work_group, capability);
        if let Some(hint) = shape.output_hint {
            work_group = prefer_even_split(work_group, block, hint, capability);
        }
    }

    let config = TilingConfig {
        block_size: block,
        work_group_size: work_group,
        work_group_launch_order: tuning.work_group_launch_order,
        src_depth_loop_size,
        weights_upload_type,
        x_kernel_is_1: shape.is_fully_connected() || shape.x_kernel_is_1(),
        y_kernel_is_1: shape.is_fully_connected() || shape.y_kernel_is_1(),
    };
    config.validate(capability)?;

    log::info!(
        "Selected tiling for {} (src_depth={}, dst_depth={}): block={} wg={} order={} loop={} upload={}",
        capability.vendor,
        src_depth,
        dst_depth,
        config.block_size,
        config.work_group_size,
        config.work_group_launch_order,
        config.src_depth_loop_size,
        config.weights_upload_type
    );

    Ok(config)
}

/// Work-group shapes worth benchmarking for `config`.
///
/// Returns only `config.work_group_size` when the upload strategy pins the
/// work-group. Otherwise power-of-two shapes between 8 and 256 invocations
/// that fit the device, current shape first, then by invocation count.
pub fn work_group_candidates(capability: &DeviceCapability, config: &TilingConfig) -> Vec<Dim3> {
    let mut candidates = vec![config.work_group_size];
    if config.weights_upload_type.fixes_work_group() {
        return candidates;
    }

    let limit = capability.max_work_group_invocations.min(256);
    let single_row = config.block_size.y == 1 && config.work_group_size.y == 1;
    let mut found = Vec::new();
    for x in (0..=8).map(|p| 1u32 << p) {
        for y in (0..=8).map(|p| 1u32 << p) {
            if single_row && y != 1 {
                continue;
            }
            let wg = Dim3::new(x, y, 1);
            let invocations = wg.product();
            if invocations < 8 || invocations > limit || !capability.fits_work_group(wg) {
                continue;
            }
            found.push(wg);
        }
    }
    found.sort_by_key(|wg| (wg.product(), wg.x));
    for wg in found {
        if !candidates.contains(&wg) {
            candidates.push(wg);
        }
    }
    candidates
}

fn output_block_z(dst_depth: u32, max_block_z: u32) -> u32 {
    for (z, at_least) in BLOCK_Z_RULES {
        if z <= max_block_z && (dst_depth % z == 0 || dst_depth >= at_least) {
            return z;
        }
    }
    dst_depth.min(max_block_z).max(1)
}

fn fold_y_into_x(d: Dim3) -> Dim3 {
    Dim3::new(d.x * d.y, 1, d.z)
}

/// Halve spatial components (largest first), then z, until the per-invocation
/// block fits the register budget.
fn clamp_block_to_budget(block: &mut Dim3, budget: u32) {
    while block.product() > budget.max(1) {
        if block.x >= block.y && block.x > 1 {
            block.x /= 2;
        } else if block.y > 1 {
            block.y /= 2;
        } else if block.z > 1 {
            block.z /= 2;
        } else {
            break;
        }
    }
}

fn select_src_depth_loop(
    src_depth: u32,
    block_z: u32,
    tuning: &VendorTuning,
    powervr_f16: bool,
) -> u32 {
    let mut loop_size = 1;
    if tuning.unroll_src_depth || powervr_f16 {
        if src_depth % 2 == 0 {
            loop_size = 2;
        }
        if src_depth % 4 == 0 && block_z <= 2 {
            loop_size = 4;
        }
    }
    if powervr_f16 && block_z == 1 && src_depth <= 8 {
        loop_size = src_depth;
    }

    loop_size = loop_size.min(src_depth).max(1);
    while loop_size > 1 && loop_size * block_z > MAX_UNROLLED_SLICES {
        loop_size /= 2;
    }
    loop_size
}

fn staging_bytes(block_z: u32, loop_size: u32, precision: Precision) -> u32 {
    // 4 input lanes, each a vec4 of output lanes.
    block_z * loop_size * 4 * precision.vec4_bytes() as u32
}

fn resolve_upload_type(
    capability: &DeviceCapability,
    preference: WeightsUploadType,
    work_group: Dim3,
    staging: u32,
) -> WeightsUploadType {
    let async_ok = capability.supports_async_subgroup_copy
        && capability.subgroup_size == Some(ASYNC_SUBGROUP_INVOCATIONS)
        && work_group.product() == ASYNC_SUBGROUP_INVOCATIONS
        && capability.fits_work_group(work_group);
    let threads_ok = capability.supports_local_memory
        && staging <= capability.max_local_memory_bytes
        && capability.fits_work_group(work_group);

    let chosen = match preference {
        WeightsUploadType::AsyncSubgroupCopy if async_ok => WeightsUploadType::AsyncSubgroupCopy,
        WeightsUploadType::AsyncSubgroupCopy | WeightsUploadType::ThreadCooperativeCopy
            if threads_ok =>
        {
            WeightsUploadType::ThreadCooperativeCopy
        }
        _ => WeightsUploadType::DirectGlobalRead,
    };
    if chosen != preference {
        log::debug!(
            "Weights upload fell back from {} to {} on {}",
            preference,
            chosen,
            capability.name
        );
    }
    chosen
}

/// Shrink `wg` until it fits the device, halving the largest axis first.
fn clamp_work_group(wg: Dim3, capability: &DeviceCapability) -> Dim3 {
    let max = capability.max_work_group_size;
    let mut wg = Dim3::new(wg.x.min(max.x), wg.y.min(max.y), wg.z.min(max.z));
    while wg.product() > capability.max_work_group_invocations {
        let axis = if wg.x >= wg.y && wg.x >= wg.z {
            0
        } else if wg.y >= wg.z {
            1
        } else {
            2
        };
        wg[axis] = (wg[axis] / 2).max(1);
    }
    wg
}

/// Between `wg` and its x/y transpose, keep the one that launches fewer
/// idle invocations over the hinted output. Ties keep `wg`.
fn prefer_even_split(wg: Dim3, block: Dim3, output: Hw, capability: &DeviceCapability) -> Dim3 {
    let waste = |wg: Dim3| -> u64 {
        let grid_x = divide_round_up(output.w, block.x);
        let grid_y = divide_round_up(output.h, block.y);
        let launched = align_by_n(grid_x, wg.x) as u64 * align_by_n(grid_y, wg.y) as u64;
        launched - grid_x as u64 * grid_y as u64
    };

    let transposed = Dim3::new(wg.y, wg.x, wg.z);
    if transposed != wg
        && capability.fits_work_group(transposed)
        && waste(transposed) < waste(wg)
    {
        log::debug!(
            "Transposed work-group {} -> {} for output {}x{}",
            wg,
            transposed,
            output.h,
            output.w
        );
        return transposed;
    }
    wg
}
