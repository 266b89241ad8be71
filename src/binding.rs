//! Resource binder
//!
//! Turns a compiled configuration plus live buffers into the argument list
//! and dispatch grid of one convolution dispatch.

use serde::{Deserialize, Serialize};

use crate::error::{ConvError, Result};
use crate::shape::{divide_round_up, Bhwc, Dim3, Int4, ProblemShape};
use crate::tiling::TilingConfig;

/// A device buffer together with the activation shape it holds.
#[derive(Debug)]
pub struct TensorRef<'a, B> {
    pub buffer: &'a B,
    pub shape: Bhwc,
}

impl<'a, B> TensorRef<'a, B> {
    pub fn new(buffer: &'a B, shape: Bhwc) -> Self {
        Self { buffer, shape }
    }
}

impl<B> Clone for TensorRef<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for TensorRef<'_, B> {}

/// Source and destination activations for one dispatch.
#[derive(Debug)]
pub struct DispatchIo<'a, B> {
    pub src: TensorRef<'a, B>,
    pub dst: TensorRef<'a, B>,
}

/// Arguments in binding order: weights, biases, src, dst, then scalars.
#[derive(Debug)]
pub struct BoundArguments<'a, B> {
    pub weights: &'a B,
    pub biases: &'a B,
    pub src: &'a B,
    pub dst: &'a B,
    pub scalars: Vec<Int4>,
}

impl<B> BoundArguments<'_, B> {
    /// Scalars as consecutive little-endian i32x4, ready for push constants.
    pub fn push_constant_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.scalars)
    }

    pub fn buffers(&self) -> [&B; 4] {
        [self.weights, self.biases, self.src, self.dst]
    }
}

/// Build the argument list for one dispatch.
///
/// `stride_padding` and `kernel_dilation` are appended only when the kernel
/// is not 1x1 on both axes; the 1x1 kernels never read them.
pub fn bind_arguments<'a, B>(
    weights: &'a B,
    biases: &'a B,
    src: TensorRef<'a, B>,
    dst: TensorRef<'a, B>,
    shape: &ProblemShape,
    config: &TilingConfig,
) -> Result<BoundArguments<'a, B>> {
    src.shape.validate()?;
    dst.shape.validate()?;
    if src.shape.b != dst.shape.b {
        return Err(ConvError::shape(format!(
            "src batch {} does not match dst batch {}",
            src.shape.b, dst.shape.b
        )));
    }
    if src.shape.c != shape.input_channels {
        return Err(ConvError::shape(format!(
            "src has {} channels, weights expect {}",
            src.shape.c, shape.input_channels
        )));
    }
    if dst.shape.c != shape.output_channels {
        return Err(ConvError::shape(format!(
            "dst has {} channels, weights produce {}",
            dst.shape.c, shape.output_channels
        )));
    }

    let mut scalars = vec![src.shape.w_batched_hsb(), dst.shape.w_batched_hsb()];
    if !config.is_1x1() {
        shape.validate()?;
        let batch = src.shape.b;
        scalars.push(Int4::new(
            shape.strides.w as i32,
            shape.strides.h as i32,
            -batched("padding", shape.padding.prepended.w, batch)?,
            -(shape.padding.prepended.h as i32),
        ));
        scalars.push(Int4::new(
            shape.kernel.w as i32,
            shape.kernel.h as i32,
            batched("dilation", shape.dilations.w, batch)?,
            shape.dilations.h as i32,
        ));
    }

    log::trace!("Bound {} scalar vectors: {:?}", scalars.len(), scalars);

    Ok(BoundArguments {
        weights,
        biases,
        src: src.buffer,
        dst: dst.buffer,
        scalars,
    })
}

/// `value * batch` as a kernel scalar.
fn batched(name: &str, value: u32, batch: u32) -> Result<i32> {
    i32::try_from(value as u64 * batch as u64).map_err(|_| {
        ConvError::shape(format!(
            "{} {} scaled by batch {} does not fit a 32-bit scalar",
            name, value, batch
        ))
    })
}

/// Grid and work-group layout of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchGeometry {
    /// Global size per dispatch slot, in invocations.
    pub grid: Dim3,
    pub work_group_size: Dim3,
    /// Work-group counts per dispatch slot (already in launch order).
    pub work_group_count: Dim3,
    /// Work-group counts per logical axis (x, y, z of the output).
    pub logical_work_groups: Dim3,
}

impl DispatchGeometry {
    /// Output elements covered per logical axis: `wg[a] * wgsize[a] * block[a]`.
    pub fn logical_coverage(&self, config: &TilingConfig) -> Dim3 {
        let mut coverage = Dim3::new(0, 0, 0);
        for axis in 0..3 {
            coverage[axis] = self.logical_work_groups[axis]
                * config.work_group_size[axis]
                * config.block_size[axis];
        }
        coverage
    }
}

/// Dispatch grid for writing `output` with `config`.
pub fn compute_dispatch_grid(output: &Bhwc, config: &TilingConfig) -> Result<DispatchGeometry> {
    output.validate()?;
    let block = config.block_size;
    let wg_size = config.work_group_size;
    let order = config.work_group_launch_order;

    let threads = Dim3::new(
        divide_round_up(output.w * output.b, block.x),
        divide_round_up(output.h, block.y),
        divide_round_up(output.slices(), block.z),
    );

    let mut logical = Dim3::new(0, 0, 0);
    for axis in 0..3 {
        logical[axis] = divide_round_up(threads[axis], wg_size[axis]);
    }

    let mut grid = Dim3::new(0, 0, 0);
    let mut count = Dim3::new(0, 0, 0);
    for slot in 0..3 {
        let axis = order[slot] as usize;
        count[slot] = logical[axis];
        grid[slot] = logical[axis] * wg_size[slot];
    }

    Ok(DispatchGeometry {
        grid,
        work_group_size: wg_size,
        work_group_count: count,
        logical_work_groups: logical,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{Conv2dAttributes, Hw, Ohwi, Padding};
    use crate::tiling::WeightsUploadType;
    use pretty_assertions::assert_eq;

    fn config(block: Dim3, wg: Dim3, order: Dim3, unit: bool) -> TilingConfig {
        TilingConfig {
            block_size: block,
            work_group_size: wg,
            work_group_launch_order: order,
            src_depth_loop_size: 1,
            weights_upload_type: WeightsUploadType::DirectGlobalRead,
            x_kernel_is_1: unit,
            y_kernel_is_1: unit,
        }
    }

    #[test]
    fn test_grid_in_launch_order() {
        let cfg = config(Dim3::new(1, 1, 4), Dim3::new(8, 4, 1), Dim3::new(2, 0, 1), false);
        let out = Bhwc::new(1, 10, 17, 32);
        let geo = compute_dispatch_grid(&out, &cfg).unwrap();

        // threads (17, 10, 2) -> work-groups (3, 3, 2)
        assert_eq!(geo.logical_work_groups, Dim3::new(3, 3, 2));
        assert_eq!(geo.work_group_count, Dim3::new(2, 3, 3));
        assert_eq!(geo.grid, Dim3::new(2 * 8, 3 * 4, 3));
    }

    #[test]
    fn test_batch_folds_into_width() {
        let cfg = config(Dim3::new(2, 1, 1), Dim3::new(4, 1, 1), Dim3::new(0, 1, 2), true);
        let geo = compute_dispatch_grid(&Bhwc::new(3, 1, 5, 4), &cfg).unwrap();
        // 15 columns / block 2 = 8 threads / wg 4 = 2
        assert_eq!(geo.logical_work_groups, Dim3::new(2, 1, 1));
        assert!(geo.logical_coverage(&cfg).x >= 15);
    }

    #[test]
    fn test_oversized_output_is_rejected() {
        let cfg = config(Dim3::new(1, 1, 1), Dim3::new(8, 4, 1), Dim3::new(0, 1, 2), false);
        // 70000 * 70000 columns overflow a 32-bit index.
        let err = compute_dispatch_grid(&Bhwc::new(70000, 1, 70000, 8), &cfg).unwrap_err();
        assert!(matches!(err, ConvError::InvalidShape(_)), "{}", err);

        let widest = Bhwc::new(1, 1, i32::MAX as u32, 4);
        assert!(compute_dispatch_grid(&widest, &cfg).is_ok());
    }

    #[test]
    fn test_unit_kernel_binds_two_scalars() {
        let attr = Conv2dAttributes::simple(Ohwi::new(8, 1, 1, 4));
        let shape = ProblemShape::from_conv2d(&attr);
        let cfg = config(Dim3::new(1, 1, 1), Dim3::new(8, 4, 1), Dim3::new(0, 1, 2), true);
        let buffers = [0u8; 4];
        let args = bind_arguments(
            &buffers[0],
            &buffers[1],
            TensorRef::new(&buffers[2], Bhwc::new(2, 4, 4, 4)),
            TensorRef::new(&buffers[3], Bhwc::new(2, 4, 4, 8)),
            &shape,
            &cfg,
        )
        .unwrap();
        assert_eq!(
            args.scalars,
            vec![Int4::new(8, 4, 1, 2), Int4::new(8, 4, 2, 2)]
        );
        assert_eq!(args.push_constant_bytes().len(), 32);
    }

    #[test]
    fn test_spatial_scalars_scale_by_batch() {
        let attr = Conv2dAttributes {
            weights: Ohwi::new(4, 3, 3, 4),
            strides: Hw::new(2, 2),
            dilations: Hw::new(1, 2),
            padding: Padding::symmetric(1, 1),
        };
        let shape = ProblemShape::from_conv2d(&attr);
        let cfg = config(Dim3::new(1, 1, 1), Dim3::new(8, 4, 1), Dim3::new(0, 1, 2), false);
        let buffers = [0u8; 4];
        let args = bind_arguments(
            &buffers[0],
            &buffers[1],
            TensorRef::new(&buffers[2], Bhwc::new(2, 8, 8, 4)),
            TensorRef::new(&buffers[3], Bhwc::new(2, 4, 4, 4)),
            &shape,
            &cfg,
        )
        .unwrap();
        assert_eq!(args.scalars.len(), 4);
        assert_eq!(args.scalars[2], Int4::new(2, 2, -2, -1));
        assert_eq!(args.scalars[3], Int4::new(3, 3, 4, 1));

        let bytes = args.push_constant_bytes();
        assert_eq!(&bytes[32..36], &2i32.to_le_bytes());
        assert_eq!(&bytes[40..44], &(-2i32).to_le_bytes());
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let shape = ProblemShape::from_conv2d(&Conv2dAttributes::simple(Ohwi::new(8, 1, 1, 4)));
        let cfg = config(Dim3::new(1, 1, 1), Dim3::new(8, 4, 1), Dim3::new(0, 1, 2), true);
        let buffers = [0u8; 4];
        let err = bind_arguments(
            &buffers[0],
            &buffers[1],
            TensorRef::new(&buffers[2], Bhwc::new(1, 4, 4, 5)),
            TensorRef::new(&buffers[3], Bhwc::new(1, 4, 4, 8)),
            &shape,
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, ConvError::InvalidShape(_)));
    }
}
