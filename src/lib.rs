//! HLX convolution configurator
//!
//! Chooses a tiling for a 2-D convolution (or a fully-connected layer run as
//! a 1x1 convolution) on a given GPU, repacks weights into the blocked layout
//! the kernels read, and binds arguments and dispatch grids consistent with
//! that tiling.
//!
//! ```text
//! configure -> [tune] -> compile -> upload_weights -> dispatch ...
//! ```
//!
//! Devices are reached through the traits in [`kernel`]. Two backends ship
//! with the crate: [`host`] (in-memory, records dispatches) and [`vulkan`].

pub mod binding;
pub mod conv;
pub mod device;
pub mod error;
pub mod host;
pub mod kernel;
pub mod packing;
pub mod shape;
pub mod tiling;
pub mod vulkan;

#[cfg(feature = "python")]
pub mod python;

pub use binding::{
    bind_arguments, compute_dispatch_grid, BoundArguments, DispatchGeometry, DispatchIo, TensorRef,
};
pub use conv::{ConvOperation, ConvPlan, ConvState, OperationDef};
pub use device::{tuning_for, DeviceCapability, GpuVendor, VendorTuning};
pub use error::{ConvError, Result};
pub use kernel::{
    CompilerOption, ComputeContext, ComputeQueue, CreationContext, DefinesGenerator, KernelCache,
    KernelCode, KernelSource, KernelSourceGenerator, SpirvGenerator, WorkGroupBenchmark,
};
pub use packing::{
    pack_bias, pack_weights, unpack_weights, CalculationsPrecision, PackedBias, PackedLayout,
    PackedWeights, Precision,
};
pub use shape::{
    BiasTensor, Bhwc, Conv2dAttributes, ConvKind, Dim3, FullyConnectedAttributes, Hw, Int4, Ohwi,
    Padding, ProblemShape, WeightsTensor,
};
pub use tiling::{select_config, work_group_candidates, TilingConfig, WeightsUploadType};
