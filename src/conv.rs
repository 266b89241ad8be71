//! Convolution operation
//!
//! Ties the selector, packer and binder together behind a small state
//! machine:
//!
//! ```text
//! Unconfigured -> Configured -> Compiled -> WeightsUploaded -> Ready
//! ```
//!
//! A failed step never advances the state. The operation owns its weight
//! and bias buffers and shares its kernel with the kernel cache; all of them
//! are released when the operation is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::binding::{bind_arguments, compute_dispatch_grid, DispatchGeometry, DispatchIo};
use crate::device::{DeviceCapability, GpuVendor};
use crate::error::{ConvError, Result};
use crate::kernel::{
    compiler_options, CompilerOption, ComputeContext, ComputeQueue, CreationContext,
    KernelSourceGenerator, WorkGroupBenchmark,
};
use crate::packing::{pack_bias, pack_weights, CalculationsPrecision, PackedLayout, Precision};
use crate::shape::{
    BiasTensor, Bhwc, Conv2dAttributes, ConvKind, FullyConnectedAttributes, ProblemShape,
    WeightsTensor,
};
use crate::tiling::{select_config, work_group_candidates, TilingConfig};

/// Lifecycle state of a `ConvOperation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvState {
    Unconfigured,
    Configured,
    Compiled,
    WeightsUploaded,
    Ready,
}

impl fmt::Display for ConvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-operation settings that are not part of the problem shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationDef {
    pub precision: CalculationsPrecision,
    /// Kernels index the width axis as `W * B`.
    #[serde(default)]
    pub batch_support: bool,
}

impl OperationDef {
    pub fn new(precision: CalculationsPrecision) -> Self {
        Self {
            precision,
            batch_support: false,
        }
    }

    pub fn with_batch_support(mut self) -> Self {
        self.batch_support = true;
        self
    }
}

/// What a configured operation will do, without touching a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvPlan {
    pub kind: ConvKind,
    pub device: String,
    pub precision: CalculationsPrecision,
    pub storage: Precision,
    pub config: TilingConfig,
    pub src_depth: u32,
    pub dst_depth: u32,
    pub aligned_dst_depth: u32,
    pub packed_weight_bytes: usize,
    pub packed_bias_bytes: usize,
    pub local_memory_bytes: u32,
    pub compiler_options: Vec<CompilerOption>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output: Option<Bhwc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dispatch: Option<DispatchGeometry>,
}

/// A configured, compiled and uploaded convolution (or fully-connected
/// layer), ready to dispatch repeatedly.
pub struct ConvOperation<C: ComputeContext> {
    def: OperationDef,
    state: ConvState,
    shape: Option<ProblemShape>,
    capability: Option<DeviceCapability>,
    config: Option<TilingConfig>,
    kernel: Option<Arc<C::Kernel>>,
    kernel_id: Option<String>,
    weights: Option<C::Buffer>,
    biases: Option<C::Buffer>,
}

impl<C: ComputeContext> ConvOperation<C> {
    pub fn new(def: OperationDef) -> Self {
        Self {
            def,
            state: ConvState::Unconfigured,
            shape: None,
            capability: None,
            config: None,
            kernel: None,
            kernel_id: None,
            weights: None,
            biases: None,
        }
    }

    /// Configured 2-D convolution.
    pub fn conv2d(
        def: OperationDef,
        attr: &Conv2dAttributes,
        capability: &DeviceCapability,
    ) -> Result<Self> {
        let mut op = Self::new(def);
        op.configure(ProblemShape::from_conv2d(attr), capability)?;
        Ok(op)
    }

    /// Configured fully-connected layer, run as a 1x1 convolution.
    pub fn fully_connected(
        def: OperationDef,
        attr: &FullyConnectedAttributes,
        capability: &DeviceCapability,
    ) -> Result<Self> {
        let mut op = Self::new(def);
        op.configure(ProblemShape::from_fully_connected(attr), capability)?;
        Ok(op)
    }

    pub fn state(&self) -> ConvState {
        self.state
    }

    pub fn def(&self) -> &OperationDef {
        &self.def
    }

    pub fn shape(&self) -> Option<&ProblemShape> {
        self.shape.as_ref()
    }

    pub fn config(&self) -> Option<&TilingConfig> {
        self.config.as_ref()
    }

    /// Cache id of the compiled kernel.
    pub fn kernel_id(&self) -> Option<&str> {
        self.kernel_id.as_deref()
    }

    pub fn weights_buffer(&self) -> Option<&C::Buffer> {
        self.weights.as_ref()
    }

    pub fn bias_buffer(&self) -> Option<&C::Buffer> {
        self.biases.as_ref()
    }

    /// Select a tiling for `shape`. Allowed until the kernel is compiled;
    /// reconfiguring replaces the previous choice.
    pub fn configure(
        &mut self,
        shape: ProblemShape,
        capability: &DeviceCapability,
    ) -> Result<TilingConfig> {
        self.require("configure", &[ConvState::Unconfigured, ConvState::Configured])?;

        let config = select_config(capability, &shape, self.def.precision)?;

        self.shape = Some(shape);
        self.capability = Some(capability.clone());
        self.config = Some(config);
        self.state = ConvState::Configured;
        Ok(config)
    }

    /// Benchmark work-group candidates for `output` and keep the fastest.
    /// Ties keep the earlier candidate, so the selector's choice wins them.
    pub fn tune<B: WorkGroupBenchmark>(
        &mut self,
        benchmark: &mut B,
        output: &Bhwc,
    ) -> Result<TilingConfig> {
        self.require("tune", &[ConvState::Configured])?;
        let (capability, current) = match (&self.capability, self.config) {
            (Some(capability), Some(config)) => (capability, config),
            _ => return Err(self.invalid("tune")),
        };
        output.validate()?;

        if current.weights_upload_type.fixes_work_group() {
            log::debug!(
                "Skipping tuning: {} pins the work-group to {}",
                current.weights_upload_type,
                current.work_group_size
            );
            return Ok(current);
        }

        let mut best: Option<(Duration, TilingConfig)> = None;
        for work_group_size in work_group_candidates(capability, &current) {
            let candidate = TilingConfig {
                work_group_size,
                ..current
            };
            let geometry = compute_dispatch_grid(output, &candidate)?;
            let elapsed = benchmark.measure(&candidate, &geometry)?;
            log::trace!("wg {} -> {:?}", work_group_size, elapsed);
            if best.map_or(true, |(fastest, _)| elapsed < fastest) {
                best = Some((elapsed, candidate));
            }
        }

        let tuned = best.map_or(current, |(_, config)| config);
        log::info!(
            "Tuned work-group {} -> {}",
            current.work_group_size,
            tuned.work_group_size
        );
        self.config = Some(tuned);
        Ok(tuned)
    }

    /// Generate and build the kernel, going through the kernel cache.
    pub fn compile<G: KernelSourceGenerator>(
        &mut self,
        creation: &mut CreationContext<'_, C, G>,
    ) -> Result<()> {
        self.require("compile", &[ConvState::Configured])?;
        let (shape, capability, config) = match (&self.shape, &self.capability, &self.config) {
            (Some(shape), Some(capability), Some(config)) => (shape, capability, config),
            _ => return Err(self.invalid("compile")),
        };

        let source = creation.generator.generate(config, shape, &self.def)?;
        let options = compiler_options(&self.def, capability.vendor == GpuVendor::PowerVr);

        let context = &mut *creation.context;
        let cache = &mut *creation.cache;
        let (id, kernel) =
            cache.get_or_build(&source, &options, |source, options| {
                context.build_kernel(source, options)
            })?;

        log::info!("Compiled convolution kernel {} ({:?})", &id[..16], options);
        self.kernel = Some(kernel);
        self.kernel_id = Some(id);
        self.state = ConvState::Compiled;
        Ok(())
    }

    /// Pack and upload weights and bias, then make them resident.
    ///
    /// Allocation failures leave the operation `Compiled` with nothing
    /// retained. If only the residency step fails the operation stays in
    /// `WeightsUploaded`; call `finish_upload` to retry it.
    pub fn upload_weights(
        &mut self,
        weights: &WeightsTensor,
        bias: &BiasTensor,
        context: &mut C,
    ) -> Result<()> {
        self.require("upload weights", &[ConvState::Compiled])?;
        let (shape, config) = match (&self.shape, &self.config) {
            (Some(shape), Some(config)) => (shape, config),
            _ => return Err(self.invalid("upload weights")),
        };

        weights.validate()?;
        let expected = shape.weights_shape();
        if weights.shape != expected {
            return Err(ConvError::shape(format!(
                "weights {:?} do not match configured problem {:?}",
                weights.shape, expected
            )));
        }

        let precision = self.def.precision.storage();
        let packed_weights = pack_weights(weights, config.block_size.z, precision)?;
        let packed_bias = pack_bias(
            bias,
            shape.output_channels,
            packed_weights.layout.aligned_dst_depth,
            precision,
        )?;

        #[cfg(feature = "validate_determinism")]
        {
            let repacked = pack_weights(weights, config.block_size.z, precision)?;
            if repacked.as_bytes() != packed_weights.as_bytes() {
                log::error!("Weight packing is not deterministic");
                return Err(ConvError::allocation(
                    "weights",
                    "repacking produced different bytes",
                ));
            }
        }

        let weight_buffer = context
            .allocate_read_only_buffer(packed_weights.as_bytes())
            .map_err(|e| as_allocation_failure("weights", e))?;
        let bias_buffer = context
            .allocate_linear_storage(packed_bias.as_bytes(), precision)
            .map_err(|e| as_allocation_failure("biases", e))?;

        log::info!(
            "Uploaded weights ({} bytes) and biases ({} bytes) at {:?}",
            packed_weights.as_bytes().len(),
            packed_bias.as_bytes().len(),
            precision
        );

        self.weights = Some(weight_buffer);
        self.biases = Some(bias_buffer);
        self.state = ConvState::WeightsUploaded;

        self.finish_upload(context)
    }

    /// Make uploaded buffers resident. Moves `WeightsUploaded -> Ready`.
    pub fn finish_upload(&mut self, context: &mut C) -> Result<()> {
        self.require("finish upload", &[ConvState::WeightsUploaded])?;
        context.synchronize_uploads()?;
        self.state = ConvState::Ready;
        Ok(())
    }

    /// Summary of the configured operation, with the dispatch geometry for
    /// `output` when given.
    pub fn plan(&self, output: Option<&Bhwc>) -> Result<ConvPlan> {
        let (shape, capability, config) = match (&self.shape, &self.capability, &self.config) {
            (Some(shape), Some(capability), Some(config)) => (shape, capability, config),
            _ => return Err(self.invalid("plan")),
        };
        let storage = self.def.precision.storage();
        let layout = PackedLayout::new(shape.weights_shape(), config.block_size.z)?;
        let dispatch = output.map(|o| self.dispatch_geometry(o)).transpose()?;

        Ok(ConvPlan {
            kind: shape.kind,
            device: capability.name.clone(),
            precision: self.def.precision,
            storage,
            config: *config,
            src_depth: shape.src_depth(),
            dst_depth: shape.dst_depth(),
            aligned_dst_depth: layout.aligned_dst_depth,
            packed_weight_bytes: layout.byte_size(storage),
            packed_bias_bytes: layout.aligned_dst_depth as usize * storage.vec4_bytes(),
            local_memory_bytes: if config.weights_upload_type.uses_local_memory() {
                config.local_memory_bytes(storage)
            } else {
                0
            },
            compiler_options: compiler_options(
                &self.def,
                capability.vendor == GpuVendor::PowerVr,
            ),
            output: output.copied(),
            dispatch,
        })
    }

    /// Geometry `dispatch` would use for `output`.
    pub fn dispatch_geometry(&self, output: &Bhwc) -> Result<DispatchGeometry> {
        let config = self.config.as_ref().ok_or_else(|| self.invalid("plan dispatch"))?;
        compute_dispatch_grid(output, config)
    }

    /// Bind `io` and submit one dispatch.
    pub fn dispatch<Q: ComputeQueue<C>>(
        &self,
        queue: &mut Q,
        io: DispatchIo<'_, C::Buffer>,
    ) -> Result<Q::Completion> {
        self.require("dispatch", &[ConvState::Ready])?;
        let (shape, config, kernel, weights, biases) = match (
            &self.shape,
            &self.config,
            &self.kernel,
            &self.weights,
            &self.biases,
        ) {
            (Some(s), Some(c), Some(k), Some(w), Some(b)) => (s, c, k, w, b),
            _ => return Err(self.invalid("dispatch")),
        };

        if !self.def.batch_support && io.dst.shape.b > 1 {
            return Err(ConvError::shape(format!(
                "batch {} requires an operation with batch support",
                io.dst.shape.b
            )));
        }

        let args = bind_arguments(weights, biases, io.src, io.dst, shape, config)?;
        let geometry = compute_dispatch_grid(&io.dst.shape, config)?;
        log::trace!(
            "Dispatching grid {} (wg {}, groups {})",
            geometry.grid,
            geometry.work_group_size,
            geometry.work_group_count
        );
        queue.submit(kernel, &args, &geometry)
    }

    fn require(&self, action: &'static str, allowed: &[ConvState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn invalid(&self, action: &'static str) -> ConvError {
        ConvError::InvalidStateTransition {
            action,
            state: self.state,
        }
    }
}

fn as_allocation_failure(stage: &'static str, e: ConvError) -> ConvError {
    match e {
        ConvError::AllocationFailure { message, .. } => ConvError::allocation(stage, message),
        other => ConvError::allocation(stage, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::TensorRef;
    use crate::host::{HostBuffer, HostContext, HostQueue};
    use crate::kernel::{DefinesGenerator, KernelCache};
    use crate::shape::{Dim3, Ohwi};
    use crate::tiling::WeightsUploadType;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn generator() -> DefinesGenerator {
        DefinesGenerator::new("main", "void main() {}\n")
    }

    fn compiled(
        context: &mut HostContext,
        cache: &mut KernelCache<<HostContext as ComputeContext>::Kernel>,
        vendor: GpuVendor,
        weights: Ohwi,
    ) -> ConvOperation<HostContext> {
        let attr = Conv2dAttributes::simple(weights);
        let mut op = ConvOperation::conv2d(
            OperationDef::default(),
            &attr,
            &DeviceCapability::preset(vendor),
        )
        .unwrap();
        let gen = generator();
        op.compile(&mut CreationContext::new(context, &gen, cache)).unwrap();
        op
    }

    #[test]
    fn test_full_lifecycle() {
        let mut context = HostContext::new();
        let mut cache = KernelCache::new();
        let mut op = compiled(&mut context, &mut cache, GpuVendor::Nvidia, Ohwi::new(8, 3, 3, 4));
        assert_eq!(op.state(), ConvState::Compiled);

        let weights = WeightsTensor::zeros(Ohwi::new(8, 3, 3, 4));
        op.upload_weights(&weights, &BiasTensor::none(), &mut context).unwrap();
        assert_eq!(op.state(), ConvState::Ready);
        assert_eq!(context.sync_count(), 1);

        let src = HostBuffer::zeroed(16 * 16 * 4 * 4);
        let dst = HostBuffer::zeroed(14 * 14 * 8 * 4);
        let mut queue = HostQueue::new();
        let io = DispatchIo {
            src: TensorRef::new(&src, Bhwc::new(1, 16, 16, 4)),
            dst: TensorRef::new(&dst, Bhwc::new(1, 14, 14, 8)),
        };
        op.dispatch(&mut queue, io).unwrap();
        assert_eq!(queue.submissions().len(), 1);
        assert_eq!(queue.submissions()[0].scalars.len(), 4);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut context = HostContext::new();
        let mut op: ConvOperation<HostContext> = ConvOperation::new(OperationDef::default());

        let err = op
            .upload_weights(
                &WeightsTensor::zeros(Ohwi::new(4, 1, 1, 4)),
                &BiasTensor::none(),
                &mut context,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ConvError::InvalidStateTransition {
                state: ConvState::Unconfigured,
                ..
            }
        ));

        let mut cache = KernelCache::new();
        let mut op = compiled(&mut context, &mut cache, GpuVendor::Adreno, Ohwi::new(4, 1, 1, 4));
        let shape = *op.shape().unwrap();
        let err = op
            .configure(shape, &DeviceCapability::preset(GpuVendor::Adreno))
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot configure while operation is Compiled");
        assert_eq!(op.state(), ConvState::Compiled);
    }

    #[test]
    fn test_weights_shape_must_match() {
        let mut context = HostContext::new();
        let mut cache = KernelCache::new();
        let mut op = compiled(&mut context, &mut cache, GpuVendor::Mali, Ohwi::new(8, 3, 3, 4));
        let err = op
            .upload_weights(
                &WeightsTensor::zeros(Ohwi::new(8, 1, 1, 4)),
                &BiasTensor::none(),
                &mut context,
            )
            .unwrap_err();
        assert!(matches!(err, ConvError::InvalidShape(_)));
        assert_eq!(op.state(), ConvState::Compiled);
    }

    #[test]
    fn test_allocation_failure_keeps_state() {
        // dst_depth 2 -> block z 2, 72 vec4s of weights. The bias does not fit.
        let weights_bytes = 3 * 3 * 2 * 4 * 16;
        let mut context = HostContext::with_memory_budget(weights_bytes);
        let mut cache = KernelCache::new();
        let mut op = compiled(&mut context, &mut cache, GpuVendor::Nvidia, Ohwi::new(8, 3, 3, 4));

        let err = op
            .upload_weights(
                &WeightsTensor::zeros(Ohwi::new(8, 3, 3, 4)),
                &BiasTensor::none(),
                &mut context,
            )
            .unwrap_err();
        assert!(matches!(err, ConvError::AllocationFailure { stage: "biases", .. }));
        assert_eq!(op.state(), ConvState::Compiled);
        assert!(op.weights_buffer().is_none());
        assert_eq!(context.allocated_bytes(), 0);
    }

    #[test]
    fn test_residency_failure_then_retry() {
        let mut context = HostContext::new();
        let mut cache = KernelCache::new();
        let mut op = compiled(&mut context, &mut cache, GpuVendor::Nvidia, Ohwi::new(4, 1, 1, 4));

        context.fail_next_sync();
        let err = op
            .upload_weights(
                &WeightsTensor::zeros(Ohwi::new(4, 1, 1, 4)),
                &BiasTensor::none(),
                &mut context,
            )
            .unwrap_err();
        assert!(matches!(err, ConvError::AllocationFailure { .. }));
        assert_eq!(op.state(), ConvState::WeightsUploaded);

        op.finish_upload(&mut context).unwrap();
        assert_eq!(op.state(), ConvState::Ready);
    }

    #[test]
    fn test_shared_kernel_cache() {
        let mut context = HostContext::new();
        let mut cache = KernelCache::new();
        let a = compiled(&mut context, &mut cache, GpuVendor::Nvidia, Ohwi::new(8, 3, 3, 8));
        let b = compiled(&mut context, &mut cache, GpuVendor::Nvidia, Ohwi::new(8, 3, 3, 8));
        assert_eq!(a.kernel_id(), b.kernel_id());
        assert_eq!(context.kernels_built(), 1);
        assert_eq!(cache.len(), 1);
    }

    struct TableBenchmark {
        times: HashMap<Dim3, u64>,
        measured: Vec<Dim3>,
    }

    impl WorkGroupBenchmark for TableBenchmark {
        fn measure(&mut self, config: &TilingConfig, _geometry: &DispatchGeometry) -> Result<Duration> {
            self.measured.push(config.work_group_size);
            let micros = self.times.get(&config.work_group_size).copied().unwrap_or(1_000);
            Ok(Duration::from_micros(micros))
        }
    }

    #[test]
    fn test_tune_keeps_fastest() {
        let attr = Conv2dAttributes::simple(Ohwi::new(16, 3, 3, 16));
        let mut op: ConvOperation<HostContext> = ConvOperation::conv2d(
            OperationDef::default(),
            &attr,
            &DeviceCapability::preset(GpuVendor::Adreno),
        )
        .unwrap();
        let selected = *op.config().unwrap();
        assert_eq!(selected.weights_upload_type, WeightsUploadType::DirectGlobalRead);

        let mut bench = TableBenchmark {
            times: HashMap::from([(Dim3::new(16, 4, 1), 10)]),
            measured: Vec::new(),
        };
        let tuned = op.tune(&mut bench, &Bhwc::new(1, 32, 32, 16)).unwrap();
        assert_eq!(tuned.work_group_size, Dim3::new(16, 4, 1));
        assert_eq!(bench.measured[0], selected.work_group_size);
        assert_eq!(tuned.block_size, selected.block_size);
    }

    #[test]
    fn test_tune_ties_keep_selector_choice() {
        let attr = Conv2dAttributes::simple(Ohwi::new(16, 3, 3, 16));
        let mut op: ConvOperation<HostContext> = ConvOperation::conv2d(
            OperationDef::default(),
            &attr,
            &DeviceCapability::preset(GpuVendor::Adreno),
        )
        .unwrap();
        let selected = *op.config().unwrap();
        let mut bench = TableBenchmark {
            times: HashMap::new(),
            measured: Vec::new(),
        };
        let tuned = op.tune(&mut bench, &Bhwc::new(1, 32, 32, 16)).unwrap();
        assert_eq!(tuned, selected);
        assert!(bench.measured.len() > 1);
    }

    #[test]
    fn test_tune_skips_fixed_work_group() {
        let attr = Conv2dAttributes::simple(Ohwi::new(16, 3, 3, 16));
        let mut op: ConvOperation<HostContext> = ConvOperation::conv2d(
            OperationDef::default(),
            &attr,
            &DeviceCapability::preset(GpuVendor::PowerVr),
        )
        .unwrap();
        let mut bench = TableBenchmark {
            times: HashMap::new(),
            measured: Vec::new(),
        };
        let before = *op.config().unwrap();
        assert_eq!(op.tune(&mut bench, &Bhwc::new(1, 8, 8, 16)).unwrap(), before);
        assert!(bench.measured.is_empty());
    }

    #[test]
    fn test_plan_matches_upload() {
        let attr = Conv2dAttributes::simple(Ohwi::new(5, 3, 3, 4));
        let mut context = HostContext::new();
        let mut op: ConvOperation<HostContext> = ConvOperation::conv2d(
            OperationDef::new(CalculationsPrecision::F16),
            &attr,
            &DeviceCapability::preset(GpuVendor::PowerVr),
        )
        .unwrap();
        let plan = op.plan(Some(&Bhwc::new(1, 8, 8, 5))).unwrap();
        assert_eq!(plan.storage, Precision::F16);
        assert_eq!(plan.compiler_options, vec![CompilerOption::PowerVrFp16]);
        assert!(plan.dispatch.is_some());

        let mut cache = KernelCache::new();
        let gen = generator();
        op.compile(&mut CreationContext::new(&mut context, &gen, &mut cache)).unwrap();
        op.upload_weights(
            &WeightsTensor::zeros(Ohwi::new(5, 3, 3, 4)),
            &BiasTensor::new(vec![0.5; 5]),
            &mut context,
        )
        .unwrap();
        assert_eq!(
            op.weights_buffer().unwrap().len(),
            plan.packed_weight_bytes
        );
        assert_eq!(op.bias_buffer().unwrap().len(), plan.packed_bias_bytes);
        assert_eq!(op.bias_buffer().unwrap().precision(), Some(Precision::F16));
    }

    #[test]
    fn test_batched_dispatch_requires_batch_support() {
        let mut context = HostContext::new();
        let mut cache = KernelCache::new();
        let mut op = compiled(&mut context, &mut cache, GpuVendor::Nvidia, Ohwi::new(4, 1, 1, 4));
        op.upload_weights(
            &WeightsTensor::zeros(Ohwi::new(4, 1, 1, 4)),
            &BiasTensor::none(),
            &mut context,
        )
        .unwrap();

        let buffer = HostBuffer::zeroed(64);
        let io = DispatchIo {
            src: TensorRef::new(&buffer, Bhwc::new(2, 2, 2, 4)),
            dst: TensorRef::new(&buffer, Bhwc::new(2, 2, 2, 4)),
        };
        let err = op.dispatch(&mut HostQueue::new(), io).unwrap_err();
        assert!(matches!(err, ConvError::InvalidShape(_)));
    }
}
