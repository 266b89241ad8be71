//! Kernel interfaces
//!
//! The seams between the convolution operation and the outside world:
//! kernel source generation, buffer allocation and kernel building,
//! queue submission and work-group benchmarking. Also the content-addressed
//! kernel cache shared between operations.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::binding::{BoundArguments, DispatchGeometry};
use crate::conv::OperationDef;
use crate::error::Result;
use crate::packing::{CalculationsPrecision, Precision};
use crate::shape::ProblemShape;
use crate::tiling::{TilingConfig, WeightsUploadType};

/// Kernel program, either source text for a runtime compiler or a SPIR-V
/// binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelCode {
    Text(String),
    SpirV(Vec<u8>),
}

impl KernelCode {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            KernelCode::Text(text) => text.as_bytes(),
            KernelCode::SpirV(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub entry_point: String,
    pub code: KernelCode,
    /// Specialization constants, bound to ids 0.. in order.
    pub specialization: Vec<u32>,
}

/// Extra flags passed to the kernel compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CompilerOption {
    /// Native half-float arithmetic on PowerVR.
    PowerVrFp16,
}

impl CompilerOption {
    pub fn name(&self) -> &'static str {
        match self {
            CompilerOption::PowerVrFp16 => "powervr-fp16",
        }
    }
}

/// Produces kernel source for a tiling. Source generation itself lives
/// outside this crate.
pub trait KernelSourceGenerator {
    fn generate(
        &self,
        config: &TilingConfig,
        shape: &ProblemShape,
        def: &OperationDef,
    ) -> Result<KernelSource>;
}

/// Buffer allocation and kernel building on a compute device.
pub trait ComputeContext {
    type Buffer;
    type Kernel;

    /// Read-only storage buffer initialised with `bytes`.
    fn allocate_read_only_buffer(&mut self, bytes: &[u8]) -> Result<Self::Buffer>;

    /// Linear (texel-addressable) storage of `precision` vec4s.
    fn allocate_linear_storage(&mut self, bytes: &[u8], precision: Precision)
        -> Result<Self::Buffer>;

    fn build_kernel(
        &mut self,
        source: &KernelSource,
        options: &[CompilerOption],
    ) -> Result<Self::Kernel>;

    /// Make previously allocated buffers resident before first use.
    fn synchronize_uploads(&mut self) -> Result<()>;
}

/// Submission of bound dispatches.
pub trait ComputeQueue<C: ComputeContext> {
    /// Handle that resolves when the dispatch has finished.
    type Completion;

    fn submit(
        &mut self,
        kernel: &C::Kernel,
        args: &BoundArguments<'_, C::Buffer>,
        geometry: &DispatchGeometry,
    ) -> Result<Self::Completion>;
}

/// Times one work-group size candidate.
pub trait WorkGroupBenchmark {
    fn measure(&mut self, config: &TilingConfig, geometry: &DispatchGeometry) -> Result<Duration>;
}

/// Everything `compile` needs: where to build, what to build, and the cache.
pub struct CreationContext<'a, C: ComputeContext, G: KernelSourceGenerator> {
    pub context: &'a mut C,
    pub generator: &'a G,
    pub cache: &'a mut KernelCache<C::Kernel>,
}

impl<'a, C: ComputeContext, G: KernelSourceGenerator> CreationContext<'a, C, G> {
    pub fn new(context: &'a mut C, generator: &'a G, cache: &'a mut KernelCache<C::Kernel>) -> Self {
        Self {
            context,
            generator,
            cache,
        }
    }
}

/// Content-addressed kernel cache.
///
/// The key is the SHA-256 of the kernel code, entry point, specialization
/// constants and compiler options, so identical sources always map to the
/// same kernel. Kernels are shared with `Arc`; an operation keeps its kernel
/// alive after eviction.
pub struct KernelCache<K> {
    kernels: HashMap<String, Arc<K>>,
}

impl<K> Default for KernelCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KernelCache<K> {
    pub fn new() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    /// 64-character hex id of a source/options pair.
    pub fn kernel_id(source: &KernelSource, options: &[CompilerOption]) -> String {
        let mut sorted = options.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut hasher = Sha256::new();
        hasher.update(match source.code {
            KernelCode::Text(_) => b"text\0".as_slice(),
            KernelCode::SpirV(_) => b"spirv\0".as_slice(),
        });
        hasher.update(source.code.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.entry_point.as_bytes());
        hasher.update([0u8]);
        hasher.update(bytemuck::cast_slice::<u32, u8>(&source.specialization));
        for option in &sorted {
            hasher.update([0u8]);
            hasher.update(option.name().as_bytes());
        }

        let digest = hasher.finalize();
        let mut id = String::with_capacity(64);
        for byte in digest {
            let _ = write!(id, "{:02x}", byte);
        }
        id
    }

    /// Look up the kernel for `source`, building it on a miss.
    pub fn get_or_build<F>(
        &mut self,
        source: &KernelSource,
        options: &[CompilerOption],
        build: F,
    ) -> Result<(String, Arc<K>)>
    where
        F: FnOnce(&KernelSource, &[CompilerOption]) -> Result<K>,
    {
        let id = Self::kernel_id(source, options);
        if let Some(kernel) = self.kernels.get(&id) {
            log::debug!("Kernel cache HIT: {}", &id[..16]);
            return Ok((id, Arc::clone(kernel)));
        }

        log::debug!("Kernel cache MISS: {} (building)", &id[..16]);
        let kernel = Arc::new(build(source, options)?);
        self.kernels.insert(id.clone(), Arc::clone(&kernel));

        log::info!(
            "Kernel built: {} (entry={}, size={}, cache_size={})",
            &id[..16],
            source.entry_point,
            source.code.as_bytes().len(),
            self.kernels.len()
        );
        Ok((id, kernel))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.kernels.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn clear(&mut self) {
        log::info!("Clearing kernel cache ({} entries)", self.kernels.len());
        self.kernels.clear();
    }
}

/// Compiler options implied by the operation and device.
pub fn compiler_options(def: &OperationDef, is_powervr: bool) -> Vec<CompilerOption> {
    let mut options = Vec::new();
    if is_powervr && def.precision == CalculationsPrecision::F16 {
        options.push(CompilerOption::PowerVrFp16);
    }
    options
}

/// Prepends the tiling as preprocessor defines to a fixed kernel body.
///
/// The body is expected to read `BLOCK_SIZE_*`, `WG_SIZE_*` and friends to
/// specialise itself.
#[derive(Debug, Clone)]
pub struct DefinesGenerator {
    pub entry_point: String,
    pub body: String,
}

impl DefinesGenerator {
    pub fn new(entry_point: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            entry_point: entry_point.into(),
            body: body.into(),
        }
    }

    pub fn defines(config: &TilingConfig, shape: &ProblemShape, def: &OperationDef) -> String {
        let mut out = String::new();
        let mut define = |name: &str, value: String| {
            let _ = writeln!(out, "#define {} {}", name, value);
        };

        define("BLOCK_SIZE_X", config.block_size.x.to_string());
        define("BLOCK_SIZE_Y", config.block_size.y.to_string());
        define("BLOCK_SIZE_Z", config.block_size.z.to_string());
        define("WG_SIZE_X", config.work_group_size.x.to_string());
        define("WG_SIZE_Y", config.work_group_size.y.to_string());
        define("WG_SIZE_Z", config.work_group_size.z.to_string());
        define("SRC_DEPTH", shape.src_depth().to_string());
        define("DST_DEPTH", shape.dst_depth().to_string());
        define("SRC_DEPTH_LOOP_SIZE", config.src_depth_loop_size.to_string());
        define("X_KERNEL_IS_1", (config.x_kernel_is_1 as u32).to_string());
        define("Y_KERNEL_IS_1", (config.y_kernel_is_1 as u32).to_string());
        define("BATCH_SUPPORT", (def.batch_support as u32).to_string());

        let upload = match config.weights_upload_type {
            WeightsUploadType::AsyncSubgroupCopy => "WEIGHTS_ASYNC_SUBGROUP",
            WeightsUploadType::ThreadCooperativeCopy => "WEIGHTS_LOCAL_COOPERATIVE",
            WeightsUploadType::DirectGlobalRead => "WEIGHTS_GLOBAL",
        };
        define(upload, "1".to_string());
        if config.weights_upload_type.uses_local_memory() {
            define(
                "LOCAL_WEIGHTS_BYTES",
                config.local_memory_bytes(def.precision.storage()).to_string(),
            );
        }

        let (flt, acc) = match def.precision {
            CalculationsPrecision::F32 => ("float", "float"),
            CalculationsPrecision::F32F16 => ("float", "half"),
            CalculationsPrecision::F16 => ("half", "half"),
        };
        define("FLT", flt.to_string());
        define("ACCUM_FLT", acc.to_string());
        out
    }
}

impl KernelSourceGenerator for DefinesGenerator {
    fn generate(
        &self,
        config: &TilingConfig,
        shape: &ProblemShape,
        def: &OperationDef,
    ) -> Result<KernelSource> {
        let mut code = Self::defines(config, shape, def);
        code.push_str(&self.body);
        Ok(KernelSource {
            entry_point: self.entry_point.clone(),
            code: KernelCode::Text(code),
            specialization: Vec::new(),
        })
    }
}

/// Hands out one prebuilt SPIR-V module for every tiling, specialised per
/// tiling through constants 0..=9:
///
/// ```text
/// 0-2  work-group size x, y, z
/// 3-5  block size x, y, z
/// 6    src_depth_loop_size
/// 7-8  x_kernel_is_1, y_kernel_is_1
/// 9    weights upload type (0 async, 1 cooperative, 2 global)
/// ```
#[derive(Debug, Clone)]
pub struct SpirvGenerator {
    pub entry_point: String,
    pub spirv: Vec<u8>,
}

impl SpirvGenerator {
    pub fn new(entry_point: impl Into<String>, spirv: Vec<u8>) -> Self {
        Self {
            entry_point: entry_point.into(),
            spirv,
        }
    }
}

impl SpirvGenerator {
    pub fn specialization(config: &TilingConfig) -> Vec<u32> {
        let upload = match config.weights_upload_type {
            WeightsUploadType::AsyncSubgroupCopy => 0,
            WeightsUploadType::ThreadCooperativeCopy => 1,
            WeightsUploadType::DirectGlobalRead => 2,
        };
        vec![
            config.work_group_size.x,
            config.work_group_size.y,
            config.work_group_size.z,
            config.block_size.x,
            config.block_size.y,
            config.block_size.z,
            config.src_depth_loop_size,
            config.x_kernel_is_1 as u32,
            config.y_kernel_is_1 as u32,
            upload,
        ]
    }
}

impl KernelSourceGenerator for SpirvGenerator {
    fn generate(
        &self,
        config: &TilingConfig,
        _shape: &ProblemShape,
        _def: &OperationDef,
    ) -> Result<KernelSource> {
        Ok(KernelSource {
            entry_point: self.entry_point.clone(),
            code: KernelCode::SpirV(self.spirv.clone()),
            specialization: Self::specialization(config),
        })
    }
}
