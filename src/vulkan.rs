//! Vulkan compute backend
//!
//! Instance/device bring-up, capability query, host-visible storage
//! buffers, compute pipelines built from SPIR-V and fenced submissions.
//!
//! Every Vulkan object holds an `Arc` to the shared device, so buffers,
//! kernels and in-flight completions may outlive the `VulkanDevice` that
//! created them. The device and instance are destroyed with the last
//! reference.
//!
//! A `VulkanCompletion` also holds the pipeline and every buffer bound to
//! its dispatch. Dropping a `ConvOperation` or an activation buffer while
//! the GPU still runs only releases the handle; the memory is freed once
//! the completion has waited on its fence.

use std::ffi::CString;
use std::sync::Arc;

use ash::{vk, Device, Entry, Instance};

use crate::binding::{BoundArguments, DispatchGeometry};
use crate::device::{DeviceCapability, GpuVendor};
use crate::error::{ConvError, Result};
use crate::kernel::{CompilerOption, ComputeContext, ComputeQueue, KernelCode, KernelSource};
use crate::packing::Precision;
use crate::shape::Dim3;

/// Weights, biases, src, dst.
const STORAGE_BINDINGS: u32 = 4;

/// Four `Int4` scalars.
const PUSH_CONSTANT_BYTES: u32 = 64;

const DESCRIPTOR_SETS_PER_QUEUE: u32 = 64;

const SPIRV_MAGIC: u32 = 0x0723_0203;

struct SharedDevice {
    _entry: Entry,
    instance: Instance,
    device: Device,
}

impl Drop for SharedDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device");
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("device_wait_idle failed during teardown: {:?}", e);
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// A logical Vulkan device with one compute queue.
pub struct VulkanDevice {
    shared: Arc<SharedDevice>,
    physical_device: vk::PhysicalDevice,
    compute_queue: vk::Queue,
    compute_queue_family: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    capability: DeviceCapability,
    api_version: String,
}

impl VulkanDevice {
    /// Open device `device_index` with validation layers when the
    /// `validation` feature is on.
    pub fn open_default(device_index: usize) -> Result<Self> {
        Self::new(device_index, cfg!(feature = "validation"))
    }

    /// Open a Vulkan device for compute.
    ///
    /// Creates the instance, picks the physical device, creates a logical
    /// device with one compute queue and records its capability.
    ///
    /// # Arguments
    ///
    /// * `device_index` - GPU index (0 = first available)
    /// * `enable_validation` - Enable the Khronos validation layer
    ///
    /// # Returns
    ///
    /// A device ready to allocate buffers, build kernels and create queues.
    ///
    /// # Errors
    ///
    /// * `ConvError::DeviceInit` - If the loader, instance or device cannot
    ///   be created, or `device_index` is out of range
    pub fn new(device_index: usize, enable_validation: bool) -> Result<Self> {
        log::info!(
            "Initializing Vulkan (device_index={}, validation={})",
            device_index,
            enable_validation
        );

        let entry = unsafe { Entry::load() }
            .map_err(|e| ConvError::DeviceInit(format!("failed to load Vulkan: {}", e)))?;
        let instance = create_instance(&entry, enable_validation)?;

        let (physical_device, props) = match select_physical_device(&instance, device_index) {
            Ok(found) => found,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };
        let (device, compute_queue, compute_queue_family) =
            match create_logical_device(&instance, physical_device) {
                Ok(created) => created,
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let subgroup_size = query_subgroup_size(&instance, physical_device, &props);
        let capability = capability_from_properties(&props, subgroup_size);

        let api_version = format!(
            "{}.{}.{}",
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version)
        );
        log::info!(
            "Vulkan device ready: {} (Vulkan {}, vendor {})",
            capability.name,
            api_version,
            capability.vendor
        );

        Ok(Self {
            shared: Arc::new(SharedDevice {
                _entry: entry,
                instance,
                device,
            }),
            physical_device,
            compute_queue,
            compute_queue_family,
            memory_properties,
            capability,
            api_version,
        })
    }

    pub fn capability(&self) -> &DeviceCapability {
        &self.capability
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Heap sizes in bytes.
    pub fn memory_heaps(&self) -> Vec<u64> {
        let props = unsafe {
            self.shared
                .instance
                .get_physical_device_memory_properties(self.physical_device)
        };
        props.memory_heaps[..props.memory_heap_count as usize]
            .iter()
            .map(|h| h.size)
            .collect()
    }

    /// Uninitialised storage buffer of `size` bytes, e.g. for activations.
    pub fn create_storage_buffer(&self, size: u64) -> Result<VulkanBuffer> {
        VulkanBuffer::new(&self.shared, &self.memory_properties, size, None)
    }

    /// Queue for submitting dispatches.
    pub fn create_queue(&self) -> Result<VulkanQueue> {
        VulkanQueue::new(&self.shared, self.compute_queue, self.compute_queue_family)
    }

    fn upload(&self, bytes: &[u8], precision: Option<Precision>) -> Result<VulkanBuffer> {
        let buffer =
            VulkanBuffer::new(&self.shared, &self.memory_properties, bytes.len() as u64, precision)?;
        buffer.upload(bytes)?;
        Ok(buffer)
    }
}

impl ComputeContext for VulkanDevice {
    type Buffer = VulkanBuffer;
    type Kernel = VulkanKernel;

    fn allocate_read_only_buffer(&mut self, bytes: &[u8]) -> Result<VulkanBuffer> {
        self.upload(bytes, None)
    }

    fn allocate_linear_storage(&mut self, bytes: &[u8], precision: Precision) -> Result<VulkanBuffer> {
        self.upload(bytes, Some(precision))
    }

    fn build_kernel(
        &mut self,
        source: &KernelSource,
        options: &[CompilerOption],
    ) -> Result<VulkanKernel> {
        let spirv = match &source.code {
            KernelCode::SpirV(bytes) => bytes,
            KernelCode::Text(_) => {
                return Err(ConvError::CompilationFailure(
                    "the Vulkan backend builds SPIR-V only".to_string(),
                ))
            }
        };
        validate_spirv(spirv).map_err(ConvError::CompilationFailure)?;
        if !options.is_empty() {
            // Half-float arithmetic is already decided in the SPIR-V.
            log::debug!("Ignoring compiler options {:?} for SPIR-V", options);
        }
        VulkanKernel::new(&self.shared, spirv, &source.entry_point, &source.specialization)
    }

    fn synchronize_uploads(&mut self) -> Result<()> {
        // Host-coherent memory: uploads are visible once the queue is idle.
        unsafe { self.shared.device.queue_wait_idle(self.compute_queue) }
            .map_err(|e| ConvError::allocation("residency", format!("queue_wait_idle: {:?}", e)))
    }
}

/// Capability record from raw device properties.
pub fn capability_from_properties(
    props: &vk::PhysicalDeviceProperties,
    subgroup_size: Option<u32>,
) -> DeviceCapability {
    let limits = &props.limits;
    let name = props
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let local_memory = limits.max_compute_shared_memory_size;
    DeviceCapability {
        vendor: GpuVendor::from_pci_id(props.vendor_id),
        name,
        max_work_group_size: Dim3::new(
            limits.max_compute_work_group_size[0],
            limits.max_compute_work_group_size[1],
            limits.max_compute_work_group_size[2],
        ),
        max_work_group_invocations: limits.max_compute_work_group_invocations,
        subgroup_size,
        // Vulkan exposes no async work-group copy.
        supports_async_subgroup_copy: false,
        supports_local_memory: local_memory > 0,
        max_local_memory_bytes: local_memory,
        preferred_vector_width: 4,
    }
}

/// Basic SPIR-V header checks before handing bytes to the driver.
///
/// Checks:
/// - Minimum size (5-word header)
/// - 4-byte alignment
/// - Magic number
/// - Version (1.0 - 1.6)
/// - Non-zero bound
///
/// # Arguments
///
/// * `bytes` - Raw SPIR-V binary
///
/// # Returns
///
/// * `Ok(())` if the header is well formed
/// * `Err(String)` describing the first problem found
pub fn validate_spirv(bytes: &[u8]) -> std::result::Result<(), String> {
    if bytes.len() < 20 {
        return Err(format!("SPIR-V too small: {} bytes (minimum 20)", bytes.len()));
    }
    if bytes.len() % 4 != 0 {
        return Err(format!("SPIR-V size ({}) not 4-byte aligned", bytes.len()));
    }

    let word = |i: usize| u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]]);
    let magic = word(0);
    if magic != SPIRV_MAGIC {
        return Err(format!(
            "Invalid SPIR-V magic: 0x{:08x} (expected 0x{:08x})",
            magic, SPIRV_MAGIC
        ));
    }

    let version = word(1);
    let (major, minor) = ((version >> 16) & 0xFF, (version >> 8) & 0xFF);
    if major != 1 || minor > 6 {
        return Err(format!(
            "Unsupported SPIR-V version: {}.{} (supported: 1.0-1.6)",
            major, minor
        ));
    }
    if word(3) == 0 {
        return Err("SPIR-V bound is 0 (invalid)".to_string());
    }

    log::trace!("SPIR-V validated: version {}.{}, size {}", major, minor, bytes.len());
    Ok(())
}

fn create_instance(entry: &Entry, enable_validation: bool) -> Result<Instance> {
    let app_name = CString::new("hlx_conv").map_err(|e| ConvError::DeviceInit(e.to_string()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(&app_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_2);

    let layer_names: Vec<CString> = if enable_validation {
        log::info!("Enabling Vulkan validation layers");
        vec![CString::new("VK_LAYER_KHRONOS_validation")
            .map_err(|e| ConvError::DeviceInit(e.to_string()))?]
    } else {
        vec![]
    };
    let layer_ptrs: Vec<*const std::ffi::c_char> = layer_names.iter().map(|l| l.as_ptr()).collect();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layer_ptrs);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| ConvError::DeviceInit(format!("vkCreateInstance failed: {:?}", e)))?;
    log::debug!("Vulkan instance created");
    Ok(instance)
}

fn select_physical_device(
    instance: &Instance,
    device_index: usize,
) -> Result<(vk::PhysicalDevice, vk::PhysicalDeviceProperties)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        ConvError::DeviceInit(format!("enumerate_physical_devices failed: {:?}", e))
    })?;

    log::info!("Found {} Vulkan device(s)", devices.len());
    for (i, &dev) in devices.iter().enumerate() {
        let props = unsafe { instance.get_physical_device_properties(dev) };
        log::debug!("  Device {}: {:?}", i, props.device_name_as_c_str());
    }

    let device = devices.get(device_index).copied().ok_or_else(|| {
        ConvError::DeviceInit(format!(
            "no Vulkan device at index {} ({} available)",
            device_index,
            devices.len()
        ))
    })?;
    let props = unsafe { instance.get_physical_device_properties(device) };
    Ok((device, props))
}

fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<(Device, vk::Queue, u32)> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let compute_family = queue_families
        .iter()
        .position(|props| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
        .ok_or_else(|| ConvError::DeviceInit("No compute queue family found".to_string()))?;
    log::debug!("Using queue family {} for compute", compute_family);

    let queue_priorities = [1.0f32];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(compute_family)
        .queue_priorities(&queue_priorities);
    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info));

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(|e| ConvError::DeviceInit(format!("vkCreateDevice failed: {:?}", e)))?;
    let queue = unsafe { device.get_device_queue(compute_family, 0) };
    Ok((device, queue, compute_family))
}

fn query_subgroup_size(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    props: &vk::PhysicalDeviceProperties,
) -> Option<u32> {
    if props.api_version < vk::API_VERSION_1_1 {
        return None;
    }
    let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut subgroup);
    unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };
    let size = subgroup.subgroup_size;
    (size > 0).then_some(size)
}

fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        type_filter & (1 << i) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

struct BufferAllocation {
    shared: Arc<SharedDevice>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
}

impl Drop for BufferAllocation {
    fn drop(&mut self) {
        unsafe {
            self.shared.device.destroy_buffer(self.buffer, None);
            self.shared.device.free_memory(self.memory, None);
        }
    }
}

/// Host-visible, host-coherent storage buffer.
pub struct VulkanBuffer {
    allocation: Arc<BufferAllocation>,
    size: u64,
    precision: Option<Precision>,
}

impl VulkanBuffer {
    fn new(
        shared: &Arc<SharedDevice>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: u64,
        precision: Option<Precision>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(ConvError::allocation("buffer", "zero-sized buffer"));
        }
        let device = &shared.device;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(|e| ConvError::allocation("buffer", format!("vkCreateBuffer: {:?}", e)))?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = match find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) {
            Some(index) => index,
            None => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(ConvError::allocation("buffer", "no host-visible memory type"));
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(ConvError::allocation("buffer", format!("vkAllocateMemory: {:?}", e)));
            }
        };
        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(ConvError::allocation("buffer", format!("vkBindBufferMemory: {:?}", e)));
        }

        Ok(Self {
            allocation: Arc::new(BufferAllocation {
                shared: Arc::clone(shared),
                buffer,
                memory,
            }),
            size,
            precision,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn precision(&self) -> Option<Precision> {
        self.precision
    }

    pub fn upload(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > self.size {
            return Err(ConvError::allocation(
                "buffer",
                format!("data size {} exceeds buffer size {}", bytes.len(), self.size),
            ));
        }
        let allocation = &self.allocation;
        let device = &allocation.shared.device;
        unsafe {
            let ptr = device
                .map_memory(allocation.memory, 0, bytes.len() as u64, vk::MemoryMapFlags::empty())
                .map_err(|e| ConvError::allocation("buffer", format!("vkMapMemory: {:?}", e)))?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
            device.unmap_memory(allocation.memory);
        }
        Ok(())
    }

    pub fn download(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.size as usize];
        let allocation = &self.allocation;
        let device = &allocation.shared.device;
        unsafe {
            let ptr = device
                .map_memory(allocation.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .map_err(|e| ConvError::allocation("buffer", format!("vkMapMemory: {:?}", e)))?;
            std::ptr::copy_nonoverlapping(ptr as *const u8, data.as_mut_ptr(), data.len());
            device.unmap_memory(allocation.memory);
        }
        Ok(data)
    }
}

struct PipelineObjects {
    shared: Arc<SharedDevice>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
}

impl Drop for PipelineObjects {
    fn drop(&mut self) {
        log::debug!("Destroying compute pipeline");
        unsafe {
            self.shared.device.destroy_pipeline(self.pipeline, None);
            self.shared.device.destroy_pipeline_layout(self.layout, None);
            self.shared
                .device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Compute pipeline with four storage-buffer bindings and 64 bytes of push
/// constants.
pub struct VulkanKernel {
    objects: Arc<PipelineObjects>,
    entry_point: String,
}

impl VulkanKernel {
    fn new(
        shared: &Arc<SharedDevice>,
        spirv: &[u8],
        entry_point: &str,
        specialization: &[u32],
    ) -> Result<Self> {
        let device = &shared.device;
        let code: Vec<u32> = spirv
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        let entry_name = CString::new(entry_point)
            .map_err(|e| ConvError::CompilationFailure(format!("bad entry point: {}", e)))?;

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..STORAGE_BINDINGS)
            .map(|i| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let set_layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                None,
            )
        }
        .map_err(|e| compile_error("descriptor set layout", e))?;

        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(PUSH_CONSTANT_BYTES);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&set_layout))
            .push_constant_ranges(std::slice::from_ref(&push_constant_range));
        let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(compile_error("pipeline layout", e));
            }
        };

        let destroy_layouts = || unsafe {
            device.destroy_pipeline_layout(layout, None);
            device.destroy_descriptor_set_layout(set_layout, None);
        };

        let module = match unsafe {
            device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&code), None)
        } {
            Ok(module) => module,
            Err(e) => {
                destroy_layouts();
                return Err(compile_error("shader module", e));
            }
        };

        let map_entries: Vec<vk::SpecializationMapEntry> = (0..specialization.len() as u32)
            .map(|i| {
                vk::SpecializationMapEntry::default()
                    .constant_id(i)
                    .offset(i * 4)
                    .size(4)
            })
            .collect();
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(bytemuck::cast_slice(specialization));

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_name)
            .specialization_info(&spec_info);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let created = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        // The pipeline keeps what it needs from the module.
        unsafe { device.destroy_shader_module(module, None) };

        let pipeline = match created {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                destroy_layouts();
                return Err(compile_error("compute pipeline", e));
            }
        };

        log::debug!(
            "Created compute pipeline (entry={}, spirv_size={}, spec_constants={})",
            entry_point,
            spirv.len(),
            specialization.len()
        );

        Ok(Self {
            objects: Arc::new(PipelineObjects {
                shared: Arc::clone(shared),
                pipeline,
                layout,
                set_layout,
            }),
            entry_point: entry_point.to_string(),
        })
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}

fn compile_error(what: &str, e: vk::Result) -> ConvError {
    ConvError::CompilationFailure(format!("failed to create {}: {:?}", what, e))
}

fn dispatch_error(what: &str, e: vk::Result) -> ConvError {
    ConvError::allocation("dispatch", format!("{}: {:?}", what, e))
}

struct QueuePools {
    shared: Arc<SharedDevice>,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
}

impl Drop for QueuePools {
    fn drop(&mut self) {
        unsafe {
            self.shared
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.shared.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Compute queue with its own command and descriptor pools.
pub struct VulkanQueue {
    pools: Arc<QueuePools>,
    queue: vk::Queue,
}

impl VulkanQueue {
    fn new(shared: &Arc<SharedDevice>, queue: vk::Queue, family: u32) -> Result<Self> {
        let device = &shared.device;
        let command_pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&command_pool_info, None) }
            .map_err(|e| ConvError::DeviceInit(format!("vkCreateCommandPool: {:?}", e)))?;

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(DESCRIPTOR_SETS_PER_QUEUE * STORAGE_BINDINGS)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(DESCRIPTOR_SETS_PER_QUEUE)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        let descriptor_pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_command_pool(command_pool, None) };
                return Err(ConvError::DeviceInit(format!("vkCreateDescriptorPool: {:?}", e)));
            }
        };

        Ok(Self {
            pools: Arc::new(QueuePools {
                shared: Arc::clone(shared),
                command_pool,
                descriptor_pool,
            }),
            queue,
        })
    }
}

impl ComputeQueue<VulkanDevice> for VulkanQueue {
    type Completion = VulkanCompletion;

    fn submit(
        &mut self,
        kernel: &VulkanKernel,
        args: &BoundArguments<'_, VulkanBuffer>,
        geometry: &DispatchGeometry,
    ) -> Result<VulkanCompletion> {
        let push = args.push_constant_bytes();
        if push.len() as u32 > PUSH_CONSTANT_BYTES {
            return Err(ConvError::allocation(
                "dispatch",
                format!("{} push-constant bytes exceed {}", push.len(), PUSH_CONSTANT_BYTES),
            ));
        }

        let device = &self.pools.shared.device;
        let pipeline = &kernel.objects;
        let mut completion = VulkanCompletion {
            pools: Arc::clone(&self.pools),
            descriptor_set: vk::DescriptorSet::null(),
            command_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            submitted: false,
            _pipeline: Arc::clone(pipeline),
            _buffers: args
                .buffers()
                .iter()
                .map(|b| Arc::clone(&b.allocation))
                .collect(),
        };

        let set_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pools.descriptor_pool)
            .set_layouts(std::slice::from_ref(&pipeline.set_layout));
        completion.descriptor_set = unsafe { device.allocate_descriptor_sets(&set_info) }
            .map_err(|e| dispatch_error("vkAllocateDescriptorSets", e))?[0];

        let buffer_infos: Vec<vk::DescriptorBufferInfo> = args
            .buffers()
            .iter()
            .map(|b| {
                vk::DescriptorBufferInfo::default()
                    .buffer(b.allocation.buffer)
                    .offset(0)
                    .range(vk::WHOLE_SIZE)
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .enumerate()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(completion.descriptor_set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        let cmd_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pools.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        completion.command_buffer = unsafe { device.allocate_command_buffers(&cmd_info) }
            .map_err(|e| dispatch_error("vkAllocateCommandBuffers", e))?[0];
        let cmd = completion.command_buffer;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let count = geometry.work_group_count;
        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| dispatch_error("vkBeginCommandBuffer", e))?;
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                &[completion.descriptor_set],
                &[],
            );
            device.cmd_push_constants(cmd, pipeline.layout, vk::ShaderStageFlags::COMPUTE, 0, push);
            device.cmd_dispatch(cmd, count.x, count.y, count.z);
            device
                .end_command_buffer(cmd)
                .map_err(|e| dispatch_error("vkEndCommandBuffer", e))?;
        }

        completion.fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .map_err(|e| dispatch_error("vkCreateFence", e))?;
        let submit_info = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
        unsafe { device.queue_submit(self.queue, &[submit_info], completion.fence) }
            .map_err(|e| dispatch_error("vkQueueSubmit", e))?;
        completion.submitted = true;

        log::trace!(
            "Submitted {} with {} work-groups",
            kernel.entry_point,
            count.product()
        );
        Ok(completion)
    }
}

/// In-flight dispatch. Dropping it waits for the GPU before releasing the
/// command buffer and descriptor set, then lets go of the pipeline and
/// buffers it kept alive.
pub struct VulkanCompletion {
    pools: Arc<QueuePools>,
    descriptor_set: vk::DescriptorSet,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
    submitted: bool,
    _pipeline: Arc<PipelineObjects>,
    _buffers: Vec<Arc<BufferAllocation>>,
}

impl VulkanCompletion {
    /// Block until the dispatch has finished.
    pub fn wait(&self) -> Result<()> {
        if !self.submitted {
            return Ok(());
        }
        unsafe {
            self.pools
                .shared
                .device
                .wait_for_fences(&[self.fence], true, u64::MAX)
        }
        .map_err(|e| dispatch_error("vkWaitForFences", e))
    }
}

impl Drop for VulkanCompletion {
    fn drop(&mut self) {
        if let Err(e) = self.wait() {
            log::warn!("Dropping completion without a finished fence: {}", e);
        }
        let device = &self.pools.shared.device;
        unsafe {
            if self.fence != vk::Fence::null() {
                device.destroy_fence(self.fence, None);
            }
            if self.command_buffer != vk::CommandBuffer::null() {
                device.free_command_buffers(self.pools.command_pool, &[self.command_buffer]);
            }
            if self.descriptor_set != vk::DescriptorSet::null() {
                let _ = device.free_descriptor_sets(self.pools.descriptor_pool, &[self.descriptor_set]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_valid_spirv() -> Vec<u8> {
        vec![
            0x03, 0x02, 0x23, 0x07, // magic
            0x00, 0x00, 0x01, 0x00, // version 1.0
            0x00, 0x00, 0x00, 0x00, // generator
            0x01, 0x00, 0x00, 0x00, // bound = 1
            0x00, 0x00, 0x00, 0x00, // reserved
        ]
    }

    #[test]
    fn test_valid_spirv_header() {
        assert!(validate_spirv(&make_valid_spirv()).is_ok());
    }

    #[test]
    fn test_spirv_rejections() {
        let mut bad_magic = make_valid_spirv();
        bad_magic[0] = 0;
        assert!(validate_spirv(&bad_magic).unwrap_err().contains("magic"));

        assert!(validate_spirv(&[0x03, 0x02, 0x23, 0x07])
            .unwrap_err()
            .contains("too small"));

        let mut unaligned = make_valid_spirv();
        unaligned.push(0);
        assert!(validate_spirv(&unaligned).unwrap_err().contains("aligned"));

        let mut zero_bound = make_valid_spirv();
        zero_bound[12] = 0;
        assert!(validate_spirv(&zero_bound).unwrap_err().contains("bound"));

        let mut future = make_valid_spirv();
        future[5] = 0x07;
        assert!(validate_spirv(&future).is_err());
    }

    #[test]
    fn test_capability_from_limits() {
        let mut props = vk::PhysicalDeviceProperties::default();
        props.vendor_id = 0x10DE;
        props.limits.max_compute_work_group_size = [1024, 1024, 64];
        props.limits.max_compute_work_group_invocations = 1024;
        props.limits.max_compute_shared_memory_size = 49152;

        let cap = capability_from_properties(&props, Some(32));
        assert_eq!(cap.vendor, GpuVendor::Nvidia);
        assert_eq!(cap.max_work_group_size, Dim3::new(1024, 1024, 64));
        assert_eq!(cap.subgroup_size, Some(32));
        assert!(cap.supports_local_memory);
        assert!(!cap.supports_async_subgroup_copy);
        assert!(cap.validate().is_ok());
    }

    #[test]
    #[ignore = "needs a Vulkan driver"]
    fn test_open_device() {
        let device = VulkanDevice::open_default(0).unwrap();
        assert!(device.capability().validate().is_ok());
        assert!(device.memory_heaps().iter().any(|&size| size > 0));
        let _queue = device.create_queue().unwrap();
    }

    #[test]
    #[ignore = "needs a Vulkan driver"]
    fn test_upload_round_trip() {
        let mut device = VulkanDevice::open_default(0).unwrap();
        let bytes: Vec<u8> = (0..64u8).collect();
        let buffer = device
            .allocate_linear_storage(&bytes, Precision::F32)
            .unwrap();
        assert_eq!(buffer.size(), 64);
        assert_eq!(buffer.precision(), Some(Precision::F32));
        assert_eq!(buffer.download().unwrap(), bytes);
        device.synchronize_uploads().unwrap();
    }

    #[test]
    #[ignore = "needs a Vulkan driver"]
    fn test_retained_allocation_outlives_buffer() {
        let device = VulkanDevice::open_default(0).unwrap();
        let buffer = device.create_storage_buffer(256).unwrap();
        // What a completion holds for each bound buffer.
        let retained = Arc::clone(&buffer.allocation);
        assert_eq!(Arc::strong_count(&retained), 2);
        drop(buffer);
        assert_eq!(Arc::strong_count(&retained), 1);
        drop(device);
        // The allocation keeps the device alive until it is released.
        assert_eq!(Arc::strong_count(&retained.shared), 1);
    }
}
