//! Python bindings
//!
//! Exposes tiling selection, plan reports and weight packing to Python.
//! Vulkan device handles stay on the Rust side.
//!
//! # Python Example
//!
//! ```python
//! from hlx_conv import ConvPlanner, pack_weights
//!
//! planner = ConvPlanner("nvidia", precision="f16")
//! print(planner.plan_conv2d(32, 16, kernel=(3, 3), output=(1, 56, 56)))
//!
//! packed = pack_weights(8, 3, 3, 4, weights, block_z=2, precision="f32")
//! ```

use std::path::Path;

use pyo3::prelude::*;
use pyo3::types::PyBytes;

use crate::conv::{ConvOperation, OperationDef};
use crate::device::{DeviceCapability, GpuVendor};
use crate::host::HostContext;
use crate::packing::{self, CalculationsPrecision};
use crate::shape::{Bhwc, Conv2dAttributes, FullyConnectedAttributes, Hw, Ohwi, Padding, WeightsTensor};

/// Plans convolutions for one device profile.
#[pyclass]
pub struct ConvPlanner {
    capability: DeviceCapability,
    def: OperationDef,
}

#[pymethods]
impl ConvPlanner {
    /// Create a planner for one device profile.
    ///
    /// # Arguments
    ///
    /// * `device` - Vendor name ("nvidia", "powervr", "adreno", ...) or a
    ///   path to a JSON device profile
    /// * `precision` - "f32", "f32f16" or "f16" (default: "f32")
    /// * `batch_support` - Plan kernels that fold the batch into the width
    ///
    /// # Raises
    ///
    /// * `ValueError` - If the profile or precision cannot be parsed
    #[new]
    #[pyo3(signature = (device, precision="f32", batch_support=false))]
    pub fn new(device: &str, precision: &str, batch_support: bool) -> PyResult<Self> {
        let capability = match device.parse::<GpuVendor>() {
            Ok(vendor) => DeviceCapability::preset(vendor),
            Err(_) => DeviceCapability::load(Path::new(device))?,
        };
        let mut def = OperationDef::new(precision.parse::<CalculationsPrecision>()?);
        def.batch_support = batch_support;
        Ok(Self { capability, def })
    }

    /// Device name from the profile.
    #[getter]
    pub fn device_name(&self) -> String {
        self.capability.name.clone()
    }

    /// Plan a 2-D convolution.
    ///
    /// # Arguments
    ///
    /// * `output_channels`, `input_channels` - Channel counts of the weights
    /// * `kernel`, `strides`, `dilations` - `(height, width)` pairs
    /// * `padding` - Symmetric `(height, width)` padding
    /// * `output` - Optional `(batch, height, width)` of the output; adds the
    ///   dispatch geometry to the plan
    ///
    /// # Returns
    ///
    /// The plan as a JSON string: tiling, packed buffer sizes, compiler
    /// options and, with `output`, the dispatch grid.
    ///
    /// # Raises
    ///
    /// * `ValueError` - If the shape is invalid
    /// * `RuntimeError` - If the device cannot run the convolution
    #[pyo3(signature = (
        output_channels,
        input_channels,
        kernel=(1, 1),
        strides=(1, 1),
        dilations=(1, 1),
        padding=(0, 0),
        output=None
    ))]
    #[allow(clippy::too_many_arguments)]
    pub fn plan_conv2d(
        &self,
        output_channels: u32,
        input_channels: u32,
        kernel: (u32, u32),
        strides: (u32, u32),
        dilations: (u32, u32),
        padding: (u32, u32),
        output: Option<(u32, u32, u32)>,
    ) -> PyResult<String> {
        let attr = Conv2dAttributes {
            weights: Ohwi::new(output_channels, kernel.0, kernel.1, input_channels),
            strides: Hw::new(strides.0, strides.1),
            dilations: Hw::new(dilations.0, dilations.1),
            padding: Padding::symmetric(padding.0, padding.1),
        };
        let op: ConvOperation<HostContext> = ConvOperation::conv2d(self.def, &attr, &self.capability)?;
        let output = output.map(|(b, h, w)| Bhwc::new(b, h, w, output_channels));
        let plan = op.plan(output.as_ref())?;
        Ok(serde_json::to_string_pretty(&plan).map_err(crate::error::ConvError::from)?)
    }

    /// Plan a fully-connected layer, run as a 1x1 convolution.
    ///
    /// # Arguments
    ///
    /// * `output_channels`, `input_channels` - Layer width
    /// * `batch` - Optional row count; adds the dispatch geometry
    ///
    /// # Returns
    ///
    /// The plan as a JSON string.
    ///
    /// # Raises
    ///
    /// * `ValueError` - If the shape is invalid
    #[pyo3(signature = (output_channels, input_channels, batch=None))]
    pub fn plan_fully_connected(
        &self,
        output_channels: u32,
        input_channels: u32,
        batch: Option<u32>,
    ) -> PyResult<String> {
        let attr = FullyConnectedAttributes::new(output_channels, input_channels);
        let op: ConvOperation<HostContext> =
            ConvOperation::fully_connected(self.def, &attr, &self.capability)?;
        let output = batch.map(|b| Bhwc::new(b, 1, 1, output_channels));
        let plan = op.plan(output.as_ref())?;
        Ok(serde_json::to_string_pretty(&plan).map_err(crate::error::ConvError::from)?)
    }
}

/// Pack OHWI weights into the device layout.
///
/// # Arguments
///
/// * `o`, `h`, `w`, `i` - Weight shape
/// * `data` - Row-major OHWI values, `o * h * w * i` of them
/// * `block_z` - Output slices per block, as chosen by the planner
/// * `precision` - "f32", "f32f16" or "f16" (default: "f32")
///
/// # Returns
///
/// Packed bytes, zero-padded to the aligned output depth.
///
/// # Raises
///
/// * `ValueError` - If the shape, data length or precision is invalid
#[pyfunction]
#[pyo3(signature = (o, h, w, i, data, block_z, precision="f32"))]
#[allow(clippy::too_many_arguments)]
pub fn pack_weights<'py>(
    py: Python<'py>,
    o: u32,
    h: u32,
    w: u32,
    i: u32,
    data: Vec<f32>,
    block_z: u32,
    precision: &str,
) -> PyResult<Bound<'py, PyBytes>> {
    let storage = precision.parse::<CalculationsPrecision>()?.storage();
    let weights = WeightsTensor::new(Ohwi::new(o, h, w, i), data)?;
    let packed = packing::pack_weights(&weights, block_z, storage)?;
    Ok(PyBytes::new_bound(py, packed.as_bytes()))
}

#[pymodule]
fn hlx_conv(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<ConvPlanner>()?;
    m.add_function(wrap_pyfunction!(pack_weights, m)?)?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
