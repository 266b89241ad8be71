//! Shapes, attributes and host tensors
//!
//! Channel counts are grouped into slices of 4 ("depth") everywhere below:
//! `src_depth = ceil(I / 4)`, `dst_depth = ceil(O / 4)`.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};

use crate::error::{ConvError, Result};

/// Largest extent any tensor axis may have. Kernels address tensors with
/// signed 32-bit indices, including the batched width `W * B`.
pub const MAX_EXTENT: u32 = i32::MAX as u32;

/// Integer division rounding towards positive infinity.
#[inline]
pub fn divide_round_up(n: u32, divisor: u32) -> u32 {
    n.div_ceil(divisor)
}

fn check_extent(name: &str, value: u64) -> Result<()> {
    if value > MAX_EXTENT as u64 {
        return Err(ConvError::shape(format!(
            "{} of {} exceeds the maximum extent {}",
            name, value, MAX_EXTENT
        )));
    }
    Ok(())
}

/// Round `n` up to the next multiple of `multiple`.
#[inline]
pub fn align_by_n(n: u32, multiple: u32) -> u32 {
    divide_round_up(n, multiple) * multiple
}

/// Three unsigned components addressed as x/y/z or by axis index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn product(&self) -> u32 {
        self.x * self.y * self.z
    }

    pub fn min_component(&self) -> u32 {
        self.x.min(self.y).min(self.z)
    }

    /// True if the components are exactly {0, 1, 2} in some order.
    pub fn is_axis_permutation(&self) -> bool {
        let mut seen = [false; 3];
        for axis in 0..3 {
            match seen.get_mut(self[axis] as usize) {
                Some(slot) if !*slot => *slot = true,
                _ => return false,
            }
        }
        true
    }
}

impl Index<usize> for Dim3 {
    type Output = u32;

    fn index(&self, axis: usize) -> &u32 {
        match axis {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("Dim3 axis out of range: {}", axis),
        }
    }
}

impl IndexMut<usize> for Dim3 {
    fn index_mut(&mut self, axis: usize) -> &mut u32 {
        match axis {
            0 => &mut self.x,
            1 => &mut self.y,
            2 => &mut self.z,
            _ => panic!("Dim3 axis out of range: {}", axis),
        }
    }
}

impl std::fmt::Display for Dim3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Packed signed 4-tuple passed to kernels as a scalar argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable, Serialize, Deserialize)]
pub struct Int4 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub w: i32,
}

impl Int4 {
    pub const fn new(x: i32, y: i32, z: i32, w: i32) -> Self {
        Self { x, y, z, w }
    }
}

/// Height/width pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hw {
    pub h: u32,
    pub w: u32,
}

impl Hw {
    pub const fn new(h: u32, w: u32) -> Self {
        Self { h, w }
    }
}

impl Default for Hw {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Padding {
    pub prepended: Hw,
    pub appended: Hw,
}

impl Padding {
    pub const fn none() -> Self {
        Self {
            prepended: Hw::new(0, 0),
            appended: Hw::new(0, 0),
        }
    }

    pub const fn symmetric(h: u32, w: u32) -> Self {
        Self {
            prepended: Hw::new(h, w),
            appended: Hw::new(h, w),
        }
    }
}

impl Default for Padding {
    fn default() -> Self {
        Self::none()
    }
}

/// Activation tensor shape (batch, height, width, channels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bhwc {
    pub b: u32,
    pub h: u32,
    pub w: u32,
    pub c: u32,
}

impl Bhwc {
    pub const fn new(b: u32, h: u32, w: u32, c: u32) -> Self {
        Self { b, h, w, c }
    }

    pub fn slices(&self) -> u32 {
        divide_round_up(self.c, 4)
    }

    /// `(W * B, H, slices, B)`, the size layout kernels receive.
    pub fn w_batched_hsb(&self) -> Int4 {
        Int4::new(
            (self.w * self.b) as i32,
            self.h as i32,
            self.slices() as i32,
            self.b as i32,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.b == 0 || self.h == 0 || self.w == 0 || self.c == 0 {
            return Err(ConvError::shape(format!(
                "tensor dimensions must be positive, got {:?}",
                self
            )));
        }
        check_extent("height", self.h as u64)?;
        check_extent("channels", self.c as u64)?;
        check_extent("batched width", self.w as u64 * self.b as u64)
    }
}

/// Weight tensor shape (output channels, height, width, input channels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ohwi {
    pub o: u32,
    pub h: u32,
    pub w: u32,
    pub i: u32,
}

impl Ohwi {
    pub const fn new(o: u32, h: u32, w: u32, i: u32) -> Self {
        Self { o, h, w, i }
    }

    pub fn element_count(&self) -> usize {
        self.o as usize * self.h as usize * self.w as usize * self.i as usize
    }

    #[inline]
    pub fn linear_index(&self, o: u32, y: u32, x: u32, i: u32) -> usize {
        (((o as usize * self.h as usize + y as usize) * self.w as usize + x as usize)
            * self.i as usize)
            + i as usize
    }
}

/// Host copy of a weight tensor in OHWI order.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightsTensor {
    pub shape: Ohwi,
    pub data: Vec<f32>,
}

impl WeightsTensor {
    pub fn new(shape: Ohwi, data: Vec<f32>) -> Result<Self> {
        let tensor = Self { shape, data };
        tensor.validate()?;
        Ok(tensor)
    }

    pub fn zeros(shape: Ohwi) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.element_count()],
        }
    }

    #[inline]
    pub fn get(&self, o: u32, y: u32, x: u32, i: u32) -> f32 {
        self.data[self.shape.linear_index(o, y, x, i)]
    }

    pub fn validate(&self) -> Result<()> {
        let s = self.shape;
        if s.o == 0 || s.h == 0 || s.w == 0 || s.i == 0 {
            return Err(ConvError::shape(format!(
                "weight dimensions must be positive, got {:?}",
                s
            )));
        }
        let extents = [
            ("output channels", s.o),
            ("height", s.h),
            ("width", s.w),
            ("input channels", s.i),
        ];
        for (name, value) in extents {
            check_extent(name, value as u64)?;
        }
        let element_count = [s.o, s.h, s.w, s.i]
            .iter()
            .try_fold(1usize, |acc, &v| acc.checked_mul(v as usize))
            .ok_or_else(|| ConvError::shape(format!("weights {:?} are too large to address", s)))?;
        if self.data.len() != element_count {
            return Err(ConvError::shape(format!(
                "weight data has {} elements, shape {:?} needs {}",
                self.data.len(),
                s,
                element_count
            )));
        }
        Ok(())
    }
}

/// Host copy of a bias vector. Empty means the convolution has no bias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BiasTensor {
    pub data: Vec<f32>,
}

impl BiasTensor {
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    pub fn none() -> Self {
        Self { data: Vec::new() }
    }
}

/// Which public constructor produced a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvKind {
    Convolution2D,
    FullyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dAttributes {
    pub weights: Ohwi,
    pub strides: Hw,
    pub dilations: Hw,
    pub padding: Padding,
}

impl Conv2dAttributes {
    /// Unit stride/dilation, no padding.
    pub fn simple(weights: Ohwi) -> Self {
        Self {
            weights,
            strides: Hw::default(),
            dilations: Hw::default(),
            padding: Padding::none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullyConnectedAttributes {
    /// `h` and `w` must both be 1.
    pub weights: Ohwi,
}

impl FullyConnectedAttributes {
    pub fn new(output_channels: u32, input_channels: u32) -> Self {
        Self {
            weights: Ohwi::new(output_channels, 1, 1, input_channels),
        }
    }
}

/// Everything the tiling selector needs to know about one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemShape {
    pub kind: ConvKind,
    pub input_channels: u32,
    pub output_channels: u32,
    pub kernel: Hw,
    pub strides: Hw,
    pub dilations: Hw,
    pub padding: Padding,
    /// Output spatial size, when known ahead of time.
    #[serde(default)]
    pub output_hint: Option<Hw>,
}

impl ProblemShape {
    pub fn from_conv2d(attr: &Conv2dAttributes) -> Self {
        Self {
            kind: ConvKind::Convolution2D,
            input_channels: attr.weights.i,
            output_channels: attr.weights.o,
            kernel: Hw::new(attr.weights.h, attr.weights.w),
            strides: attr.strides,
            dilations: attr.dilations,
            padding: attr.padding,
            output_hint: None,
        }
    }

    pub fn from_fully_connected(attr: &FullyConnectedAttributes) -> Self {
        Self {
            kind: ConvKind::FullyConnected,
            input_channels: attr.weights.i,
            output_channels: attr.weights.o,
            kernel: Hw::new(attr.weights.h, attr.weights.w),
            strides: Hw::default(),
            dilations: Hw::default(),
            padding: Padding::none(),
            output_hint: None,
        }
    }

    pub fn with_output_hint(mut self, output: Hw) -> Self {
        self.output_hint = Some(output);
        self
    }

    pub fn src_depth(&self) -> u32 {
        divide_round_up(self.input_channels, 4)
    }

    pub fn dst_depth(&self) -> u32 {
        divide_round_up(self.output_channels, 4)
    }

    pub fn is_fully_connected(&self) -> bool {
        self.kind == ConvKind::FullyConnected
    }

    pub fn x_kernel_is_1(&self) -> bool {
        self.kernel.w == 1
            && self.strides.w == 1
            && self.dilations.w == 1
            && self.padding.prepended.w == 0
            && self.padding.appended.w == 0
    }

    pub fn y_kernel_is_1(&self) -> bool {
        self.kernel.h == 1
            && self.strides.h == 1
            && self.dilations.h == 1
            && self.padding.prepended.h == 0
            && self.padding.appended.h == 0
    }

    /// Weight tensor shape this problem expects.
    pub fn weights_shape(&self) -> Ohwi {
        Ohwi::new(
            self.output_channels,
            self.kernel.h,
            self.kernel.w,
            self.input_channels,
        )
    }

    /// Spatial output size for a given input size.
    pub fn output_size(&self, input: Hw) -> Result<Hw> {
        self.validate()?;
        let axis = |len: u32, pre: u32, app: u32, k: u32, d: u32, s: u32| -> Option<u32> {
            let padded = len as u64 + pre as u64 + app as u64;
            let span = d as u64 * (k as u64 - 1) + 1;
            let out = padded.checked_sub(span)? / s as u64 + 1;
            (out <= MAX_EXTENT as u64).then_some(out as u32)
        };
        let p = &self.padding;
        let h = axis(
            input.h,
            p.prepended.h,
            p.appended.h,
            self.kernel.h,
            self.dilations.h,
            self.strides.h,
        );
        let w = axis(
            input.w,
            p.prepended.w,
            p.appended.w,
            self.kernel.w,
            self.dilations.w,
            self.strides.w,
        );
        match (h, w) {
            (Some(h), Some(w)) => Ok(Hw::new(h, w)),
            _ => Err(ConvError::shape(format!(
                "kernel {:?} with dilation {:?} does not fit padded input {:?}",
                self.kernel, self.dilations, input
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_channels == 0 || self.output_channels == 0 {
            return Err(ConvError::shape(format!(
                "channel counts must be positive (in={}, out={})",
                self.input_channels, self.output_channels
            )));
        }
        check_extent("input channels", self.input_channels as u64)?;
        check_extent("output channels", self.output_channels as u64)?;
        let spatial = [
            ("kernel", self.kernel),
            ("stride", self.strides),
            ("dilation", self.dilations),
        ];
        for (name, hw) in spatial {
            if hw.h == 0 || hw.w == 0 {
                return Err(ConvError::shape(format!(
                    "{} must be at least 1x1, got {}x{}",
                    name, hw.h, hw.w
                )));
            }
            check_extent(name, hw.h.max(hw.w) as u64)?;
        }
        let p = &self.padding;
        let widest_pad = p.prepended.h.max(p.prepended.w).max(p.appended.h).max(p.appended.w);
        check_extent("padding", widest_pad as u64)?;
        if self.is_fully_connected() && (self.kernel.h != 1 || self.kernel.w != 1) {
            return Err(ConvError::shape(format!(
                "fully connected weights must be 1x1 spatially, got {}x{}",
                self.kernel.h, self.kernel.w
            )));
        }
        if let Some(hint) = self.output_hint {
            if hint.h == 0 || hint.w == 0 {
                return Err(ConvError::shape("output hint must be positive"));
            }
            check_extent("output hint", hint.h.max(hint.w) as u64)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_helpers() {
        assert_eq!(divide_round_up(5, 4), 2);
        assert_eq!(divide_round_up(8, 4), 2);
        assert_eq!(align_by_n(3, 4), 4);
        assert_eq!(align_by_n(8, 4), 8);
        assert_eq!(align_by_n(1, 1), 1);
    }

    #[test]
    fn test_extents_beyond_i32_are_rejected() {
        let fc = ProblemShape::from_fully_connected(&FullyConnectedAttributes::new(u32::MAX, 16));
        assert!(matches!(fc.validate(), Err(ConvError::InvalidShape(_))));

        let mut attr = Conv2dAttributes::simple(Ohwi::new(8, 3, 3, 4));
        attr.padding = Padding::symmetric(u32::MAX, 0);
        assert!(ProblemShape::from_conv2d(&attr).validate().is_err());

        assert!(Bhwc::new(4, 8, 1 << 30, 4).validate().is_err());
        assert!(Bhwc::new(1, 8, 1 << 30, 4).validate().is_ok());

        let huge = WeightsTensor {
            shape: Ohwi::new(1 << 30, 1 << 30, 1 << 30, 1 << 30),
            data: Vec::new(),
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_axis_permutation() {
        assert!(Dim3::new(2, 0, 1).is_axis_permutation());
        assert!(Dim3::new(0, 1, 2).is_axis_permutation());
        assert!(!Dim3::new(0, 0, 1).is_axis_permutation());
        assert!(!Dim3::new(0, 1, 3).is_axis_permutation());
    }

    #[test]
    fn test_unit_kernel_flags() {
        let mut attr = Conv2dAttributes::simple(Ohwi::new(8, 1, 3, 4));
        let shape = ProblemShape::from_conv2d(&attr);
        assert!(!shape.x_kernel_is_1());
        assert!(shape.y_kernel_is_1());

        attr.strides = Hw::new(2, 1);
        let shape = ProblemShape::from_conv2d(&attr);
        assert!(!shape.y_kernel_is_1());
    }

    #[test]
    fn test_output_size() {
        let mut attr = Conv2dAttributes::simple(Ohwi::new(8, 3, 3, 4));
        attr.padding = Padding::symmetric(1, 1);
        let shape = ProblemShape::from_conv2d(&attr);
        assert_eq!(shape.output_size(Hw::new(16, 16)).unwrap(), Hw::new(16, 16));

        attr.strides = Hw::new(2, 2);
        let shape = ProblemShape::from_conv2d(&attr);
        assert_eq!(shape.output_size(Hw::new(16, 16)).unwrap(), Hw::new(8, 8));

        let shape = ProblemShape::from_conv2d(&Conv2dAttributes::simple(Ohwi::new(8, 5, 5, 4)));
        assert!(shape.output_size(Hw::new(3, 3)).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_channels() {
        let shape = ProblemShape::from_fully_connected(&FullyConnectedAttributes::new(0, 16));
        assert!(matches!(shape.validate(), Err(ConvError::InvalidShape(_))));
    }

    #[test]
    fn test_weights_tensor_length_checked() {
        let err = WeightsTensor::new(Ohwi::new(2, 1, 1, 2), vec![0.0; 3]).unwrap_err();
        assert!(err.to_string().contains("needs 4"));
    }

    #[test]
    fn test_w_batched_size() {
        let shape = Bhwc::new(2, 7, 5, 9);
        assert_eq!(shape.w_batched_hsb(), Int4::new(10, 7, 3, 2));
    }
}
