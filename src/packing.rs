//! Layout packer
//!
//! Rearranges OHWI weights into the blocked layout the convolution kernels
//! read, and pads the bias vector to the same output alignment.
//!
//! Packed weights are a sequence of vec4s, each holding 4 output-channel
//! lanes. From outermost to innermost:
//!
//! ```text
//! [dst_group][H][W][src_depth][block_z][4 input lanes] -> vec4(4 output lanes)
//! ```
//!
//! where `dst_group = aligned_dst_depth / block_z`. Output slice `d` lives at
//! group `d / block_z`, slot `d % block_z`. Lanes past the real input or
//! output channel counts are zero.

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{ConvError, Result};
use crate::shape::{align_by_n, divide_round_up, BiasTensor, Ohwi, WeightsTensor};

/// Storage precision of packed buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    F32,
    F16,
}

impl Precision {
    pub fn element_bytes(&self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F16 => 2,
        }
    }

    pub fn vec4_bytes(&self) -> usize {
        self.element_bytes() * 4
    }
}

/// Arithmetic precision of the whole operation.
///
/// `F32F16` computes in f16 but keeps f32 storage, so only `F16` packs
/// weights and biases as half floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CalculationsPrecision {
    #[default]
    F32,
    F32F16,
    F16,
}

impl CalculationsPrecision {
    pub fn storage(&self) -> Precision {
        match self {
            CalculationsPrecision::F16 => Precision::F16,
            CalculationsPrecision::F32 | CalculationsPrecision::F32F16 => Precision::F32,
        }
    }
}

impl std::str::FromStr for CalculationsPrecision {
    type Err = ConvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f32" => Ok(CalculationsPrecision::F32),
            "f32f16" | "f32_f16" => Ok(CalculationsPrecision::F32F16),
            "f16" => Ok(CalculationsPrecision::F16),
            other => Err(ConvError::InvalidProfile(format!(
                "unknown precision '{}' (expected f32, f32f16 or f16)",
                other
            ))),
        }
    }
}

/// Vec4 payload at one of the two storage precisions.
#[derive(Debug, Clone, PartialEq)]
pub enum PackedData {
    F32(Vec<[f32; 4]>),
    F16(Vec<[f16; 4]>),
}

impl PackedData {
    fn zeroed(precision: Precision, vec4_count: usize) -> Self {
        match precision {
            Precision::F32 => PackedData::F32(vec![[0.0; 4]; vec4_count]),
            Precision::F16 => PackedData::F16(vec![[f16::ZERO; 4]; vec4_count]),
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            PackedData::F32(_) => Precision::F32,
            PackedData::F16(_) => Precision::F16,
        }
    }

    /// Number of vec4 elements.
    pub fn len(&self) -> usize {
        match self {
            PackedData::F32(v) => v.len(),
            PackedData::F16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw little-endian bytes, as uploaded to the device.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PackedData::F32(v) => bytemuck::cast_slice(v),
            PackedData::F16(v) => bytemuck::cast_slice(v),
        }
    }

    /// One lane widened to f32.
    pub fn lane(&self, vec4_index: usize, lane: usize) -> f32 {
        match self {
            PackedData::F32(v) => v[vec4_index][lane],
            PackedData::F16(v) => v[vec4_index][lane].to_f32(),
        }
    }

    fn store(&mut self, vec4_index: usize, lane: usize, value: f32) {
        match self {
            PackedData::F32(v) => v[vec4_index][lane] = value,
            PackedData::F16(v) => v[vec4_index][lane] = f16::from_f32(value),
        }
    }
}

/// Geometry of a packed weight buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedLayout {
    pub h: u32,
    pub w: u32,
    pub src_depth: u32,
    pub dst_depth: u32,
    pub aligned_dst_depth: u32,
    pub block_z: u32,
}

impl PackedLayout {
    pub fn new(shape: Ohwi, block_z: u32) -> Result<Self> {
        if block_z == 0 {
            return Err(ConvError::shape("output block size must be positive"));
        }
        let dst_depth = divide_round_up(shape.o, 4);
        Ok(Self {
            h: shape.h,
            w: shape.w,
            src_depth: divide_round_up(shape.i, 4),
            dst_depth,
            aligned_dst_depth: align_by_n(dst_depth, block_z),
            block_z,
        })
    }

    /// `H * W * src_depth * aligned_dst_depth * 4`.
    pub fn vec4_count(&self) -> usize {
        self.h as usize
            * self.w as usize
            * self.src_depth as usize
            * self.aligned_dst_depth as usize
            * 4
    }

    pub fn byte_size(&self, precision: Precision) -> usize {
        self.vec4_count() * precision.vec4_bytes()
    }

    /// Position of the vec4 holding output slice `d`, input slice `s`, input
    /// lane `j` at kernel tap `(y, x)`.
    #[inline]
    pub fn vec4_index(&self, d: u32, y: u32, x: u32, s: u32, j: u32) -> usize {
        let group = (d / self.block_z) as usize;
        let slot = (d % self.block_z) as usize;
        let (h, w) = (self.h as usize, self.w as usize);
        let (src, bz) = (self.src_depth as usize, self.block_z as usize);
        ((((group * h + y as usize) * w + x as usize) * src + s as usize) * bz + slot) * 4
            + j as usize
    }
}

/// Weights in device layout, immutable once packed.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedWeights {
    pub layout: PackedLayout,
    pub data: PackedData,
}

impl PackedWeights {
    pub fn precision(&self) -> Precision {
        self.data.precision()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Length in vec4 elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bias in device layout: `aligned_dst_depth` vec4s, zero past `channels`.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedBias {
    pub channels: u32,
    pub data: PackedData,
}

impl PackedBias {
    pub fn precision(&self) -> Precision {
        self.data.precision()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bias of output channel `c` (zero in the padding).
    pub fn value(&self, c: usize) -> f32 {
        self.data.lane(c / 4, c % 4)
    }
}

/// Pack `weights` for an output-slice block of `block_z`.
pub fn pack_weights(
    weights: &WeightsTensor,
    block_z: u32,
    precision: Precision,
) -> Result<PackedWeights> {
    weights.validate()?;
    let shape = weights.shape;
    let layout = PackedLayout::new(shape, block_z)?;
    let mut data = PackedData::zeroed(precision, layout.vec4_count());

    let mut counter = 0usize;
    for group in 0..layout.aligned_dst_depth / layout.block_z {
        for y in 0..layout.h {
            for x in 0..layout.w {
                for s in 0..layout.src_depth {
                    for slot in 0..layout.block_z {
                        let d = group * layout.block_z + slot;
                        for j in 0..4 {
                            debug_assert_eq!(counter, layout.vec4_index(d, y, x, s, j));
                            let s_ch = s * 4 + j;
                            if s_ch < shape.i {
                                for lane in 0..4 {
                                    let d_ch = d * 4 + lane;
                                    if d_ch < shape.o {
                                        let value = weights.get(d_ch, y, x, s_ch);
                                        data.store(counter, lane as usize, value);
                                    }
                                }
                            }
                            counter += 1;
                        }
                    }
                }
            }
        }
    }

    log::debug!(
        "Packed weights {:?} -> {} vec4s ({} bytes, {:?}, aligned_dst_depth={})",
        shape,
        layout.vec4_count(),
        layout.byte_size(precision),
        precision,
        layout.aligned_dst_depth
    );

    Ok(PackedWeights { layout, data })
}

/// Pad `bias` to `aligned_dst_depth` vec4s. An empty bias packs as zeros.
pub fn pack_bias(
    bias: &BiasTensor,
    output_channels: u32,
    aligned_dst_depth: u32,
    precision: Precision,
) -> Result<PackedBias> {
    if !bias.data.is_empty() && bias.data.len() != output_channels as usize {
        return Err(ConvError::shape(format!(
            "bias has {} values, weights have {} output channels",
            bias.data.len(),
            output_channels
        )));
    }
    if aligned_dst_depth * 4 < output_channels {
        return Err(ConvError::shape(format!(
            "aligned depth {} cannot hold {} output channels",
            aligned_dst_depth, output_channels
        )));
    }

    let mut data = PackedData::zeroed(precision, aligned_dst_depth as usize);
    for (c, &value) in bias.data.iter().enumerate() {
        data.store(c / 4, c % 4, value);
    }

    Ok(PackedBias {
        channels: output_channels,
        data,
    })
}

/// Inverse of `pack_weights` for in-range indices. Values come back widened
/// to f32, so F16 buffers return the rounded weights.
pub fn unpack_weights(packed: &PackedWeights, shape: Ohwi) -> Result<WeightsTensor> {
    let expected = PackedLayout::new(shape, packed.layout.block_z)?;
    if expected != packed.layout {
        return Err(ConvError::shape(format!(
            "packed layout {:?} does not match weights {:?}",
            packed.layout, shape
        )));
    }

    let mut tensor = WeightsTensor::zeros(shape);
    for o in 0..shape.o {
        for y in 0..shape.h {
            for x in 0..shape.w {
                for i in 0..shape.i {
                    let index = packed.layout.vec4_index(o / 4, y, x, i / 4, i % 4);
                    tensor.data[shape.linear_index(o, y, x, i)] =
                        packed.data.lane(index, (o % 4) as usize);
                }
            }
        }
    }
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ramp(shape: Ohwi) -> WeightsTensor {
        let data = (0..shape.element_count()).map(|v| v as f32 + 1.0).collect();
        WeightsTensor::new(shape, data).unwrap()
    }

    #[test]
    fn test_explicit_block_pads_to_block() {
        let weights = ramp(Ohwi::new(8, 3, 3, 4));
        let packed = pack_weights(&weights, 4, Precision::F32).unwrap();
        assert_eq!(packed.layout.dst_depth, 2);
        // aligned to the block of 4 slices
        assert_eq!(packed.layout.aligned_dst_depth, 4);
        assert_eq!(packed.len(), 3 * 3 * 1 * 4 * 4);

        let packed = pack_weights(&weights, 2, Precision::F32).unwrap();
        assert_eq!(packed.layout.aligned_dst_depth, 2);
        assert_eq!(packed.len(), 72);
        assert_eq!(packed.as_bytes().len(), 72 * 16);
    }

    #[test]
    fn test_padding_lanes_zero_for_five_outputs() {
        let weights = ramp(Ohwi::new(5, 1, 1, 4));
        let packed = pack_weights(&weights, 2, Precision::F32).unwrap();
        assert_eq!(packed.layout.dst_depth, 2);
        assert_eq!(packed.layout.aligned_dst_depth, 2);

        for j in 0..4 {
            let second_slice = packed.layout.vec4_index(1, 0, 0, 0, j);
            assert_eq!(packed.data.lane(second_slice, 0), weights.get(4, 0, 0, j));
            for lane in 1..4 {
                assert_eq!(packed.data.lane(second_slice, lane), 0.0);
            }
        }

        let bias = BiasTensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let packed_bias = pack_bias(&bias, 5, 2, Precision::F32).unwrap();
        assert_eq!(packed_bias.len(), 2);
        for c in 0..5 {
            assert_eq!(packed_bias.value(c), (c + 1) as f32);
        }
        for c in 5..8 {
            assert_eq!(packed_bias.value(c), 0.0);
        }
    }

    #[test]
    fn test_explicit_element_order() {
        // O=4, H=W=1, I=2: one slice each way, a single vec4 per input lane.
        let weights = WeightsTensor::new(
            Ohwi::new(4, 1, 1, 2),
            vec![
                1.0, 2.0, // o=0
                3.0, 4.0, // o=1
                5.0, 6.0, // o=2
                7.0, 8.0, // o=3
            ],
        )
        .unwrap();
        let packed = pack_weights(&weights, 1, Precision::F32).unwrap();
        match &packed.data {
            PackedData::F32(v) => {
                assert_eq!(
                    v,
                    &vec![
                        [1.0, 3.0, 5.0, 7.0], // input lane 0
                        [2.0, 4.0, 6.0, 8.0], // input lane 1
                        [0.0; 4],
                        [0.0; 4],
                    ]
                );
            }
            other => panic!("expected f32 data, got {:?}", other.precision()),
        }
    }

    #[test]
    fn test_element_order_groups_output_slices() {
        // O=8, H=1, W=2, I=4 with two slices per block: both slices of a
        // tap sit next to each other before moving to the next tap.
        let weights = ramp(Ohwi::new(8, 1, 2, 4));
        let packed = pack_weights(&weights, 2, Precision::F32).unwrap();
        assert_eq!(packed.len(), 16);
        let v = match &packed.data {
            PackedData::F32(v) => v,
            other => panic!("expected f32 data, got {:?}", other.precision()),
        };

        // w[o, x, i] = o*8 + x*4 + i + 1
        assert_eq!(v[0], [1.0, 9.0, 17.0, 25.0]); // x=0, slice 0, lane 0
        assert_eq!(v[4], [33.0, 41.0, 49.0, 57.0]); // x=0, slice 1, lane 0
        assert_eq!(v[8], [5.0, 13.0, 21.0, 29.0]); // x=1, slice 0, lane 0
        assert_eq!(v[15], [40.0, 48.0, 56.0, 64.0]); // x=1, slice 1, lane 3

        for d in 0..2 {
            for x in 0..2 {
                for j in 0..4 {
                    let index = packed.layout.vec4_index(d, 0, x, 0, j);
                    for lane in 0..4 {
                        assert_eq!(
                            packed.data.lane(index, lane as usize),
                            weights.get(d * 4 + lane, 0, x, j)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_unpack_inverts_pack() {
        let shape = Ohwi::new(11, 3, 2, 7);
        let weights = ramp(shape);
        for block_z in [1, 2, 4, 8] {
            let packed = pack_weights(&weights, block_z, Precision::F32).unwrap();
            assert_eq!(unpack_weights(&packed, shape).unwrap(), weights);
        }
    }

    #[test]
    fn test_f16_matches_f32_within_rounding() {
        let shape = Ohwi::new(6, 2, 2, 5);
        let data = (0..shape.element_count())
            .map(|v| (v as f32 * 0.37).sin() * 3.0)
            .collect();
        let weights = WeightsTensor::new(shape, data).unwrap();

        let full = pack_weights(&weights, 2, Precision::F32).unwrap();
        let half = pack_weights(&weights, 2, Precision::F16).unwrap();
        assert_eq!(full.len(), half.len());
        assert_eq!(half.as_bytes().len() * 2, full.as_bytes().len());

        for index in 0..full.len() {
            for lane in 0..4 {
                let a = full.data.lane(index, lane);
                let b = half.data.lane(index, lane);
                assert!((a - b).abs() <= a.abs() * 1e-3 + 1e-4, "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_packing_is_deterministic() {
        let weights = ramp(Ohwi::new(9, 3, 3, 6));
        let a = pack_weights(&weights, 4, Precision::F16).unwrap();
        let b = pack_weights(&weights, 4, Precision::F16).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_bias_validation() {
        let bias = BiasTensor::new(vec![1.0; 3]);
        assert!(matches!(
            pack_bias(&bias, 5, 2, Precision::F32),
            Err(ConvError::InvalidShape(_))
        ));

        let packed = pack_bias(&BiasTensor::none(), 5, 2, Precision::F16).unwrap();
        assert_eq!(packed.as_bytes().len(), 2 * 8);
        assert!(packed.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_block_rejected() {
        let weights = ramp(Ohwi::new(4, 1, 1, 4));
        assert!(pack_weights(&weights, 0, Precision::F32).is_err());
    }

    #[test]
    fn test_unpack_rejects_mismatched_shape() {
        let packed = pack_weights(&ramp(Ohwi::new(8, 1, 1, 4)), 2, Precision::F32).unwrap();
        assert!(unpack_weights(&packed, Ohwi::new(8, 3, 3, 4)).is_err());
    }
}
