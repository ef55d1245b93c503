//! Write-side scaling: fitting physical values into a stored data type.
//!
//! A writer looks at the finite range of the data and the capability of the
//! target format (no scaling, slope only, slope and intercept) and picks the
//! `(slope, inter)` pair such that `stored = (value - inter) / slope` fits
//! the output type. Readers undo it with `value = stored * slope + inter`.

use crate::datatype::DataType;
use crate::error::{Error, Result};
use rayon::prelude::*;

/// What a target format can record about stored-value scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingCapability {
    /// Values must be stored as-is (Analyze 7.5, GIFTI, tractograms).
    None,
    /// A multiplicative factor only (SPM-style Analyze).
    Slope,
    /// Slope and intercept (NIfTI, PAR/REC).
    SlopeInter,
}

/// Chosen write scaling; `slope == 1, inter == 0` means values are cast directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteScaling {
    pub slope: f64,
    pub inter: f64,
}

impl Default for WriteScaling {
    fn default() -> Self {
        Self { slope: 1.0, inter: 0.0 }
    }
}

impl WriteScaling {
    pub fn is_identity(&self) -> bool {
        self.slope == 1.0 && self.inter == 0.0
    }

    /// Stored value for a physical value.
    #[inline]
    pub fn unapply(&self, value: f64) -> f64 {
        (value - self.inter) / self.slope
    }
}

/// Smallest and largest finite values; `None` when nothing is finite.
pub fn finite_range(values: &[f64]) -> Option<(f64, f64)> {
    let (mn, mx) = values
        .par_iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(
            || (f64::INFINITY, f64::NEG_INFINITY),
            |(mn, mx), v| (mn.min(v), mx.max(v)),
        )
        .reduce(
            || (f64::INFINITY, f64::NEG_INFINITY),
            |(a, b), (c, d)| (a.min(c), b.max(d)),
        );
    (mn <= mx).then_some((mn, mx))
}

/// Range of the output type that the f32 scale fields can also represent.
fn shared_range(out: DataType) -> (f64, f64) {
    let f32_max = f32::MAX as f64;
    (out.min_value().max(-f32_max), out.max_value().min(f32_max))
}

/// Scaling planner for one array and one target type.
#[derive(Debug, Clone)]
pub struct ArrayWriter {
    out_dtype: DataType,
    capability: ScalingCapability,
    source_is_float: bool,
    range: Option<(f64, f64)>,
}

impl ArrayWriter {
    /// `source_is_float` is the kind of the values before scaling: a scaled
    /// integer image counts as float data.
    pub fn new(
        values: &[f64],
        out_dtype: DataType,
        capability: ScalingCapability,
        source_is_float: bool,
    ) -> Self {
        Self {
            out_dtype,
            capability,
            source_is_float,
            range: finite_range(values),
        }
    }

    pub fn out_dtype(&self) -> DataType {
        self.out_dtype
    }

    /// Whether a plain cast would lose the data.
    pub fn scaling_needed(&self) -> bool {
        if self.out_dtype.is_float() {
            return false;
        }
        let Some((mn, mx)) = self.range else {
            return false;
        };
        if mn == 0.0 && mx == 0.0 {
            return false;
        }
        if self.source_is_float {
            // Integral floats that already fit cast exactly.
            let integral = mn.fract() == 0.0 && mx.fract() == 0.0;
            return !(integral && self.fits(mn, mx));
        }
        !self.fits(mn, mx)
    }

    fn fits(&self, mn: f64, mx: f64) -> bool {
        mn >= self.out_dtype.min_value() && mx <= self.out_dtype.max_value()
    }

    /// Compute the scaling for the writer's capability.
    pub fn scaling(&self) -> Result<WriteScaling> {
        if !self.scaling_needed() {
            return Ok(WriteScaling::default());
        }
        match self.capability {
            ScalingCapability::None => Err(Error::IncompatibleConversion(format!(
                "values need scaling to fit {} but the target stores no scale factors",
                self.out_dtype
            ))),
            ScalingCapability::Slope => self.slope_only(),
            ScalingCapability::SlopeInter => self.slope_inter(),
        }
    }

    fn slope_only(&self) -> Result<WriteScaling> {
        let Some((mn, mx)) = self.range else {
            return Ok(WriteScaling::default());
        };
        if !self.source_is_float && self.out_dtype.min_value() == 0.0 && mx <= 0.0 {
            let (_, shared_max) = shared_range(self.out_dtype);
            if mn.abs() <= shared_max {
                return Ok(WriteScaling { slope: -1.0, inter: 0.0 });
            }
        }
        self.range_scale_slope(mn, mx)
    }

    fn range_scale_slope(&self, mn: f64, mx: f64) -> Result<WriteScaling> {
        let (shared_min, shared_max) = shared_range(self.out_dtype);
        let slope = if self.out_dtype.min_value() == 0.0 {
            if mn < 0.0 && mx > 0.0 {
                return Err(Error::Scaling(format!(
                    "cannot scale negative and positive values to {} without an intercept",
                    self.out_dtype
                )));
            }
            if mx <= 0.0 {
                mn / shared_max
            } else {
                mx / shared_max
            }
        } else {
            (mx / shared_max).max(mn / shared_min)
        };
        finite(WriteScaling { slope, inter: 0.0 })
    }

    fn slope_inter(&self) -> Result<WriteScaling> {
        let Some((mn, mx)) = self.range else {
            return Ok(WriteScaling::default());
        };
        if !self.source_is_float && self.out_dtype.min_value() == 0.0 {
            let (_, shared_max) = shared_range(self.out_dtype);
            if mx - mn <= shared_max {
                return Ok(WriteScaling { slope: 1.0, inter: mn });
            }
            if mx <= 0.0 && mn.abs() <= shared_max {
                return Ok(WriteScaling { slope: -1.0, inter: 0.0 });
            }
        }
        if mx == mn {
            return Ok(WriteScaling { slope: 1.0, inter: mn });
        }
        let (shared_min, shared_max) = shared_range(self.out_dtype);
        let slope = (mx - mn) / (shared_max - shared_min);
        finite(WriteScaling {
            slope,
            inter: mn - shared_min * slope,
        })
    }

    /// Scale, clip to the writable range, and replace NaN with zero for
    /// integer outputs.
    pub fn apply(&self, values: &[f64], scaling: &WriteScaling) -> Vec<f64> {
        let integer = !self.out_dtype.is_float();
        let (lo, hi) = (self.out_dtype.min_value(), self.out_dtype.max_value());
        let map = |&v: &f64| {
            let s = if scaling.is_identity() { v } else { scaling.unapply(v) };
            if integer {
                if s.is_nan() {
                    0.0
                } else {
                    s.round().clamp(lo, hi)
                }
            } else {
                s
            }
        };
        values.par_iter().map(map).collect()
    }
}

fn finite(scaling: WriteScaling) -> Result<WriteScaling> {
    if scaling.slope.is_finite() && scaling.inter.is_finite() && scaling.slope != 0.0 {
        Ok(scaling)
    } else {
        Err(Error::Scaling(format!(
            "slope {} / intercept {} not both finite",
            scaling.slope, scaling.inter
        )))
    }
}
