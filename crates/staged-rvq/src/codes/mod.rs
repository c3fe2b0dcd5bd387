//! Code sequences produced by encode and consumed by decode.
//!
//! A [`Codes`] value holds one row of `num_stages` digits per batch item,
//! stored row-major as `u32`. Digit `i` of a row selects the candidate chosen
//! at stage `i`. The type is serde-serializable so compressed payloads can be
//! stored alongside whatever persistence the caller uses.


use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{QuantizerError, QuantizerResult};

/// Integer code sequences of shape `(batch_size, num_stages)`.
///
/// Deserialization goes through [`Codes::new`], so a payload whose digit
/// count disagrees with its shape is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCodes")]
pub struct Codes {
    batch_size: usize,
    num_stages: usize,
    /// Row-major digits: `digits[item * num_stages + stage]`.
    digits: Vec<u32>,
}

/// Unchecked wire form of [`Codes`].
#[derive(Deserialize)]
struct RawCodes {
    batch_size: usize,
    num_stages: usize,
    digits: Vec<u32>,
}

impl TryFrom<RawCodes> for Codes {
    type Error = QuantizerError;

    fn try_from(raw: RawCodes) -> QuantizerResult<Self> {
        Codes::new(raw.batch_size, raw.num_stages, raw.digits)
    }
}

impl Codes {
    /// Build codes from row-major digits.
    ///
    /// # Errors
    /// - `QuantizerError::ShapeMismatch` if `digits.len() != batch_size * num_stages`
    pub fn new(batch_size: usize, num_stages: usize, digits: Vec<u32>) -> QuantizerResult<Self> {
        if batch_size.checked_mul(num_stages) != Some(digits.len()) {
            return Err(QuantizerError::ShapeMismatch {
                expected: vec![batch_size, num_stages],
                actual: vec![digits.len()],
            });
        }
        Ok(Self {
            batch_size,
            num_stages,
            digits,
        })
    }

    /// Codes with no stages: every row is empty.
    #[must_use]
    pub fn empty(batch_size: usize) -> Self {
        Self {
            batch_size,
            num_stages: 0,
            digits: Vec::new(),
        }
    }

    /// Interleave per-stage index columns into row-major codes.
    ///
    /// Every column must hold `batch_size` entries.
    pub(crate) fn from_stage_columns(batch_size: usize, columns: &[Vec<u32>]) -> Self {
        let num_stages = columns.len();
        let mut digits = Vec::with_capacity(batch_size * num_stages);
        for item in 0..batch_size {
            digits.extend(columns.iter().map(|column| column[item]));
        }
        Self {
            batch_size,
            num_stages,
            digits,
        }
    }

    /// `(batch_size, num_stages)`.
    #[inline]
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.batch_size, self.num_stages)
    }

    #[inline]
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[inline]
    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    /// Digit chosen for `item` at `stage`, if both are in range.
    #[must_use]
    pub fn get(&self, item: usize, stage: usize) -> Option<u32> {
        if item >= self.batch_size || stage >= self.num_stages {
            return None;
        }
        Some(self.digits[item * self.num_stages + stage])
    }

    /// The code sequence of one batch item.
    #[must_use]
    pub fn row(&self, item: usize) -> Option<&[u32]> {
        if item >= self.batch_size {
            return None;
        }
        let start = item * self.num_stages;
        Some(&self.digits[start..start + self.num_stages])
    }

    /// Iterate over per-item code sequences in batch order.
    pub fn rows(&self) -> impl Iterator<Item = &[u32]> + '_ {
        (0..self.batch_size).map(move |item| {
            let start = item * self.num_stages;
            &self.digits[start..start + self.num_stages]
        })
    }

    /// Digits selected at one stage, one per batch item.
    #[must_use]
    pub fn stage_column(&self, stage: usize) -> Option<Vec<u32>> {
        if stage >= self.num_stages {
            return None;
        }
        Some(self.rows().map(|row| row[stage]).collect())
    }

    /// Row-major digits.
    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.digits
    }

    /// Concatenate code batches with equal stage counts, preserving order.
    ///
    /// # Errors
    /// - `QuantizerError::StageCountMismatch` if stage counts differ
    pub fn concat(parts: &[Codes]) -> QuantizerResult<Self> {
        let num_stages = parts.first().map_or(0, Codes::num_stages);
        let mut batch_size = 0;
        let mut digits = Vec::new();
        for part in parts {
            if part.num_stages != num_stages {
                return Err(QuantizerError::StageCountMismatch {
                    expected: num_stages,
                    actual: part.num_stages,
                });
            }
            batch_size += part.batch_size;
            digits.extend_from_slice(&part.digits);
        }
        Ok(Self {
            batch_size,
            num_stages,
            digits,
        })
    }

    /// Convert to a `U32` tensor of shape `(batch_size, num_stages)`.
    pub fn to_tensor(&self, device: &Device) -> QuantizerResult<Tensor> {
        Tensor::from_vec(
            self.digits.clone(),
            (self.batch_size, self.num_stages),
            device,
        )
        .map_err(|e| QuantizerError::tensor("codes to tensor", e))
    }

    /// Read codes from a 2-D integer tensor of shape `(batch, num_stages)`.
    ///
    /// Accepts `U8`, `U32` and `I64` tensors.
    ///
    /// # Errors
    /// - `QuantizerError::InvalidCodeTensor` for wrong rank, a floating-point
    ///   dtype, or negative values
    pub fn from_tensor(codes: &Tensor) -> QuantizerResult<Self> {
        let (batch_size, num_stages) = match codes.dims() {
            &[b, n] => (b, n),
            dims => {
                return Err(QuantizerError::InvalidCodeTensor {
                    message: format!("expected rank 2 (batch, num_stages), got {:?}", dims),
                })
            }
        };
        match codes.dtype() {
            DType::U8 | DType::U32 | DType::I64 => {}
            other => {
                return Err(QuantizerError::InvalidCodeTensor {
                    message: format!("codes must be an integer tensor, got {:?}", other),
                })
            }
        }
        if num_stages == 0 {
            return Ok(Self::empty(batch_size));
        }

        let rows: Vec<Vec<u32>> = match codes.dtype() {
            DType::U32 => codes
                .to_vec2::<u32>()
                .map_err(|e| QuantizerError::tensor("read u32 codes", e))?,
            DType::U8 => codes
                .to_vec2::<u8>()
                .map_err(|e| QuantizerError::tensor("read u8 codes", e))?
                .into_iter()
                .map(|row| row.into_iter().map(u32::from).collect())
                .collect(),
            DType::I64 => {
                let rows = codes
                    .to_vec2::<i64>()
                    .map_err(|e| QuantizerError::tensor("read i64 codes", e))?;
                let mut converted = Vec::with_capacity(rows.len());
                for (item, row) in rows.into_iter().enumerate() {
                    let mut out = Vec::with_capacity(row.len());
                    for (stage, value) in row.into_iter().enumerate() {
                        let digit =
                            u32::try_from(value).map_err(|_| QuantizerError::InvalidCodeTensor {
                                message: format!(
                                    "value {} at item {}, stage {} is not a valid code",
                                    value, item, stage
                                ),
                            })?;
                        out.push(digit);
                    }
                    converted.push(out);
                }
                converted
            }
            other => {
                return Err(QuantizerError::InvalidCodeTensor {
                    message: format!("codes must be an integer tensor, got {:?}", other),
                })
            }
        };

        Ok(Self {
            batch_size,
            num_stages,
            digits: rows.into_iter().flatten().collect(),
        })
    }
}
