// src/aggregate.rs
//
// =============================================================================
// PULSELAB: AGGREGATION ENGINE (v 0.3 )
// =============================================================================
//
// Raw blocks in, one dataset out.
//
// Axes of the output, outermost first:
//   [channel group][dynamic step][row][sample]
// - channel group: frames split round-robin into `reference_channels` groups
//   (one group when reference_channels is 0).
// - row: `sum` keeps one row per step; `spread` keeps every frame of the group.
// - sample: pixels/samples within one frame (1 under live compression).
//
// The engine is pure: same blocks + same DataSpec => bit-identical output.

use crate::core::{AveragingMode, DataSpec};
use crate::error::JobError;

use serde::{Deserialize, Serialize};

// ============================================================================
// 1. RAW DATA
// ============================================================================

/// What a sensor hands back from one acquisition: `frames` frames of
/// `frame_len` samples, frame-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Frames {
    frames: usize,
    frame_len: usize,
    data: Vec<f64>,
}

impl Frames {
    pub fn new(frames: usize, frame_len: usize, data: Vec<f64>) -> Result<Self, String> {
        if frames == 0 || frame_len == 0 {
            return Err(format!("empty acquisition ({} x {})", frames, frame_len));
        }
        if data.len() != frames * frame_len {
            return Err(format!(
                "acquisition holds {} samples, expected {} x {}",
                data.len(),
                frames,
                frame_len
            ));
        }
        Ok(Self {
            frames,
            frame_len,
            data,
        })
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn frame(&self, i: usize) -> &[f64] {
        &self.data[i * self.frame_len..(i + 1) * self.frame_len]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Each frame reduced to the mean of its samples.
    pub fn compressed(&self) -> Frames {
        let data = (0..self.frames)
            .map(|i| {
                let f = self.frame(i);
                f.iter().sum::<f64>() / f.len() as f64
            })
            .collect();
        Frames {
            frames: self.frames,
            frame_len: 1,
            data,
        }
    }
}

/// One acquisition, tagged with where in the sweep it was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSampleBlock {
    pub step: usize,
    pub average: usize,
    pub frames: Frames,
}

// ============================================================================
// 2. THE DATASET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDataset {
    pub mode: AveragingMode,
    /// `[channel groups, steps, rows, samples]`
    pub shape: [usize; 4],
    pub values: Vec<f64>,
    /// `group0 / group1` per element, shape `[steps, rows, samples]`.
    /// Present only with exactly two reference channels.
    pub normalized: Option<Vec<f64>>,
    pub warnings: Vec<String>,
}

impl ResultDataset {
    pub fn channels(&self) -> usize {
        self.shape[0]
    }

    pub fn steps(&self) -> usize {
        self.shape[1]
    }

    pub fn rows_per_step(&self) -> usize {
        self.shape[2]
    }

    pub fn samples(&self) -> usize {
        self.shape[3]
    }

    fn offset(&self, channel: usize, step: usize, row: usize) -> usize {
        ((channel * self.shape[1] + step) * self.shape[2] + row) * self.shape[3]
    }

    /// Samples of one row.
    pub fn row(&self, channel: usize, step: usize, row: usize) -> &[f64] {
        let start = self.offset(channel, step, row);
        &self.values[start..start + self.shape[3]]
    }

    /// All rows of one step for one channel group, flattened.
    pub fn step(&self, channel: usize, step: usize) -> &[f64] {
        let start = self.offset(channel, step, 0);
        &self.values[start..start + self.shape[2] * self.shape[3]]
    }

    /// Precision-reduced copy for storage.
    ///
    /// `compress` rounds every value to the nearest `f32`. Finite values beyond
    /// the `f32` range are refused rather than saturated to infinity.
    pub fn stored(&self, compress: bool) -> Result<StoredDataset, JobError> {
        let values = if compress {
            StoredValues::F32(narrow(&self.values)?)
        } else {
            StoredValues::F64(self.values.clone())
        };
        let normalized = match (&self.normalized, compress) {
            (None, _) => None,
            (Some(n), true) => Some(StoredValues::F32(narrow(n)?)),
            (Some(n), false) => Some(StoredValues::F64(n.clone())),
        };
        Ok(StoredDataset {
            mode: self.mode,
            shape: self.shape,
            values,
            normalized,
        })
    }
}

fn narrow(values: &[f64]) -> Result<Vec<f32>, JobError> {
    values
        .iter()
        .map(|&v| {
            if v.is_finite() && v.abs() > f32::MAX as f64 {
                Err(JobError::Aggregation(format!(
                    "value {} does not fit the compressed (f32) representation",
                    v
                )))
            } else {
                Ok(v as f32)
            }
        })
        .collect()
}

/// On-disk form written by `storage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDataset {
    pub mode: AveragingMode,
    pub shape: [usize; 4],
    pub values: StoredValues,
    pub normalized: Option<StoredValues>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValues {
    F64(Vec<f64>),
    F32(Vec<f32>),
}

impl StoredValues {
    pub fn len(&self) -> usize {
        match self {
            StoredValues::F64(v) => v.len(),
            StoredValues::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            StoredValues::F64(v) => v.clone(),
            StoredValues::F32(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }
}

// ============================================================================
// 3. THE REDUCTION
// ============================================================================

/// Reduces a finished job's raw buffer.
///
/// Fails (never truncates) when the buffer does not hold exactly one block
/// per (step, average) pair, or when block geometry is inconsistent.
pub fn aggregate(
    blocks: &[RawSampleBlock],
    spec: &DataSpec,
    averages: usize,
) -> Result<ResultDataset, JobError> {
    let steps = spec.dynamic_steps;
    if steps == 0 || averages == 0 {
        return Err(JobError::Aggregation(format!(
            "degenerate sweep: {} steps x {} averages",
            steps, averages
        )));
    }
    let expected = steps.checked_mul(averages).ok_or_else(|| {
        JobError::Aggregation(format!("{} steps x {} averages overflows", steps, averages))
    })?;
    if blocks.len() != expected {
        return Err(JobError::Aggregation(format!(
            "raw buffer holds {} blocks, expected {} ({} steps x {} averages)",
            blocks.len(),
            expected,
            steps,
            averages
        )));
    }

    // Place every block on the (step, average) grid, refusing gaps and doubles.
    let mut grid: Vec<Option<Frames>> = vec![None; expected];
    for b in blocks {
        if b.step >= steps || b.average >= averages {
            return Err(JobError::Aggregation(format!(
                "block tagged (step {}, average {}) lies outside the sweep",
                b.step, b.average
            )));
        }
        let slot = &mut grid[b.step * averages + b.average];
        if slot.is_some() {
            return Err(JobError::Aggregation(format!(
                "duplicate block for (step {}, average {})",
                b.step, b.average
            )));
        }
        *slot = Some(if spec.live_compression {
            b.frames.compressed()
        } else {
            b.frames.clone()
        });
    }
    let grid: Vec<Frames> = grid.into_iter().flatten().collect();

    let frames = grid[0].frames();
    let samples = grid[0].frame_len();
    if let Some(odd) = grid
        .iter()
        .find(|f| f.frames() != frames || f.frame_len() != samples)
    {
        return Err(JobError::Aggregation(format!(
            "inconsistent block geometry: {} x {} vs {} x {}",
            odd.frames(),
            odd.frame_len(),
            frames,
            samples
        )));
    }

    let groups = spec.reference_channels.max(1);
    if frames % groups != 0 {
        return Err(JobError::Aggregation(format!(
            "{} frames per acquisition cannot be split into {} reference channels",
            frames, groups
        )));
    }
    let per_group = frames / groups;

    let mut warnings = Vec::new();
    if spec.reference_channels == 1 || spec.reference_channels > 2 {
        let msg = format!(
            "{} reference channels: channels preserved without normalization",
            spec.reference_channels
        );
        log::warn!("{}", msg);
        warnings.push(msg);
    }

    let rows = match spec.averaging_mode {
        AveragingMode::Sum => 1,
        AveragingMode::Spread => per_group,
    };
    let shape = [groups, steps, rows, samples];
    let mut values = vec![0.0f64; groups * steps * rows * samples];

    for step in 0..steps {
        for average in 0..averages {
            let block = &grid[step * averages + average];
            for k in 0..per_group {
                for channel in 0..groups {
                    // Interleaved: frame k*groups + c belongs to group c.
                    let frame = block.frame(k * groups + channel);
                    let row = match spec.averaging_mode {
                        AveragingMode::Sum => 0,
                        AveragingMode::Spread => k,
                    };
                    let start = ((channel * steps + step) * rows + row) * samples;
                    for (acc, x) in values[start..start + samples].iter_mut().zip(frame) {
                        *acc += x;
                    }
                }
            }
        }
    }

    if spec.averaging_mode == AveragingMode::Spread {
        let n = averages as f64;
        for v in values.iter_mut() {
            *v /= n;
        }
    }

    let normalized = if spec.reference_channels == 2 {
        let half = steps * rows * samples;
        let (signal, reference) = values.split_at(half);
        Some(
            signal
                .iter()
                .zip(reference)
                .map(|(s, r)| s / r)
                .collect(),
        )
    } else {
        None
    };

    Ok(ResultDataset {
        mode: spec.averaging_mode,
        shape,
        values,
        normalized,
        warnings,
    })
}
