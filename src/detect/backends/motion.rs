use std::collections::HashMap;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::{passes_filter, DetectionCapability, DetectorBackend, SourceKey};
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::{Frame, FrameShape, PixelDepth};

/// Class id reported for motion boxes.
pub const MOTION_CLASS: u32 = 0;

struct Reference {
    hash: [u8; 32],
    shape: FrameShape,
    grid: Vec<f32>,
}

/// CPU block-difference motion detector.
///
/// The frame is split into square blocks; a block whose mean brightness moved
/// by more than `threshold` since the previous frame of the same source is
/// "changed". All changed blocks are reported as one box.
pub struct MotionBackend {
    block: u32,
    threshold: f32,
    references: HashMap<SourceKey, Reference>,
}

impl MotionBackend {
    pub fn new(block: u32, threshold: f32) -> Self {
        Self {
            block: block.max(1),
            threshold,
            references: HashMap::new(),
        }
    }

    fn grid_dims(&self, shape: FrameShape) -> (usize, usize) {
        let cols = shape.width.div_ceil(self.block) as usize;
        let rows = shape.height.div_ceil(self.block) as usize;
        (cols, rows)
    }

    fn block_means(&self, frame: &Frame) -> Vec<f32> {
        let shape = frame.shape();
        let (cols, rows) = self.grid_dims(shape);
        let mut sums = vec![0u64; cols * rows];
        let mut counts = vec![0u32; cols * rows];
        let bpp = shape.bytes_per_pixel();
        let sample = match shape.depth {
            PixelDepth::U8 => 0,
            // Little-endian samples: the high byte carries the brightness.
            PixelDepth::U16 => 1,
        };
        let step = shape.depth.bytes();
        let luma_channels = (shape.channels as usize).min(3);
        let data = frame.as_bytes();
        for y in 0..shape.height as usize {
            let row = y * shape.row_bytes();
            let cell_row = (y / self.block as usize) * cols;
            for x in 0..shape.width as usize {
                let px = row + x * bpp;
                let luma: u32 = (0..luma_channels)
                    .map(|c| u32::from(data[px + c * step + sample]))
                    .sum::<u32>()
                    / luma_channels as u32;
                let cell = cell_row + x / self.block as usize;
                sums[cell] += u64::from(luma);
                counts[cell] += 1;
            }
        }
        sums.iter()
            .zip(&counts)
            .map(|(sum, count)| *sum as f32 / (*count).max(1) as f32)
            .collect()
    }
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self::new(16, 12.0)
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::Motion)
    }

    fn detect(&mut self, frame: &Frame, classes: &[u32], confidence: f32) -> Result<Vec<Detection>> {
        self.detect_source(SourceKey::Adhoc, frame, classes, confidence)
    }

    fn detect_source(
        &mut self,
        source: SourceKey,
        frame: &Frame,
        classes: &[u32],
        confidence: f32,
    ) -> Result<Vec<Detection>> {
        let shape = frame.shape();
        let hash: [u8; 32] = Sha256::digest(frame.as_bytes()).into();

        if let Some(previous) = self.references.get(&source) {
            if previous.shape == shape && previous.hash == hash {
                return Ok(Vec::new());
            }
        }

        let grid = self.block_means(frame);
        let previous = self.references.insert(source, Reference { hash, shape, grid });
        let Some(previous) = previous.filter(|p| p.shape == shape) else {
            return Ok(Vec::new());
        };
        let Some(current) = self.references.get(&source) else {
            return Ok(Vec::new());
        };

        let (cols, _) = self.grid_dims(shape);
        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        let mut strongest = 0.0f32;
        for (cell, (now, before)) in current.grid.iter().zip(&previous.grid).enumerate() {
            let diff = (now - before).abs();
            if diff <= self.threshold {
                continue;
            }
            strongest = strongest.max(diff);
            let (cx, cy) = (cell % cols, cell / cols);
            bounds = Some(match bounds {
                None => (cx, cy, cx, cy),
                Some((x1, y1, x2, y2)) => (x1.min(cx), y1.min(cy), x2.max(cx), y2.max(cy)),
            });
        }

        let Some((x1, y1, x2, y2)) = bounds else {
            return Ok(Vec::new());
        };
        let block = self.block as f32;
        let bbox = BoundingBox::new(
            x1 as f32 * block,
            y1 as f32 * block,
            ((x2 + 1) as f32 * block).min(shape.width as f32),
            ((y2 + 1) as f32 * block).min(shape.height as f32),
        );
        let detection = Detection::new(bbox, MOTION_CLASS, (strongest / 64.0).min(1.0));
        Ok(if passes_filter(&detection, classes, confidence) {
            vec![detection]
        } else {
            Vec::new()
        })
    }

    fn class_name(&self, _class_id: u32) -> String {
        "motion".to_string()
    }
}
