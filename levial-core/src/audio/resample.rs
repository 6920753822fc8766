//! Capture-rate → frame-rate conversion (rubato `FastFixedIn`).
//!
//! Devices usually capture at 44.1 or 48 kHz; frames are cut at the
//! configured target rate (16 kHz by default). When both rates match the
//! converter is a plain copy and no rubato state is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, warn};

use crate::error::{LevialError, Result};

pub struct RateConverter {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    block: usize,
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `block` is the number of input samples handed to rubato per call.
    pub fn new(from_rate: u32, to_rate: u32, block: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 || block == 0 {
            return Err(LevialError::Resampler(format!(
                "invalid conversion {from_rate} Hz -> {to_rate} Hz (block {block})"
            )));
        }
        if from_rate == to_rate {
            return Ok(Self {
                inner: None,
                pending: Vec::new(),
                block,
                scratch: Vec::new(),
            });
        }

        let inner = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            block,
            1,
        )
        .map_err(|e| LevialError::Resampler(e.to_string()))?;
        let scratch = vec![vec![0f32; inner.output_frames_max()]; 1];
        debug!(from_rate, to_rate, block, "resampler ready");

        Ok(Self {
            inner: Some(inner),
            pending: Vec::with_capacity(block * 2),
            block,
            scratch,
        })
    }

    /// Convert `input`, returning whatever full blocks produced (possibly
    /// nothing). A trailing partial block waits for the next call.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(inner) = self.inner.as_mut() else {
            return input.to_vec();
        };

        self.pending.extend_from_slice(input);
        let mut out = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= self.block {
            let block = &self.pending[offset..offset + self.block];
            match inner.process_into_buffer(&[block], &mut self.scratch, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => warn!("resampler dropped a block: {e}"),
            }
            offset += self.block;
        }
        self.pending.drain(..offset);
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }
}
