//! Flow-matching Euler sampling for MMDiT.

use anyhow::Result;
use candle_core::Tensor;
use candle_transformers::models::mmdit::model::MMDiT;
use tracing::debug;

/// Time shift SD3 checkpoints were trained with.
pub const DEFAULT_TIME_SHIFT: f64 = 3.0;

/// Classifier-free guidance only kicks in above this scale.
const MIN_GUIDANCE: f64 = 1.0;

pub fn time_snr_shift(alpha: f64, t: f64) -> f64 {
    alpha * t / (1.0 + (alpha - 1.0) * t)
}

/// `steps + 1` noise levels from 1 down to 0, shifted towards the noisy end.
pub fn sigmas(steps: usize, shift: f64) -> Vec<f64> {
    let steps = steps.max(1);
    (0..=steps)
        .rev()
        .map(|i| time_snr_shift(shift, i as f64 / steps as f64))
        .collect()
}

/// Mixes clean latents with noise at `sigma`, the flow-matching forward process.
pub fn noise_latents(latents: &Tensor, noise: &Tensor, sigma: f64) -> Result<Tensor> {
    Ok(((noise * sigma)? + (latents * (1.0 - sigma))?)?)
}

/// Conditioning for one run. With guidance, `y` and `context` hold the
/// conditional batch first and the unconditional one second.
pub struct Conditioning<'a> {
    pub y: &'a Tensor,
    pub context: &'a Tensor,
    pub guidance_scale: f64,
}

pub fn uses_guidance(guidance_scale: f64) -> bool {
    guidance_scale > MIN_GUIDANCE
}

/// Integrates the velocity field over consecutive pairs of `sigmas`.
pub fn euler_sample(
    mmdit: &MMDiT,
    mut x: Tensor,
    cond: &Conditioning,
    sigmas: &[f64],
) -> Result<Tensor> {
    let batch = if uses_guidance(cond.guidance_scale) { 2 } else { 1 };
    let total = sigmas.len().saturating_sub(1);

    for (index, window) in sigmas.windows(2).enumerate() {
        let (s_curr, s_prev) = (window[0], window[1]);
        let timestep = Tensor::full((s_curr * 1000.0) as f32, (batch,), x.device())?;
        let input = if batch == 2 {
            Tensor::cat(&[&x, &x], 0)?
        } else {
            x.clone()
        };

        let pred = mmdit.forward(&input, &timestep, cond.y, cond.context, None)?;
        let pred = if batch == 2 {
            let chunks = pred.chunk(2, 0)?;
            ((&chunks[0] * cond.guidance_scale)? - (&chunks[1] * (cond.guidance_scale - 1.0))?)?
        } else {
            pred
        };

        x = (x + (pred * (s_prev - s_curr))?)?;
        debug!(step = index + 1, total, "denoising step done");
    }
    Ok(x)
}

/// Latent height and width for a pixel size. MMDiT patches are 2x2 over an
/// 8x downsampled latent, so the latent is rounded up to a multiple of 2.
pub fn latent_size(width: usize, height: usize) -> (usize, usize) {
    (height.div_ceil(16) * 2, width.div_ceil(16) * 2)
}
