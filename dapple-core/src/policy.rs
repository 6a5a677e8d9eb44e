//! Per-family generation parameters.
//!
//! Callers ask for a step count, guidance scale and output size; what a model
//! can actually use depends on how it was trained. Distilled models ignore
//! most of the request, base models honor it within latency bounds.

use crate::ModelFamily;

/// The latent space is downsampled by 8, so pixel sizes must be multiples of it.
pub const DIMENSION_MULTIPLE: u32 = 8;
/// Upper bound applied to every family, including the unclamped ones.
pub const MAX_DIMENSION: u32 = 2048;
pub const MAX_GUIDANCE_SCALE: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestedParams {
    pub steps: u32,
    pub guidance_scale: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveParams {
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Guidance {
    /// Always use this value.
    Fixed(f64),
    /// Use the caller's value within `[0, MAX_GUIDANCE_SCALE]`.
    Requested { default: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyPolicy {
    pub max_steps: u32,
    pub guidance: Guidance,
    /// `None` for families trained at high resolution.
    pub max_resolution: Option<u32>,
}

pub const fn policy(family: ModelFamily) -> FamilyPolicy {
    match family {
        ModelFamily::Standard => FamilyPolicy {
            max_steps: 25,
            guidance: Guidance::Fixed(7.5),
            max_resolution: Some(768),
        },
        ModelFamily::Turbo => FamilyPolicy {
            max_steps: 4,
            guidance: Guidance::Fixed(0.0),
            max_resolution: Some(512),
        },
        ModelFamily::Lightning => FamilyPolicy {
            max_steps: 4,
            guidance: Guidance::Fixed(1.0),
            max_resolution: Some(1024),
        },
        ModelFamily::Xl => FamilyPolicy {
            max_steps: 40,
            guidance: Guidance::Requested { default: 5.0 },
            max_resolution: None,
        },
        ModelFamily::NextGen => FamilyPolicy {
            max_steps: 28,
            guidance: Guidance::Requested { default: 7.0 },
            max_resolution: None,
        },
    }
}

/// Maps a request onto what `family` can run. Total: every input yields
/// `steps >= 1`, a finite non-negative guidance scale and dimensions that are
/// positive multiples of 8.
pub fn resolve(family: ModelFamily, requested: &RequestedParams) -> EffectiveParams {
    let policy = policy(family);
    let guidance_scale = match policy.guidance {
        Guidance::Fixed(value) => value,
        Guidance::Requested { .. } if requested.guidance_scale.is_finite() => {
            requested.guidance_scale.clamp(0.0, MAX_GUIDANCE_SCALE)
        }
        Guidance::Requested { default } => default,
    };

    EffectiveParams {
        steps: requested.steps.clamp(1, policy.max_steps) as usize,
        guidance_scale,
        width: snap_dimension(requested.width, policy.max_resolution) as usize,
        height: snap_dimension(requested.height, policy.max_resolution) as usize,
    }
}

/// Rounds down to a multiple of 8 within `[8, max]`.
pub fn snap_dimension(value: u32, max: Option<u32>) -> u32 {
    let max = max.map_or(MAX_DIMENSION, |m| m.min(MAX_DIMENSION));
    let value = value.min(max);
    (value - value % DIMENSION_MULTIPLE).max(DIMENSION_MULTIPLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAMILIES: [ModelFamily; 5] = [
        ModelFamily::Standard,
        ModelFamily::Turbo,
        ModelFamily::Lightning,
        ModelFamily::Xl,
        ModelFamily::NextGen,
    ];

    fn requested(steps: u32, guidance_scale: f64, width: u32, height: u32) -> RequestedParams {
        RequestedParams {
            steps,
            guidance_scale,
            width,
            height,
        }
    }

    #[test]
    fn dimensions_are_positive_multiples_of_eight_within_bounds() {
        let sizes = [0, 1, 7, 8, 9, 63, 515, 519, 767, 768, 769, 1023, 1025, 4096, u32::MAX];
        for family in FAMILIES {
            let max = policy(family).max_resolution.unwrap_or(MAX_DIMENSION);
            for &w in &sizes {
                for &h in &sizes {
                    let p = resolve(family, &requested(28, 7.0, w, h));
                    for d in [p.width, p.height] {
                        assert!(d >= 8, "{family}: {d}");
                        assert_eq!(d % 8, 0, "{family}: {d}");
                        assert!(d <= max as usize, "{family}: {d} > {max}");
                    }
                }
            }
        }
    }

    #[test]
    fn distilled_families_override_steps_and_guidance() {
        for family in [ModelFamily::Turbo, ModelFamily::Lightning] {
            let fixed = match policy(family).guidance {
                Guidance::Fixed(g) => g,
                other => panic!("{family} should have fixed guidance, got {other:?}"),
            };
            for steps in [0, 1, 2, 4, 5, 28, 1000, u32::MAX] {
                for guidance in [-3.0, 0.0, 1.0, 7.0, 50.0, f64::NAN] {
                    let p = resolve(family, &requested(steps, guidance, 512, 512));
                    assert!(p.steps >= 1 && p.steps <= 4, "{family}: {}", p.steps);
                    assert_eq!(p.guidance_scale, fixed);
                }
            }
        }
    }

    #[test]
    fn odd_request_lands_on_512() {
        for family in [ModelFamily::Standard, ModelFamily::Turbo] {
            let p = resolve(family, &requested(28, 7.0, 515, 519));
            assert_eq!((p.width, p.height), (512, 512));
        }
    }

    #[test]
    fn xl_keeps_large_sizes_and_caller_guidance() {
        let p = resolve(ModelFamily::Xl, &requested(30, 6.5, 1024, 1536));
        assert_eq!((p.width, p.height), (1024, 1536));
        assert_eq!(p.steps, 30);
        assert_eq!(p.guidance_scale, 6.5);
    }

    #[test]
    fn requested_guidance_is_sanitized() {
        let p = resolve(ModelFamily::NextGen, &requested(28, -1.0, 512, 512));
        assert_eq!(p.guidance_scale, 0.0);
        let p = resolve(ModelFamily::NextGen, &requested(28, 99.0, 512, 512));
        assert_eq!(p.guidance_scale, MAX_GUIDANCE_SCALE);
        let p = resolve(ModelFamily::Xl, &requested(28, f64::INFINITY, 512, 512));
        assert_eq!(p.guidance_scale, 5.0);
    }

    #[test]
    fn standard_family_caps_steps_for_latency() {
        let p = resolve(ModelFamily::Standard, &requested(50, 3.0, 512, 512));
        assert_eq!(p.steps, 25);
        assert_eq!(p.guidance_scale, 7.5);
    }
}
