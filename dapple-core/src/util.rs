use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::tokio::Api;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::warn;

use crate::{codec, DeviceMap};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Label of the device [`select_best_device`] would pick, without opening it.
pub fn expected_device_label(device_map: DeviceMap) -> &'static str {
    match device_map {
        DeviceMap::ForceCpu => "cpu",
        DeviceMap::Ordinal(_) if cuda_is_available() => "cuda",
        DeviceMap::Ordinal(_) if metal_is_available() => "metal",
        DeviceMap::Ordinal(_) => "cpu",
    }
}

/// Short name of the device family, as reported by the health endpoint.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

/// Half precision on accelerators, full precision on CPU.
pub fn preferred_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Resizes an image to (width, height) and converts it into a (1, 3, height, width)
/// tensor scaled to `[-1, 1]`, the layout the VAE encoder expects.
pub fn image_to_tensor(
    img: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let rgb = DynamicImage::ImageRgb8(codec::flatten_to_rgb(img));
    let resized = rgb
        .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
        .to_rgb8();
    let tensor = Tensor::from_vec(resized.into_raw(), (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// First denoising step of an image-to-image run. At least one step always runs.
pub fn init_start_step(steps: usize, strength: f64) -> usize {
    let skipped = steps.saturating_sub((steps as f64 * strength).round() as usize);
    skipped.min(steps.saturating_sub(1))
}

/// Downloads `file` from `repo` into the hub cache and returns its local path.
pub async fn fetch(api: &Api, repo: &str, file: &str) -> Result<PathBuf> {
    api.model(repo.to_string())
        .get(file)
        .await
        .with_context(|| format!("failed to fetch {file} from {repo}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn cpu_uses_full_precision() {
        assert_eq!(preferred_dtype(&Device::Cpu), DType::F32);
        assert_eq!(device_label(&Device::Cpu), "cpu");
    }

    #[test]
    fn expected_label_agrees_with_selection() -> Result<()> {
        assert_eq!(expected_device_label(DeviceMap::ForceCpu), "cpu");
        let device = select_best_device(DeviceMap::ForceCpu)?;
        assert_eq!(device_label(&device), expected_device_label(DeviceMap::ForceCpu));
        if !cuda_is_available() && !metal_is_available() {
            assert_eq!(expected_device_label(DeviceMap::default()), "cpu");
        }
        Ok(())
    }

    #[test]
    fn image_tensor_round_trip_keeps_shape() -> Result<()> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 12, Rgb([255, 0, 0])));
        let tensor = image_to_tensor(&img, 16, 8, &Device::Cpu)?;
        assert_eq!(tensor.dims(), &[1, 3, 8, 16]);

        let pixels = ((tensor.squeeze(0)? + 1.0)? * 127.5)?.round()?.to_dtype(DType::U8)?;
        let back = tensor_to_image(&pixels)?;
        assert_eq!((back.width(), back.height()), (16, 8));
        assert_eq!(back.to_rgb8().get_pixel(3, 3), &Rgb([255, 0, 0]));
        Ok(())
    }

    #[test]
    fn tensor_to_image_rejects_non_rgb() -> Result<()> {
        let tensor = Tensor::zeros((4, 2, 2), DType::U8, &Device::Cpu)?;
        assert!(tensor_to_image(&tensor).is_err());
        Ok(())
    }

    #[test]
    fn start_step_leaves_at_least_one_step() {
        assert_eq!(init_start_step(4, 1.0), 0);
        assert_eq!(init_start_step(4, 0.75), 1);
        assert_eq!(init_start_step(4, 0.5), 2);
        assert_eq!(init_start_step(4, 0.0), 3);
        assert_eq!(init_start_step(1, 0.0), 0);
        assert_eq!(init_start_step(25, 0.75), 6);
    }
}
