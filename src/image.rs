use half::f16;

use crate::color::{ColorSpace, RgbSpectrum, SpectrumType};
use crate::gpu::{Buffer, BufferImpl, Device, DeviceImpl, DevicePtr};
use crate::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DataFormat {
	Rgba8,
	Rgba16F,
	Rgba32F,
	Gray8,
	Gray32F,
}

impl DataFormat {
	pub fn stride_in_bytes(&self) -> usize {
		match self {
			DataFormat::Rgba8 => 4,
			DataFormat::Rgba16F => 8,
			DataFormat::Rgba32F => 16,
			DataFormat::Gray8 => 1,
			DataFormat::Gray32F => 4,
		}
	}
}

/// An uncompressed 2-D image resident in a linear device buffer.
///
/// The texel data is also kept host-side for the downsampling and luminance
/// passes of the environment importance map.
pub struct LinearImage2D {
	width: u32,
	height: u32,
	data_format: DataFormat,
	spectrum_type: SpectrumType,
	color_space: ColorSpace,
	data: Vec<u8>,
	device_copy: Buffer,
	/// Stands in for the sampler's texture object.
	texture_object: DevicePtr,
}

impl LinearImage2D {
	pub fn new(
		device: &Device,
		data: &[u8],
		width: u32,
		height: u32,
		data_format: DataFormat,
		spectrum_type: SpectrumType,
		color_space: ColorSpace,
	) -> Result<Self> {
		let expected = width as usize * height as usize * data_format.stride_in_bytes();
		if data.len() != expected {
			return Err(Error::InvalidArgument(format!(
				"image data size {} does not match {}x{} {:?}",
				data.len(),
				width,
				height,
				data_format
			)));
		}
		let device_copy = device.create_buffer(expected.max(1))?;
		let stream = device.create_stream();
		device_copy.write_bytes(&stream, 0, data);
		let texture_object = device_copy.device_pointer();
		Ok(Self {
			width,
			height,
			data_format,
			spectrum_type,
			color_space,
			data: data.to_vec(),
			device_copy,
			texture_object,
		})
	}

	/// Loads the first RGBA layer of an OpenEXR file as a light-source image.
	pub fn from_exr(device: &Device, path: &std::path::Path) -> Result<Self> {
		let image = exr::prelude::read_first_rgba_layer_from_file(
			path,
			|resolution, _| {
				(
					resolution.width() as u32,
					resolution.height() as u32,
					vec![[0.0f32; 4]; resolution.width() * resolution.height()],
				)
			},
			|image, position, (r, g, b, a): (f32, f32, f32, f32)| {
				let index = image.0 as usize * position.y() + position.x();
				image.2[index] = [r, g, b, a];
			},
		)
		.map_err(|e| Error::IoError(format!("{}: {}", path.display(), e)))?;

		let (width, height, texels) = image.layer_data.channel_data.pixels;
		let mut data = Vec::with_capacity(texels.len() * 16);
		for texel in &texels {
			for channel in texel {
				data.extend_from_slice(&channel.to_le_bytes());
			}
		}
		Self::new(
			device,
			&data,
			width,
			height,
			DataFormat::Rgba32F,
			SpectrumType::LightSource,
			ColorSpace::Rec709D65,
		)
	}

	pub fn width(&self) -> u32 {
		self.width
	}

	pub fn height(&self) -> u32 {
		self.height
	}

	pub fn data_format(&self) -> DataFormat {
		self.data_format
	}

	pub fn spectrum_type(&self) -> SpectrumType {
		self.spectrum_type
	}

	pub fn color_space(&self) -> ColorSpace {
		self.color_space
	}

	/// Whether the sampler applies sRGB degamma in hardware on fetch. Only
	/// 8-bit data carries a gamma curve worth decoding on the fly.
	pub fn needs_hw_srgb_degamma(&self) -> bool {
		matches!(self.data_format, DataFormat::Rgba8 | DataFormat::Gray8)
			&& self.color_space == ColorSpace::Rec709D65SrgbGamma
	}

	pub fn texture_object(&self) -> DevicePtr {
		self.texture_object
	}

	pub fn device_buffer(&self) -> &Buffer {
		&self.device_copy
	}

	pub fn texel(&self, x: u32, y: u32) -> [f32; 4] {
		let stride = self.data_format.stride_in_bytes();
		let offset = (y as usize * self.width as usize + x as usize) * stride;
		let bytes = &self.data[offset..offset + stride];
		match self.data_format {
			DataFormat::Rgba8 => [
				bytes[0] as f32 / 255.0,
				bytes[1] as f32 / 255.0,
				bytes[2] as f32 / 255.0,
				bytes[3] as f32 / 255.0,
			],
			DataFormat::Rgba16F => {
				let mut out = [0.0f32; 4];
				for (i, v) in out.iter_mut().enumerate() {
					let raw = u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
					*v = f16::from_bits(raw).to_f32();
				}
				out
			}
			DataFormat::Rgba32F => {
				let mut out = [0.0f32; 4];
				for (i, v) in out.iter_mut().enumerate() {
					*v = f32::from_le_bytes([
						bytes[4 * i],
						bytes[4 * i + 1],
						bytes[4 * i + 2],
						bytes[4 * i + 3],
					]);
				}
				out
			}
			DataFormat::Gray8 => {
				let g = bytes[0] as f32 / 255.0;
				[g, g, g, 1.0]
			}
			DataFormat::Gray32F => {
				let g = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
				[g, g, g, 1.0]
			}
		}
	}

	/// Box-filter downsample to the given resolution, as RGBA32F texels.
	pub fn shrunk_texels(&self, new_width: u32, new_height: u32) -> Vec<[f32; 4]> {
		assert!(new_width >= 1 && new_height >= 1);
		let mut out = Vec::with_capacity(new_width as usize * new_height as usize);
		for y in 0..new_height {
			let y0 = y * self.height / new_height;
			let y1 = ((y + 1) * self.height / new_height).max(y0 + 1).min(self.height);
			for x in 0..new_width {
				let x0 = x * self.width / new_width;
				let x1 = ((x + 1) * self.width / new_width).max(x0 + 1).min(self.width);
				let mut acc = [0.0f32; 4];
				for sy in y0..y1 {
					for sx in x0..x1 {
						let t = self.texel(sx, sy);
						for c in 0..4 {
							acc[c] += t[c];
						}
					}
				}
				let count = ((x1 - x0) * (y1 - y0)) as f32;
				for c in acc.iter_mut() {
					*c /= count;
				}
				out.push(acc);
			}
		}
		out
	}

	/// Per-texel Rec.709 luminance of a texel list.
	pub fn luminance_of(texels: &[[f32; 4]]) -> Vec<f32> {
		texels
			.iter()
			.map(|t| RgbSpectrum::new(t[0], t[1], t[2]).luminance())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn device() -> Device {
		Device::new()
	}

	#[test]
	fn texel_decoding_rgba8() {
		let data = [255u8, 0, 128, 255, 0, 255, 0, 0];
		let image = LinearImage2D::new(
			&device(),
			&data,
			2,
			1,
			DataFormat::Rgba8,
			SpectrumType::Reflectance,
			ColorSpace::Rec709D65,
		)
		.unwrap();
		let t = image.texel(0, 0);
		assert_eq!(t[0], 1.0);
		assert!((t[2] - 128.0 / 255.0).abs() < 1e-6);
	}

	#[test]
	fn degamma_only_for_gamma_encoded_8bit() {
		let data = vec![0u8; 4];
		let gamma = LinearImage2D::new(
			&device(),
			&data,
			1,
			1,
			DataFormat::Rgba8,
			SpectrumType::Reflectance,
			ColorSpace::Rec709D65SrgbGamma,
		)
		.unwrap();
		assert!(gamma.needs_hw_srgb_degamma());
		let linear = LinearImage2D::new(
			&device(),
			&data,
			1,
			1,
			DataFormat::Rgba8,
			SpectrumType::Reflectance,
			ColorSpace::Rec709D65,
		)
		.unwrap();
		assert!(!linear.needs_hw_srgb_degamma());
	}

	#[test]
	fn shrink_averages_blocks() {
		let mut data = Vec::new();
		for v in [0.0f32, 1.0, 1.0, 0.0] {
			for _ in 0..3 {
				data.extend_from_slice(&v.to_le_bytes());
			}
			data.extend_from_slice(&1.0f32.to_le_bytes());
		}
		let image = LinearImage2D::new(
			&device(),
			&data,
			2,
			2,
			DataFormat::Rgba32F,
			SpectrumType::LightSource,
			ColorSpace::Rec709D65,
		)
		.unwrap();
		let shrunk = image.shrunk_texels(1, 1);
		assert_eq!(shrunk.len(), 1);
		assert!((shrunk[0][0] - 0.5).abs() < 1e-6);
	}
}
