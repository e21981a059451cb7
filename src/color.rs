use std::sync::Mutex;

use crate::math::CompensatedSum;

/// What a spectrum represents. Light-source spectra and reflectance spectra
/// use different normalizations when projected to the rendering color space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpectrumType {
	Reflectance,
	LightSource,
	NA,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ColorSpace {
	Rec709D65SrgbGamma,
	Rec709D65,
	XYZ,
}

pub const WAVELENGTH_MIN: f32 = 360.0;
pub const WAVELENGTH_MAX: f32 = 830.0;

/// Strata of the discretized color-matching tables shipped to the kernels.
pub const NUM_CMF_STRATA: usize = 16;

/// Number of wavelengths sampled jointly per path.
pub const NUM_SPECTRAL_SAMPLES: usize = 4;

/// The tristimulus value triple used as the rendering representation.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct RgbSpectrum {
	pub r: f32,
	pub g: f32,
	pub b: f32,
}

impl RgbSpectrum {
	pub const ZERO: Self = Self { r: 0.0, g: 0.0, b: 0.0 };

	pub const fn new(r: f32, g: f32, b: f32) -> Self {
		Self { r, g, b }
	}

	/// Rec.709 luma of a linear RGB triple.
	pub fn luminance(&self) -> f32 {
		0.2126 * self.r + 0.7152 * self.g + 0.0722 * self.b
	}
}

/// Wavelengths sampled with equal offsets across the visible range, shared by
/// the light and eye subpaths of a bidirectional frame.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct WavelengthSamples {
	pub lambdas: [f32; NUM_SPECTRAL_SAMPLES],
	pub selected_lambda_index: u32,
}

impl WavelengthSamples {
	/// Places one wavelength per stratum at a common fractional offset.
	/// Returns the packet and the probability density of the selected comb.
	pub fn new_with_equal_offsets(u_offset: f32, u_select: f32) -> (Self, f32) {
		let range = WAVELENGTH_MAX - WAVELENGTH_MIN;
		let n = NUM_SPECTRAL_SAMPLES as f32;
		let mut lambdas = [0.0f32; NUM_SPECTRAL_SAMPLES];
		for (j, lambda) in lambdas.iter_mut().enumerate() {
			*lambda = WAVELENGTH_MIN + (j as f32 + u_offset) / n * range;
		}
		let selected = ((u_select * n) as u32).min(NUM_SPECTRAL_SAMPLES as u32 - 1);
		let probability = n / range;
		(Self { lambdas, selected_lambda_index: selected }, probability)
	}
}

// Piecewise-Gaussian fits to the CIE 1931 color matching functions
// (Wyman, Sloan, Shirley, JCGT 2013).
fn gaussian(lambda: f32, mean: f32, sigma_lo: f32, sigma_hi: f32) -> f32 {
	let sigma = if lambda < mean { sigma_lo } else { sigma_hi };
	let t = (lambda - mean) / sigma;
	(-0.5 * t * t).exp()
}

pub fn xbar(lambda: f32) -> f32 {
	1.056 * gaussian(lambda, 599.8, 37.9, 31.0) + 0.362 * gaussian(lambda, 442.0, 16.0, 26.7)
		- 0.065 * gaussian(lambda, 501.1, 20.4, 26.2)
}

pub fn ybar(lambda: f32) -> f32 {
	0.821 * gaussian(lambda, 568.8, 46.9, 40.5) + 0.286 * gaussian(lambda, 530.9, 16.3, 31.1)
}

pub fn zbar(lambda: f32) -> f32 {
	1.217 * gaussian(lambda, 437.0, 11.8, 36.0) + 0.681 * gaussian(lambda, 459.0, 26.0, 13.8)
}

/// Discretized color-matching tables, published in the launch parameters.
#[derive(Clone, Copy)]
pub struct CmfTables {
	pub xbar: [f32; NUM_CMF_STRATA],
	pub ybar: [f32; NUM_CMF_STRATA],
	pub zbar: [f32; NUM_CMF_STRATA],
	pub integral_cmf: f32,
}

impl CmfTables {
	fn build() -> Self {
		const SUBSAMPLES: usize = 16;
		let range = WAVELENGTH_MAX - WAVELENGTH_MIN;
		let stratum_width = range / NUM_CMF_STRATA as f32;
		let mut tables = Self {
			xbar: [0.0; NUM_CMF_STRATA],
			ybar: [0.0; NUM_CMF_STRATA],
			zbar: [0.0; NUM_CMF_STRATA],
			integral_cmf: 0.0,
		};
		let mut integral = CompensatedSum::default();
		for s in 0..NUM_CMF_STRATA {
			let base = WAVELENGTH_MIN + s as f32 * stratum_width;
			let (mut x, mut y, mut z) = (0.0, 0.0, 0.0);
			for i in 0..SUBSAMPLES {
				let lambda = base + (i as f32 + 0.5) / SUBSAMPLES as f32 * stratum_width;
				x += xbar(lambda);
				y += ybar(lambda);
				z += zbar(lambda);
			}
			tables.xbar[s] = x * stratum_width / SUBSAMPLES as f32;
			tables.ybar[s] = y * stratum_width / SUBSAMPLES as f32;
			tables.zbar[s] = z * stratum_width / SUBSAMPLES as f32;
			integral.add(tables.ybar[s]);
		}
		tables.integral_cmf = integral.value();
		tables
	}
}

struct ColorSystem {
	ref_count: u32,
	tables: Option<CmfTables>,
}

static COLOR_SYSTEM: Mutex<ColorSystem> = Mutex::new(ColorSystem { ref_count: 0, tables: None });

/// Builds the process-wide color-matching tables. Reference counted; each
/// context calls this once at construction.
pub fn init_color_system() {
	let mut sys = COLOR_SYSTEM.lock().unwrap();
	if sys.ref_count == 0 {
		sys.tables = Some(CmfTables::build());
	}
	sys.ref_count += 1;
}

pub fn finalize_color_system() {
	let mut sys = COLOR_SYSTEM.lock().unwrap();
	sys.ref_count = sys.ref_count.saturating_sub(1);
	if sys.ref_count == 0 {
		sys.tables = None;
	}
}

pub fn cmf_tables() -> CmfTables {
	let sys = COLOR_SYSTEM.lock().unwrap();
	sys.tables.expect("color system is not initialized")
}

// Rec.709 (D65 white) column matrices.
const XYZ_TO_REC709: [[f32; 3]; 3] = [
	[3.2404542, -0.9692660, 0.0556434],
	[-1.5371385, 1.8760108, -0.2040259],
	[-0.4985314, 0.0415560, 1.0572252],
];

const REC709_TO_XYZ: [[f32; 3]; 3] = [
	[0.4124564, 0.2126729, 0.0193339],
	[0.3575761, 0.7151522, 0.1191920],
	[0.1804375, 0.0721750, 0.9503041],
];

fn mat_mul(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
	[
		m[0][0] * v[0] + m[1][0] * v[1] + m[2][0] * v[2],
		m[0][1] * v[0] + m[1][1] * v[1] + m[2][1] * v[2],
		m[0][2] * v[0] + m[1][2] * v[1] + m[2][2] * v[2],
	]
}

pub fn srgb_degamma(value: f32) -> f32 {
	if value <= 0.04045 {
		value / 12.92
	} else {
		((value + 0.055) / 1.055).powf(2.4)
	}
}

pub fn xyz_to_rec709(xyz: [f32; 3]) -> [f32; 3] {
	mat_mul(&XYZ_TO_REC709, xyz)
}

pub fn rec709_to_xyz(rgb: [f32; 3]) -> [f32; 3] {
	mat_mul(&REC709_TO_XYZ, rgb)
}

/// Projects a CIE-XYZ triple into the rendering RGB space. Reflectance-type
/// spectra are normalized against the luminous integral so that a flat unit
/// reflectance maps to (1, 1, 1).
pub fn transform_to_rendering_rgb(spectrum_type: SpectrumType, xyz: [f32; 3]) -> [f32; 3] {
	let xyz = match spectrum_type {
		SpectrumType::Reflectance => {
			let integral = cmf_tables().integral_cmf;
			[xyz[0] / integral, xyz[1] / integral, xyz[2] / integral]
		}
		SpectrumType::LightSource | SpectrumType::NA => xyz,
	};
	xyz_to_rec709(xyz)
}

/// Converts a user triplet in the given color space to the rendering RGB
/// representation stored in spectrum descriptors.
pub fn create_triplet_spectrum(
	spectrum_type: SpectrumType,
	color_space: ColorSpace,
	e0: f32,
	e1: f32,
	e2: f32,
) -> RgbSpectrum {
	let rgb = match color_space {
		ColorSpace::Rec709D65SrgbGamma => {
			[srgb_degamma(e0), srgb_degamma(e1), srgb_degamma(e2)]
		}
		ColorSpace::Rec709D65 => [e0, e1, e2],
		ColorSpace::XYZ => transform_to_rendering_rgb(spectrum_type, [e0, e1, e2]),
	};
	RgbSpectrum::new(rgb[0].max(0.0), rgb[1].max(0.0), rgb[2].max(0.0))
}

/// A spectrum tabulated at uniformly spaced wavelengths.
pub struct RegularSampledSpectrum<'a> {
	pub min_lambda: f32,
	pub max_lambda: f32,
	pub values: &'a [f32],
}

impl RegularSampledSpectrum<'_> {
	pub fn value(&self, lambda: f32) -> f32 {
		if self.values.is_empty() || lambda < self.min_lambda || lambda > self.max_lambda {
			return 0.0;
		}
		if self.values.len() == 1 {
			return self.values[0];
		}
		let t = (lambda - self.min_lambda) / (self.max_lambda - self.min_lambda)
			* (self.values.len() - 1) as f32;
		let i = (t as usize).min(self.values.len() - 2);
		let frac = t - i as f32;
		self.values[i] * (1.0 - frac) + self.values[i + 1] * frac
	}

	pub fn to_xyz(&self) -> [f32; 3] {
		project_to_xyz(|lambda| self.value(lambda))
	}
}

/// A spectrum tabulated at arbitrary (wavelength, value) pairs, sorted by
/// wavelength.
pub struct IrregularSampledSpectrum<'a> {
	pub lambdas: &'a [f32],
	pub values: &'a [f32],
}

impl IrregularSampledSpectrum<'_> {
	pub fn value(&self, lambda: f32) -> f32 {
		let n = self.lambdas.len();
		if n == 0 || lambda < self.lambdas[0] || lambda > self.lambdas[n - 1] {
			return 0.0;
		}
		if n == 1 {
			return self.values[0];
		}
		let i = match self.lambdas.partition_point(|&l| l <= lambda) {
			0 => 0,
			k => (k - 1).min(n - 2),
		};
		let span = self.lambdas[i + 1] - self.lambdas[i];
		if span <= 0.0 {
			return self.values[i];
		}
		let frac = (lambda - self.lambdas[i]) / span;
		self.values[i] * (1.0 - frac) + self.values[i + 1] * frac
	}

	pub fn to_xyz(&self) -> [f32; 3] {
		project_to_xyz(|lambda| self.value(lambda))
	}
}

fn project_to_xyz(spectrum: impl Fn(f32) -> f32) -> [f32; 3] {
	const STEPS: usize = 256;
	let range = WAVELENGTH_MAX - WAVELENGTH_MIN;
	let dl = range / STEPS as f32;
	let mut x = CompensatedSum::default();
	let mut y = CompensatedSum::default();
	let mut z = CompensatedSum::default();
	for i in 0..STEPS {
		let lambda = WAVELENGTH_MIN + (i as f32 + 0.5) * dl;
		let s = spectrum(lambda);
		x.add(s * xbar(lambda) * dl);
		y.add(s * ybar(lambda) * dl);
		z.add(s * zbar(lambda) * dl);
	}
	[x.value(), y.value(), z.value()]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn flat_reflectance_preserves_luminance() {
		init_color_system();
		let values = [1.0f32; 8];
		let spectrum = RegularSampledSpectrum {
			min_lambda: WAVELENGTH_MIN,
			max_lambda: WAVELENGTH_MAX,
			values: &values,
		};
		let rgb = transform_to_rendering_rgb(SpectrumType::Reflectance, spectrum.to_xyz());
		// A flat unit reflectance normalizes to Y = 1; the XYZ-to-RGB matrix
		// preserves luminance, so the Rec.709 luma must come back as 1.
		let luma = RgbSpectrum::new(rgb[0], rgb[1], rgb[2]).luminance();
		assert!((luma - 1.0).abs() < 0.05, "luma = {}", luma);
		for (i, &c) in rgb.iter().enumerate() {
			assert!(c > 0.5 && c < 1.5, "channel {} = {}", i, c);
		}
		finalize_color_system();
	}

	#[test]
	fn wavelength_samples_cover_strata() {
		let (wls, prob) = WavelengthSamples::new_with_equal_offsets(0.5, 0.1);
		assert!(prob > 0.0);
		let n = NUM_SPECTRAL_SAMPLES as f32;
		let stratum = (WAVELENGTH_MAX - WAVELENGTH_MIN) / n;
		for (j, &lambda) in wls.lambdas.iter().enumerate() {
			let lo = WAVELENGTH_MIN + j as f32 * stratum;
			assert!(lambda >= lo && lambda < lo + stratum);
		}
	}

	#[test]
	fn triplet_spectrum_degammas_srgb() {
		init_color_system();
		let linear = create_triplet_spectrum(
			SpectrumType::Reflectance,
			ColorSpace::Rec709D65SrgbGamma,
			0.5,
			0.5,
			0.5,
		);
		assert!((linear.r - srgb_degamma(0.5)).abs() < 1e-6);
		finalize_color_system();
	}
}
