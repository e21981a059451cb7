use crate::gpu::{Device, Stream, TypedBuffer};
use crate::math::CompensatedSum;
use crate::shared;
use crate::{Error, Result};

/// A discrete distribution over `N` weights with a device-resident PMF/CDF.
///
/// A zero-integral build is valid: sampling then returns index 0 with
/// probability 1, so callers never observe a failure from an all-dark input.
pub struct DiscreteDistribution1D {
	pmf: TypedBuffer<f32>,
	cdf: TypedBuffer<f32>,
	host_pmf: Vec<f32>,
	host_cdf: Vec<f32>,
	integral: f32,
	num_values: u32,
}

impl DiscreteDistribution1D {
	pub fn new(device: &Device, stream: &Stream, weights: &[f32]) -> Result<Self> {
		assert!(!weights.is_empty());
		let num_values = weights.len() as u32;
		let mut host_pmf = weights.to_vec();
		let mut host_cdf = vec![0.0f32; weights.len() + 1];

		let mut sum = CompensatedSum::default();
		for (i, &w) in host_pmf.iter().enumerate() {
			host_cdf[i] = sum.value();
			sum.add(w);
		}
		let integral = sum.value();
		if !integral.is_finite() {
			return Err(Error::InvalidDistribution);
		}
		if integral > 0.0 {
			for v in host_pmf.iter_mut() {
				*v /= integral;
			}
			for v in host_cdf.iter_mut() {
				*v /= integral;
			}
		}
		host_cdf[weights.len()] = 1.0;

		let pmf = TypedBuffer::new(device, host_pmf.len())?;
		let cdf = TypedBuffer::new(device, host_cdf.len())?;
		pmf.write_slice(stream, 0, &host_pmf);
		cdf.write_slice(stream, 0, &host_cdf);

		Ok(Self { pmf, cdf, host_pmf, host_cdf, integral, num_values })
	}

	pub fn integral(&self) -> f32 {
		self.integral
	}

	pub fn num_values(&self) -> u32 {
		self.num_values
	}

	pub fn pmf(&self) -> &[f32] {
		&self.host_pmf
	}

	pub fn cdf(&self) -> &[f32] {
		&self.host_cdf
	}

	/// Returns the sampled index, its probability mass and the rescaled
	/// residual of `u`, reusable for a subsequent sampling decision.
	pub fn sample(&self, u: f32) -> (u32, f32, f32) {
		if self.integral == 0.0 {
			return (0, 1.0, u);
		}
		let n = self.num_values as usize;
		let upper = self.host_cdf[..n].partition_point(|&c| c <= u);
		let index = upper.saturating_sub(1).min(n - 1);
		let prob = self.host_pmf[index];
		let residual = if prob > 0.0 { (u - self.host_cdf[index]) / prob } else { 0.0 };
		(index as u32, prob, residual)
	}

	pub fn record(&self) -> shared::DiscreteDistribution1DRecord {
		shared::DiscreteDistribution1DRecord {
			pmf: self.pmf.device_pointer(),
			cdf: self.cdf.device_pointer(),
			integral: self.integral,
			num_values: self.num_values,
		}
	}
}

/// A piecewise-constant continuous distribution over [0, 1].
pub struct ContinuousDistribution1D {
	pdf: TypedBuffer<f32>,
	cdf: TypedBuffer<f32>,
	host_pdf: Vec<f32>,
	host_cdf: Vec<f32>,
	integral: f32,
	num_values: u32,
}

impl ContinuousDistribution1D {
	pub fn new(device: &Device, stream: &Stream, values: &[f32]) -> Result<Self> {
		assert!(!values.is_empty());
		let num_values = values.len() as u32;
		let mut host_pdf = values.to_vec();
		let mut host_cdf = vec![0.0f32; values.len() + 1];

		// Scaling by 1/N makes the CDF an integral over [0, 1].
		let mut sum = CompensatedSum::default();
		for (i, &v) in host_pdf.iter().enumerate() {
			host_cdf[i] = sum.value();
			sum.add(v / num_values as f32);
		}
		let integral = sum.value();
		if !integral.is_finite() {
			return Err(Error::InvalidDistribution);
		}
		if integral > 0.0 {
			for v in host_pdf.iter_mut() {
				*v /= integral;
			}
			for v in host_cdf.iter_mut() {
				*v /= integral;
			}
		}
		host_cdf[values.len()] = 1.0;

		let pdf = TypedBuffer::new(device, host_pdf.len())?;
		let cdf = TypedBuffer::new(device, host_cdf.len())?;
		pdf.write_slice(stream, 0, &host_pdf);
		cdf.write_slice(stream, 0, &host_cdf);

		Ok(Self { pdf, cdf, host_pdf, host_cdf, integral, num_values })
	}

	pub fn integral(&self) -> f32 {
		self.integral
	}

	pub fn num_values(&self) -> u32 {
		self.num_values
	}

	pub fn pdf(&self) -> &[f32] {
		&self.host_pdf
	}

	/// Returns a coordinate in [0, 1) and the PDF value at that coordinate.
	pub fn sample(&self, u: f32) -> (f32, f32) {
		let n = self.num_values as usize;
		if self.integral == 0.0 {
			return (u, 0.0);
		}
		let upper = self.host_cdf[..n].partition_point(|&c| c <= u);
		let index = upper.saturating_sub(1).min(n - 1);
		let pdf = self.host_pdf[index];
		let bin_width_mass = pdf / n as f32;
		let inner = if bin_width_mass > 0.0 {
			(u - self.host_cdf[index]) / bin_width_mass
		} else {
			0.0
		};
		let x = (index as f32 + inner) / n as f32;
		(x.min(0.99999994), pdf)
	}

	pub fn record(&self) -> shared::ContinuousDistribution1DRecord {
		shared::ContinuousDistribution1DRecord {
			pdf: self.pdf.device_pointer(),
			cdf: self.cdf.device_pointer(),
			integral: self.integral,
			num_values: self.num_values,
		}
	}
}

/// A piecewise-constant continuous distribution over the unit square,
/// stored as one distribution per row plus a top-level distribution over
/// the row integrals.
pub struct ContinuousDistribution2D {
	row_dists: Vec<ContinuousDistribution1D>,
	row_records: TypedBuffer<shared::ContinuousDistribution1DRecord>,
	top_dist: ContinuousDistribution1D,
}

impl ContinuousDistribution2D {
	pub fn new(device: &Device, stream: &Stream, values: &[f32], width: usize, height: usize) -> Result<Self> {
		assert_eq!(values.len(), width * height);
		assert!(width >= 1 && height >= 1);

		let mut row_dists = Vec::with_capacity(height);
		let mut integrals = Vec::with_capacity(height);
		let row_records = TypedBuffer::new(device, height)?;
		for y in 0..height {
			let row = ContinuousDistribution1D::new(device, stream, &values[y * width..(y + 1) * width])?;
			row_records.write_element(stream, y, &row.record());
			integrals.push(row.integral());
			row_dists.push(row);
		}

		let top_dist = ContinuousDistribution1D::new(device, stream, &integrals)?;
		if !top_dist.integral().is_finite() || top_dist.integral() <= 0.0 {
			return Err(Error::InvalidDistribution);
		}

		Ok(Self { row_dists, row_records, top_dist })
	}

	pub fn integral(&self) -> f32 {
		self.top_dist.integral()
	}

	/// The marginal PDF over rows (the v axis).
	pub fn marginal_pdf(&self) -> &[f32] {
		self.top_dist.pdf()
	}

	/// Samples (u, v) with the joint PDF over the unit square.
	pub fn sample(&self, u0: f32, u1: f32) -> ((f32, f32), f32) {
		let (v, top_pdf) = self.top_dist.sample(u0);
		let row = ((v * self.row_dists.len() as f32) as usize).min(self.row_dists.len() - 1);
		let (u, row_pdf) = self.row_dists[row].sample(u1);
		((u, v), top_pdf * row_pdf)
	}

	pub fn record(&self) -> shared::ContinuousDistribution2DRecord {
		shared::ContinuousDistribution2DRecord {
			row_dists: self.row_records.device_pointer(),
			top_dist: self.top_dist.record(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::gpu::DeviceImpl;

	fn setup() -> (Device, Stream) {
		let device = Device::new();
		let stream = device.create_stream();
		(device, stream)
	}

	#[test]
	fn discrete_normalization() {
		let (device, stream) = setup();
		let weights = [3.0, 1.0, 0.0, 4.0];
		let dist = DiscreteDistribution1D::new(&device, &stream, &weights).unwrap();
		assert!((dist.integral() - 8.0).abs() < 1e-6);
		let pmf_sum: f32 = dist.pmf().iter().sum();
		assert!((pmf_sum - 1.0).abs() < 1e-5);
		assert_eq!(dist.cdf()[weights.len()], 1.0);
	}

	#[test]
	fn discrete_sample_brackets_u() {
		let (device, stream) = setup();
		let dist = DiscreteDistribution1D::new(&device, &stream, &[1.0, 2.0, 3.0, 2.0]).unwrap();
		for step in 0..100 {
			let u = step as f32 / 100.0;
			let (i, prob, residual) = dist.sample(u);
			let i = i as usize;
			assert!(dist.cdf()[i] <= u && u < dist.cdf()[i + 1], "u = {}", u);
			assert!(prob > 0.0);
			assert!((0.0..1.0 + 1e-5).contains(&residual));
		}
	}

	#[test]
	fn discrete_sampling_law() {
		let (device, stream) = setup();
		let dist = DiscreteDistribution1D::new(&device, &stream, &[1.0, 3.0, 6.0]).unwrap();
		let mut counts = [0u32; 3];
		let samples = 20000;
		for k in 0..samples {
			// Low-discrepancy enough for a histogram check.
			let u = (k as f32 + 0.5) / samples as f32;
			let (i, _, _) = dist.sample(u);
			counts[i as usize] += 1;
		}
		for (i, &count) in counts.iter().enumerate() {
			let expected = dist.pmf()[i];
			let observed = count as f32 / samples as f32;
			assert!((observed - expected).abs() < 0.01, "bin {}: {} vs {}", i, observed, expected);
		}
	}

	#[test]
	fn discrete_zero_integral_samples_index_zero() {
		let (device, stream) = setup();
		let dist = DiscreteDistribution1D::new(&device, &stream, &[0.0, 0.0]).unwrap();
		let (i, prob, _) = dist.sample(0.7);
		assert_eq!(i, 0);
		assert_eq!(prob, 1.0);
	}

	#[test]
	fn continuous_sample_stays_in_chosen_bin() {
		let (device, stream) = setup();
		let dist = ContinuousDistribution1D::new(&device, &stream, &[0.5, 2.0, 1.0, 0.5]).unwrap();
		for step in 0..64 {
			let u = step as f32 / 64.0;
			let (x, pdf) = dist.sample(u);
			assert!((0.0..1.0).contains(&x));
			let bin = (x * 4.0) as usize;
			assert!((dist.pdf()[bin] - pdf).abs() < 1e-5);
		}
	}

	#[test]
	fn continuous_pdf_integrates_to_one() {
		let (device, stream) = setup();
		let dist = ContinuousDistribution1D::new(&device, &stream, &[0.5, 2.0, 1.0, 0.5]).unwrap();
		let mean: f32 = dist.pdf().iter().sum::<f32>() / dist.pdf().len() as f32;
		assert!((mean - 1.0).abs() < 1e-5);
	}

	#[test]
	fn two_d_rejects_zero_integral() {
		let (device, stream) = setup();
		let result = ContinuousDistribution2D::new(&device, &stream, &[0.0; 16], 4, 4);
		assert!(matches!(result, Err(Error::InvalidDistribution)));
	}

	#[test]
	fn two_d_joint_pdf_matches_marginals() {
		let (device, stream) = setup();
		let values: Vec<f32> = (0..16).map(|i| 1.0 + (i % 4) as f32).collect();
		let dist = ContinuousDistribution2D::new(&device, &stream, &values, 4, 4).unwrap();
		let ((u, v), pdf) = dist.sample(0.3, 0.6);
		assert!((0.0..1.0).contains(&u) && (0.0..1.0).contains(&v));
		assert!(pdf > 0.0);
	}
}
