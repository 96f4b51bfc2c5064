use prost::Message;

#[allow(clippy::derive_partial_eq_without_eq)]
pub mod proto {
	tonic::include_proto!("prometheus");
}

pub const METRIC_NAME_LABEL: &str = "__name__";

/// A parsed remote-write request. Series order is preserved from the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WriteRequest {
	pub series: Vec<Series>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
	pub labels: Vec<Label>,
	pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
	pub name: String,
	pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
	pub value: f64,
	pub timestamp_ms: i64,
}

impl WriteRequest {
	pub fn sample_count(&self) -> u64 {
		self.series.iter().map(|s| s.samples.len() as u64).sum()
	}

	pub fn series_count(&self) -> u64 {
		self.series.len() as u64
	}

	pub fn from_proto(pb: proto::WriteRequest) -> Self {
		WriteRequest {
			series: pb
				.timeseries
				.into_iter()
				.map(|ts| Series {
					labels: ts
						.labels
						.into_iter()
						.map(|l| Label {
							name: l.name,
							value: l.value,
						})
						.collect(),
					samples: ts
						.samples
						.into_iter()
						.map(|s| Sample {
							value: s.value,
							timestamp_ms: s.timestamp,
						})
						.collect(),
				})
				.collect(),
		}
	}

	pub fn to_proto(&self) -> proto::WriteRequest {
		proto::WriteRequest {
			timeseries: self
				.series
				.iter()
				.map(|ts| proto::TimeSeries {
					labels: ts
						.labels
						.iter()
						.map(|l| proto::Label {
							name: l.name.clone(),
							value: l.value.clone(),
						})
						.collect(),
					samples: ts
						.samples
						.iter()
						.map(|s| proto::Sample {
							value: s.value,
							timestamp: s.timestamp_ms,
						})
						.collect(),
				})
				.collect(),
		}
	}

	/// Serializes back to the remote-write wire form (uncompressed).
	pub fn encode_proto(&self) -> Vec<u8> {
		self.to_proto().encode_to_vec()
	}
}

impl Series {
	pub fn metric_name(&self) -> Option<&str> {
		self
			.labels
			.iter()
			.find(|l| l.name == METRIC_NAME_LABEL)
			.map(|l| l.value.as_str())
	}

	/// Stable FNV-1a fingerprint over the sorted label set. Used as a
	/// deterministic tie-breaker when trimming series.
	pub fn fingerprint(&self) -> u64 {
		let mut pairs: Vec<(&str, &str)> = self
			.labels
			.iter()
			.map(|l| (l.name.as_str(), l.value.as_str()))
			.collect();
		pairs.sort_unstable();

		const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
		const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
		let mut hash = FNV_OFFSET;
		let mut feed = |bytes: &[u8]| {
			for b in bytes {
				hash ^= u64::from(*b);
				hash = hash.wrapping_mul(FNV_PRIME);
			}
			hash ^= 0xff;
			hash = hash.wrapping_mul(FNV_PRIME);
		};
		for (name, value) in pairs {
			feed(name.as_bytes());
			feed(value.as_bytes());
		}
		hash
	}
}

#[cfg(test)]
pub(crate) fn series(name: &str, extra: &[(&str, &str)], samples: usize) -> Series {
	let mut labels = vec![Label {
		name: METRIC_NAME_LABEL.to_string(),
		value: name.to_string(),
	}];
	labels.extend(extra.iter().map(|(n, v)| Label {
		name: n.to_string(),
		value: v.to_string(),
	}));
	Series {
		labels,
		samples: (0..samples)
			.map(|i| Sample {
				value: i as f64,
				timestamp_ms: 1_700_000_000_000 + i as i64,
			})
			.collect(),
	}
}
