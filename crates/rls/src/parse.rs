use std::io::Read;

use prost::Message;
use thiserror::Error;

use crate::types::{METRIC_NAME_LABEL, WriteRequest, proto};

/// How the request body is compressed on the wire. Remote-write clients
/// almost always send snappy block format; gzip shows up from relabeling
/// proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
	Snappy,
	Gzip,
	Identity,
}

impl Encoding {
	pub fn from_content_encoding(value: Option<&str>) -> Result<Encoding, ParseError> {
		match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
			None | Some("") | Some("identity") => Ok(Encoding::Identity),
			Some("snappy") => Ok(Encoding::Snappy),
			Some("gzip") => Ok(Encoding::Gzip),
			Some(other) => Err(ParseError::UnsupportedEncoding(other.to_string())),
		}
	}
}

#[derive(Debug, Error)]
pub enum ParseError {
	#[error("malformed body: {0}")]
	Malformed(String),
	#[error("unsupported content encoding {0:?}")]
	UnsupportedEncoding(String),
	#[error("body of {observed} bytes exceeds limit of {limit} bytes")]
	BodyTooLarge { observed: u64, limit: u64 },
}

/// A decoded and validated write request, along with the decompressed size
/// that enforcement caps are measured against.
#[derive(Debug)]
pub struct ParsedWrite {
	pub request: WriteRequest,
	pub body_bytes: u64,
}

/// Decompresses (bounded), decodes, and validates a remote-write body.
///
/// `max_bytes` bounds the post-decompression size; the decompressors
/// short-circuit when the bound is crossed rather than inflating first and
/// checking after.
pub fn parse_write_request(
	body: &[u8],
	encoding: Encoding,
	max_bytes: u64,
) -> Result<ParsedWrite, ParseError> {
	let raw = decompress(body, encoding, max_bytes)?;
	let body_bytes = raw.len() as u64;
	let pb = proto::WriteRequest::decode(raw.as_slice())
		.map_err(|e| ParseError::Malformed(format!("protobuf decode: {e}")))?;
	let request = WriteRequest::from_proto(pb);
	validate(&request)?;
	Ok(ParsedWrite {
		request,
		body_bytes,
	})
}

fn decompress(body: &[u8], encoding: Encoding, max_bytes: u64) -> Result<Vec<u8>, ParseError> {
	match encoding {
		Encoding::Identity => {
			if body.len() as u64 > max_bytes {
				return Err(ParseError::BodyTooLarge {
					observed: body.len() as u64,
					limit: max_bytes,
				});
			}
			Ok(body.to_vec())
		},
		Encoding::Snappy => {
			// Block-format snappy carries the decoded length up front, so the
			// bound is checked before any allocation happens.
			let decoded_len = snap::raw::decompress_len(body)
				.map_err(|e| ParseError::Malformed(format!("snappy header: {e}")))?;
			if decoded_len as u64 > max_bytes {
				return Err(ParseError::BodyTooLarge {
					observed: decoded_len as u64,
					limit: max_bytes,
				});
			}
			snap::raw::Decoder::new()
				.decompress_vec(body)
				.map_err(|e| ParseError::Malformed(format!("snappy: {e}")))
		},
		Encoding::Gzip => {
			// Gzip does not announce its decoded size; a capped reader aborts
			// the inflate as soon as the bound is crossed.
			let mut decoder =
				flate2::read::MultiGzDecoder::new(body).take(max_bytes.saturating_add(1));
			let mut out = Vec::new();
			decoder
				.read_to_end(&mut out)
				.map_err(|e| ParseError::Malformed(format!("gzip: {e}")))?;
			if out.len() as u64 > max_bytes {
				return Err(ParseError::BodyTooLarge {
					observed: out.len() as u64,
					limit: max_bytes,
				});
			}
			Ok(out)
		},
	}
}

fn validate(request: &WriteRequest) -> Result<(), ParseError> {
	for (i, series) in request.series.iter().enumerate() {
		if series.labels.is_empty() {
			return Err(ParseError::Malformed(format!("series {i} has no labels")));
		}
		if series.samples.is_empty() {
			return Err(ParseError::Malformed(format!("series {i} has no samples")));
		}
		if series.labels.iter().any(|l| l.name.is_empty()) {
			return Err(ParseError::Malformed(format!(
				"series {i} has an empty label name"
			)));
		}
		if series.metric_name().is_none() {
			return Err(ParseError::Malformed(format!(
				"series {i} is missing {METRIC_NAME_LABEL}"
			)));
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;
	use crate::types::series;

	fn encode_snappy(req: &WriteRequest) -> Vec<u8> {
		snap::raw::Encoder::new()
			.compress_vec(&req.encode_proto())
			.unwrap()
	}

	fn encode_gzip(req: &WriteRequest) -> Vec<u8> {
		let mut enc =
			flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
		enc.write_all(&req.encode_proto()).unwrap();
		enc.finish().unwrap()
	}

	fn sample_request() -> WriteRequest {
		WriteRequest {
			series: vec![
				series("up", &[("job", "node")], 2),
				series("http_requests_total", &[("code", "200")], 3),
			],
		}
	}

	#[test]
	fn parses_snappy_body() {
		let req = sample_request();
		let body = encode_snappy(&req);
		let parsed = parse_write_request(&body, Encoding::Snappy, 1 << 20).unwrap();
		assert_eq!(parsed.request, req);
		assert_eq!(parsed.body_bytes, req.encode_proto().len() as u64);
	}

	#[test]
	fn parses_gzip_body() {
		let req = sample_request();
		let body = encode_gzip(&req);
		let parsed = parse_write_request(&body, Encoding::Gzip, 1 << 20).unwrap();
		assert_eq!(parsed.request, req);
	}

	#[test]
	fn parses_identity_body() {
		let req = sample_request();
		let parsed =
			parse_write_request(&req.encode_proto(), Encoding::Identity, 1 << 20).unwrap();
		assert_eq!(parsed.request, req);
	}

	#[test]
	fn snappy_bound_checked_before_decompress() {
		let req = WriteRequest {
			series: vec![series("big", &[("pad", &"x".repeat(4096))], 64)],
		};
		let raw_len = req.encode_proto().len() as u64;
		let body = encode_snappy(&req);
		match parse_write_request(&body, Encoding::Snappy, 128).unwrap_err() {
			ParseError::BodyTooLarge { observed, limit } => {
				assert_eq!(observed, raw_len);
				assert_eq!(limit, 128);
			},
			other => panic!("expected BodyTooLarge, got {other:?}"),
		}
	}

	#[test]
	fn gzip_bound_short_circuits() {
		let req = WriteRequest {
			series: vec![series("big", &[("pad", &"x".repeat(8192))], 64)],
		};
		let body = encode_gzip(&req);
		assert!(matches!(
			parse_write_request(&body, Encoding::Gzip, 256).unwrap_err(),
			ParseError::BodyTooLarge { limit: 256, .. }
		));
	}

	#[test]
	fn rejects_unknown_encoding() {
		assert!(matches!(
			Encoding::from_content_encoding(Some("zstd")),
			Err(ParseError::UnsupportedEncoding(_))
		));
		assert_eq!(
			Encoding::from_content_encoding(Some("Snappy")).unwrap(),
			Encoding::Snappy
		);
		assert_eq!(
			Encoding::from_content_encoding(None).unwrap(),
			Encoding::Identity
		);
	}

	#[test]
	fn rejects_garbage_protobuf() {
		let err = parse_write_request(b"not protobuf at all", Encoding::Identity, 1 << 20)
			.unwrap_err();
		assert!(matches!(err, ParseError::Malformed(_)));
	}

	#[test]
	fn rejects_series_without_metric_name() {
		let mut req = sample_request();
		req.series[0].labels.retain(|l| l.name != METRIC_NAME_LABEL);
		let err =
			parse_write_request(&req.encode_proto(), Encoding::Identity, 1 << 20).unwrap_err();
		assert!(matches!(err, ParseError::Malformed(_)));
	}

	#[test]
	fn rejects_series_without_samples() {
		let mut req = sample_request();
		req.series[1].samples.clear();
		let err =
			parse_write_request(&req.encode_proto(), Encoding::Identity, 1 << 20).unwrap_err();
		assert!(matches!(err, ParseError::Malformed(_)));
	}
}
