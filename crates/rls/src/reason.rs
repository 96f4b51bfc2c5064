use std::fmt;

/// Why a write was denied (or would have been, had filtering not rescued
/// it). The string forms are stable: they appear in metrics labels, denial
/// records, and client-facing JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
	ParseError,
	BodyTooLarge,
	RateLimited,
	SeriesLimit,
	LabelsLimit,
	LabelValueLength,
	PolicyViolation,
	DeadlineExceeded,
	InternalError,
}

impl Reason {
	pub const ALL: [Reason; 9] = [
		Reason::ParseError,
		Reason::BodyTooLarge,
		Reason::RateLimited,
		Reason::SeriesLimit,
		Reason::LabelsLimit,
		Reason::LabelValueLength,
		Reason::PolicyViolation,
		Reason::DeadlineExceeded,
		Reason::InternalError,
	];

	pub const COUNT: usize = Self::ALL.len();

	pub fn as_str(&self) -> &'static str {
		match self {
			Reason::ParseError => "parse_error",
			Reason::BodyTooLarge => "body_too_large",
			Reason::RateLimited => "rate_limited",
			Reason::SeriesLimit => "series_limit",
			Reason::LabelsLimit => "labels_limit",
			Reason::LabelValueLength => "label_value_length",
			Reason::PolicyViolation => "policy_violation",
			Reason::DeadlineExceeded => "deadline_exceeded",
			Reason::InternalError => "internal_error",
		}
	}

	pub fn index(&self) -> usize {
		Self::ALL
			.iter()
			.position(|r| r == self)
			.expect("reason is in ALL")
	}

	/// The HTTP status the proxy should translate this denial into.
	pub fn http_status(&self) -> u16 {
		match self {
			Reason::ParseError => 400,
			Reason::BodyTooLarge => 413,
			Reason::RateLimited | Reason::SeriesLimit => 429,
			Reason::LabelsLimit | Reason::LabelValueLength => 429,
			Reason::PolicyViolation => 403,
			Reason::DeadlineExceeded | Reason::InternalError => 500,
		}
	}

	/// Transient reasons are subject to the process-wide failure-mode
	/// switch rather than hard denial.
	pub fn is_transient(&self) -> bool {
		matches!(self, Reason::DeadlineExceeded | Reason::InternalError)
	}
}

impl fmt::Display for Reason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl serde::Serialize for Reason {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn index_round_trips() {
		for (i, r) in Reason::ALL.iter().enumerate() {
			assert_eq!(r.index(), i);
		}
	}

	#[test]
	fn status_mapping() {
		assert_eq!(Reason::ParseError.http_status(), 400);
		assert_eq!(Reason::BodyTooLarge.http_status(), 413);
		assert_eq!(Reason::RateLimited.http_status(), 429);
		assert_eq!(Reason::PolicyViolation.http_status(), 403);
	}
}
