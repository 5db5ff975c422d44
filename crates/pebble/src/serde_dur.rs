//! Serde adapter for Go-style duration strings ("1h", "30s", "1.5m").

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn parse(s: &str) -> Result<Duration, String> {
	let nanos = go_parse_duration::parse_duration(s).map_err(|e| format!("{e:?}"))?;
	if nanos < 0 {
		return Err(format!("negative duration {s:?}"));
	}
	Ok(Duration::from_nanos(nanos as u64))
}

pub fn format(d: Duration) -> String {
	durationfmt::to_string(d)
}

pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str(&format(*d))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
	let s = String::deserialize(deserializer)?;
	parse(&s).map_err(serde::de::Error::custom)
}

pub mod option {
	use super::*;

	pub fn serialize<S: Serializer>(
		d: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => serializer.serialize_some(&format(*d)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		let s = Option::<String>::deserialize(deserializer)?;
		s.map(|s| parse(&s).map_err(serde::de::Error::custom))
			.transpose()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_go_durations() {
		assert_eq!(parse("5s").unwrap(), Duration::from_secs(5));
		assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
		assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
		assert!(parse("-1s").is_err());
		assert!(parse("eleventy").is_err());
	}

	#[test]
	fn formats_go_durations() {
		assert_eq!(format(Duration::from_secs(1)), "1s");
		assert_eq!(format(Duration::from_secs(90)), "1m30s");
	}
}
