//! Root-device hints: parsing, the operator grammar, and matching against
//! an inventory of [`BlockDevice`](crate::inventory::BlockDevice)s.
//!
//! A hint expression is `[<op>] <value> [<op> <value>]*`. Supported
//! operators are `==, !=, <, <=, >, >=, s==, s!=, <in>, <or>`. When no
//! operator is given the implicit operator is `==` for numeric/boolean
//! hints and `s==` for strings.
use std::collections::HashMap;

use log::{debug, info, warn};

use crate::{
	error::Error,
	inventory::{BlockDevice, StringAttr},
};

const MIN_ROOT_DEVICE_SIZE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	SEq,
	SNe,
	In,
	Or,
}

impl Operator {
	/// Longest-match-first token table, so `<=` is never mistaken for `<`.
	const TOKENS: &'static [(&'static str, Operator)] = &[
		("s==", Operator::SEq),
		("s!=", Operator::SNe),
		("<in>", Operator::In),
		("<or>", Operator::Or),
		("<=", Operator::Le),
		(">=", Operator::Ge),
		("==", Operator::Eq),
		("!=", Operator::Ne),
		("<", Operator::Lt),
		(">", Operator::Gt),
	];

	fn token(&self) -> &'static str {
		Self::TOKENS.iter().find(|(_, op)| op == self).unwrap().0
	}
}

#[derive(Debug, Clone)]
pub struct HintExpr {
	pub op: Operator,
	pub values: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum HintValue {
	Number(HintExpr),
	Text(HintExpr),
	Flag(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HintKind {
	Int,
	Str,
	Bool,
}

fn hint_kind(name: &str) -> Option<HintKind> {
	Some(match name {
		"size" => HintKind::Int,
		"rotational" => HintKind::Bool,
		"model" | "wwn" | "serial" | "vendor" | "wwn_with_extension" | "wwn_vendor_extension"
		| "name" | "hctl" | "by_path" | "tran" => HintKind::Str,
		_ => return None,
	})
}

/// Percent-encode whitespace and other characters `urllib.parse.quote`
/// would escape, leaving alphanumerics and `_.-~/` untouched.
fn url_quote(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for b in s.bytes() {
		match b {
			b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-' | b'~' | b'/' => {
				out.push(b as char)
			}
			_ => out.push_str(&format!("%{:02X}", b)),
		}
	}
	out
}

/// Split `expression` into the leading operator (if any, matched against
/// the longest token first) and the list of trimmed, non-empty values
/// separated by repetitions of that same operator (this is what allows
/// `<or> foo <or> bar` to yield two values).
fn extract_operator_and_values(expression: &str) -> (Option<Operator>, Vec<String>) {
	let trimmed = expression.trim();
	for (token, op) in Operator::TOKENS {
		if trimmed.starts_with(token) {
			let values: Vec<String> = trimmed
				.split(token)
				.map(|v| v.trim().to_owned())
				.filter(|v| !v.is_empty())
				.collect();
			return (Some(*op), values);
		}
	}
	(None, vec![trimmed.to_owned()])
}

fn normalize_string_expression(expression: &str) -> HintExpr {
	let lowered = expression.trim().to_lowercase();
	let (op, values) = extract_operator_and_values(&lowered);
	let op = op.unwrap_or(Operator::SEq);
	let values = values.iter().map(|v| url_quote(v)).collect();
	HintExpr { op, values }
}

fn parse_bool(expression: &str) -> Result<bool, Error> {
	match expression.trim().to_lowercase().as_str() {
		"1" | "true" | "yes" | "on" | "y" | "t" => Ok(true),
		"0" | "false" | "no" | "off" | "n" | "f" => Ok(false),
		other => Err(Error::InvalidCommandParams(format!(
			"root device hint is not a Boolean value: {other}"
		))),
	}
}

/// Parsed and normalized root device hints, as produced by
/// [`parse_root_device_hints`].
#[derive(Debug, Clone, Default)]
pub struct RootDeviceHints(HashMap<String, HintValue>);

impl RootDeviceHints {
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

/// Parse and normalize a raw `{hint name: expression}` mapping.
///
/// Unknown hint names are rejected up front. String hints are lower-cased
/// and URL-encoded; integer hints (`size`) must parse as positive
/// integers; boolean hints (`rotational`) are parsed leniently. Hints with
/// no explicit operator get the implicit default (`==` for numeric/bool,
/// `s==` for strings).
pub fn parse_root_device_hints(
	raw: &HashMap<String, String>,
) -> Result<RootDeviceHints, Error> {
	if raw.is_empty() {
		return Ok(RootDeviceHints::default());
	}

	let unsupported: Vec<&String> = raw.keys().filter(|k| hint_kind(k).is_none()).collect();
	if !unsupported.is_empty() {
		return Err(Error::DeviceNotFound(format!(
			"no device can be found because the following hints are not supported: {}",
			unsupported
				.iter()
				.map(|s| s.as_str())
				.collect::<Vec<_>>()
				.join(", ")
		)));
	}

	let mut hints = HashMap::new();
	for (name, expression) in raw {
		let kind = hint_kind(name).expect("checked above");
		let value = match kind {
			HintKind::Str => HintValue::Text(normalize_string_expression(expression)),
			HintKind::Int => {
				let (op, values) = extract_operator_and_values(&expression.to_lowercase());
				let mut parsed = Vec::with_capacity(values.len());
				for v in &values {
					let n: i64 = v.parse().map_err(|_| {
						Error::InvalidCommandParams(format!(
							"root device hint \"{name}\" is not an integer value: {expression}"
						))
					})?;
					if n <= 0 {
						return Err(Error::InvalidCommandParams(format!(
							"root device hint \"{name}\" should be a positive integer: {expression}"
						)));
					}
					parsed.push(n.to_string());
				}
				HintValue::Number(HintExpr {
					op: op.unwrap_or(Operator::Eq),
					values: parsed,
				})
			}
			HintKind::Bool => HintValue::Flag(parse_bool(expression)?),
		};
		hints.insert(name.clone(), value);
	}
	Ok(RootDeviceHints(hints))
}

fn match_string(device_value: &str, expr: &HintExpr) -> bool {
	let normalized = url_quote(&device_value.trim().to_lowercase());
	match expr.op {
		Operator::SEq => expr.values.first().map(|v| v == &normalized).unwrap_or(false),
		Operator::SNe => expr.values.first().map(|v| v != &normalized).unwrap_or(true),
		Operator::In => expr
			.values
			.first()
			.map(|v| normalized.contains(v.as_str()))
			.unwrap_or(false),
		Operator::Or => expr.values.iter().any(|v| v == &normalized),
		// Numeric operators applied to a string hint: fall back to string
		// ordering, mirroring oslo's generic specs_matcher comparator.
		Operator::Eq => expr.values.first().map(|v| v == &normalized).unwrap_or(false),
		Operator::Ne => expr.values.first().map(|v| v != &normalized).unwrap_or(true),
		Operator::Lt => expr.values.first().map(|v| normalized.as_str() < v.as_str()).unwrap_or(false),
		Operator::Le => expr.values.first().map(|v| normalized.as_str() <= v.as_str()).unwrap_or(false),
		Operator::Gt => expr.values.first().map(|v| normalized.as_str() > v.as_str()).unwrap_or(false),
		Operator::Ge => expr.values.first().map(|v| normalized.as_str() >= v.as_str()).unwrap_or(false),
	}
}

fn match_number(device_value: i64, expr: &HintExpr) -> Result<bool, Error> {
	let parse = |s: &str| -> Result<i64, Error> {
		s.parse()
			.map_err(|_| Error::InvalidCommandParams(format!("invalid numeric hint value: {s}")))
	};
	Ok(match expr.op {
		Operator::Eq => device_value == parse(&expr.values[0])?,
		Operator::Ne => device_value != parse(&expr.values[0])?,
		Operator::Lt => device_value < parse(&expr.values[0])?,
		Operator::Le => device_value <= parse(&expr.values[0])?,
		Operator::Gt => device_value > parse(&expr.values[0])?,
		Operator::Ge => device_value >= parse(&expr.values[0])?,
		Operator::Or => {
			let mut matched = false;
			for v in &expr.values {
				if device_value == parse(v)? {
					matched = true;
					break;
				}
			}
			matched
		}
		Operator::SEq | Operator::SNe | Operator::In => {
			device_value.to_string() == expr.values[0]
		}
	})
}

/// String-valued device attributes, possibly multi-valued (serial/wwn/...).
fn device_string_attr<'a>(device: &'a BlockDevice, name: &str) -> Option<&'a StringAttr> {
	match name {
		"model" => device.model.as_ref(),
		"vendor" => device.vendor.as_ref(),
		"serial" => device.serial.as_ref(),
		"wwn" => device.wwn.as_ref(),
		"wwn_with_extension" => device.wwn_with_extension.as_ref(),
		"wwn_vendor_extension" => device.wwn_vendor_extension.as_ref(),
		"name" => Some(&device.name_attr),
		"hctl" => device.hctl.as_ref(),
		"by_path" => device.by_path.as_ref(),
		"tran" => device.tran.as_ref(),
		_ => None,
	}
}

fn device_matches(device: &BlockDevice, hints: &RootDeviceHints) -> bool {
	for (name, hint_value) in &hints.0 {
		let satisfied = match hint_value {
			HintValue::Text(expr) => match device_string_attr(device, name) {
				Some(StringAttr::One(v)) => match_string(v, expr),
				Some(StringAttr::Many(values)) => {
					let usable: Vec<&String> = values.iter().filter(|v| !v.is_empty()).collect();
					if usable.is_empty() {
						warn!(
							"The attribute \"{}\" of device \"{}\" has an empty value, skipping device",
							name, device.name
						);
						false
					} else {
						usable.iter().any(|v| match_string(v, expr))
					}
				}
				None => false,
			},
			HintValue::Number(expr) => {
				if name == "size" {
					let gib = (device.size / (1024 * 1024 * 1024)) as i64;
					match_number(gib, expr).unwrap_or(false)
				} else {
					false
				}
			}
			HintValue::Flag(expected) => match device.rotational {
				Some(actual) => actual == *expected,
				None => {
					warn!(
						"The attribute \"{}\" of device \"{}\" is not a valid Boolean, skipping device",
						name, device.name
					);
					false
				}
			},
		};
		if !satisfied {
			debug!(
				"Device \"{}\" does not satisfy hint \"{}\"",
				device.name, name
			);
			return false;
		}
	}
	true
}

/// All devices in `devices` that satisfy every hint in `hints`, in input order.
pub fn find_devices_by_hints<'a>(
	devices: &'a [BlockDevice],
	hints: &RootDeviceHints,
) -> Vec<&'a BlockDevice> {
	devices.iter().filter(|d| device_matches(d, hints)).collect()
}

/// The root-device selector's full contract (spec §4.1): pick one
/// [`BlockDevice`] out of an inventory, either by hints or, absent any,
/// by the smallest device at least 4 GiB large.
pub fn select_root_device<'a>(
	devices: &'a [BlockDevice],
	hints: Option<&RootDeviceHints>,
) -> Result<&'a BlockDevice, Error> {
	match hints {
		Some(hints) if !hints.is_empty() => {
			let mut matches = find_devices_by_hints(devices, hints);
			if matches.is_empty() {
				return Err(Error::DeviceNotFound(
					"no device found that matches the root device hints".to_owned(),
				));
			}
			let dev = matches.remove(0);
			info!("Root device found: {} matches the given hints", dev.name);
			Ok(dev)
		}
		_ => {
			let mut sorted: Vec<&BlockDevice> = devices.iter().collect();
			sorted.sort_by_key(|d| d.size);
			let biggest = sorted.last().map(|d| d.size).unwrap_or(0);
			if sorted.is_empty() || biggest < MIN_ROOT_DEVICE_SIZE_BYTES {
				return Err(Error::DeviceNotFound(format!(
					"no suitable device was found for deployment - root device hints were not \
					 provided and all found block devices are smaller than {MIN_ROOT_DEVICE_SIZE_BYTES} bytes"
				)));
			}
			Ok(sorted
				.into_iter()
				.find(|d| d.size >= MIN_ROOT_DEVICE_SIZE_BYTES)
				.expect("biggest device already checked above the floor"))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::inventory::BlockDevice;

	fn hints_from(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn scenario_a_normalization() {
		let raw = hints_from(&[
			("model", "foo MODEL"),
			("serial", "foo-serial"),
			("size", "12345"),
			("rotational", "yes"),
		]);
		let parsed = parse_root_device_hints(&raw).unwrap();
		match &parsed.0["model"] {
			HintValue::Text(e) => {
				assert_eq!(e.op, Operator::SEq);
				assert_eq!(e.values, vec!["foo%20model"]);
			}
			_ => panic!("wrong kind"),
		}
		match &parsed.0["size"] {
			HintValue::Number(e) => {
				assert_eq!(e.op, Operator::Eq);
				assert_eq!(e.values, vec!["12345"]);
			}
			_ => panic!("wrong kind"),
		}
		match &parsed.0["rotational"] {
			HintValue::Flag(b) => assert!(*b),
			_ => panic!("wrong kind"),
		}
	}

	#[test]
	fn scenario_b_or_and_in() {
		let devices = vec![
			BlockDevice::new_for_test("/dev/sda", 64_424_509_440),
			BlockDevice {
				serial: Some(StringAttr::Many(vec!["vs".into(), "avs".into()])),
				model: Some(StringAttr::One("big model".into())),
				rotational: Some(true),
				..BlockDevice::new_for_test("/dev/sdb", 128_849_018_880)
			},
			BlockDevice {
				model: Some(StringAttr::One("small model".into())),
				rotational: Some(false),
				..BlockDevice::new_for_test("/dev/sdc", 10_737_418_240)
			},
		];
		let raw = hints_from(&[("rotational", "false"), ("model", "<in> small")]);
		let hints = parse_root_device_hints(&raw).unwrap();
		let found = select_root_device(&devices, Some(&hints)).unwrap();
		assert_eq!(found.name, "/dev/sdc");
	}

	#[test]
	fn unknown_hint_rejected() {
		let raw = hints_from(&[("bogus", "1")]);
		assert!(matches!(
			parse_root_device_hints(&raw),
			Err(Error::DeviceNotFound(_))
		));
	}

	#[test]
	fn non_positive_size_rejected() {
		let raw = hints_from(&[("size", "-5")]);
		assert!(matches!(
			parse_root_device_hints(&raw),
			Err(Error::InvalidCommandParams(_))
		));
	}

	#[test]
	fn idempotent_parse() {
		let raw = hints_from(&[("model", "Foo Model")]);
		let once = parse_root_device_hints(&raw).unwrap();
		// Re-serializing and re-parsing the normalized values is stable:
		// normalizing an already-normalized value is a no-op.
		let again_raw: HashMap<String, String> = match &once.0["model"] {
			HintValue::Text(e) => hints_from(&[("model", &format!("{} {}", e.op.token(), e.values[0]))]),
			_ => unreachable!(),
		};
		let twice = parse_root_device_hints(&again_raw).unwrap();
		match (&once.0["model"], &twice.0["model"]) {
			(HintValue::Text(a), HintValue::Text(b)) => assert_eq!(a.values, b.values),
			_ => unreachable!(),
		}
	}

	#[test]
	fn no_hints_picks_smallest_qualifying() {
		let devices = vec![
			BlockDevice::new_for_test("/dev/sda", 3 * 1024 * 1024 * 1024),
			BlockDevice::new_for_test("/dev/sdb", 8 * 1024 * 1024 * 1024),
			BlockDevice::new_for_test("/dev/sdc", 16 * 1024 * 1024 * 1024),
		];
		let found = select_root_device(&devices, None).unwrap();
		assert_eq!(found.name, "/dev/sdb");
	}
}
