//! Reader for the text and OpenMetrics formats produced by this crate.
//!
//! Exemplars and timestamps are skipped; only series values are kept.

use stathe_common::error::{Result, StatheError};

use crate::types::MetricType;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSample {
    /// Full series name, e.g. `latency_bucket`.
    pub name: String,
    /// Sorted by label name.
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFamily {
    pub name: String,
    pub help: String,
    pub metric_type: Option<MetricType>,
    pub samples: Vec<ParsedSample>,
}

pub fn parse_text(input: &str) -> Result<Vec<ParsedFamily>> {
    let mut families: Vec<ParsedFamily> = Vec::new();

    for (index, raw) in input.lines().enumerate() {
        let line_number = index + 1;
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim_start();
            if comment == "EOF" {
                break;
            }
            if let Some(rest) = comment.strip_prefix("HELP ") {
                let (name, help) = rest.split_once(' ').unwrap_or((rest, ""));
                family_entry(&mut families, name).help = unescape(help, line_number)?;
            } else if let Some(rest) = comment.strip_prefix("TYPE ") {
                let (name, kind) = rest.split_once(' ').unwrap_or((rest, ""));
                let metric_type = match kind.trim() {
                    "unknown" | "untyped" => None,
                    kind => Some(MetricType::from_prometheus_type(kind).ok_or_else(|| {
                        parse_error(line_number, &format!("unknown metric type {kind:?}"))
                    })?),
                };
                family_entry(&mut families, name).metric_type = metric_type;
            }
            continue;
        }

        let sample = parse_sample(line, line_number)?;
        match families
            .iter_mut()
            .rev()
            .find(|family| belongs_to(&sample.name, &family.name))
        {
            Some(family) => family.samples.push(sample),
            None => families.push(ParsedFamily {
                name: sample.name.clone(),
                help: String::new(),
                metric_type: None,
                samples: vec![sample],
            }),
        }
    }

    Ok(families)
}

/// Parses a float as written by either format.
pub(crate) fn parse_value(value: &str) -> Option<f64> {
    match value {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

fn family_entry<'a>(families: &'a mut Vec<ParsedFamily>, name: &str) -> &'a mut ParsedFamily {
    let position = match families.iter().position(|family| family.name == name) {
        Some(position) => position,
        None => {
            families.push(ParsedFamily {
                name: name.to_string(),
                help: String::new(),
                metric_type: None,
                samples: Vec::new(),
            });
            families.len() - 1
        }
    };
    &mut families[position]
}

fn belongs_to(series: &str, family: &str) -> bool {
    if series == family {
        return true;
    }
    series
        .strip_prefix(family)
        .is_some_and(|suffix| {
            matches!(
                suffix,
                "_total" | "_created" | "_bucket" | "_sum" | "_count"
            )
        })
}

fn parse_sample(line: &str, line_number: usize) -> Result<ParsedSample> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_ascii_whitespace())
        .ok_or_else(|| parse_error(line_number, "sample without value"))?;
    let name = &line[..name_end];
    if name.is_empty() {
        return Err(parse_error(line_number, "sample without name"));
    }

    let mut rest = &line[name_end..];
    let mut labels = Vec::new();
    if rest.starts_with('{') {
        let (parsed, remainder) = parse_labels(&rest[1..], line_number)?;
        labels = parsed;
        rest = remainder;
    }

    // Drop an OpenMetrics exemplar, then an optional timestamp.
    let rest = rest.split(" # ").next().unwrap_or_default();
    let value = rest
        .split_ascii_whitespace()
        .next()
        .ok_or_else(|| parse_error(line_number, "sample without value"))?;
    let value = parse_value(value)
        .ok_or_else(|| parse_error(line_number, &format!("invalid value {value:?}")))?;

    labels.sort_by(|left: &(String, String), right| left.0.cmp(&right.0));
    Ok(ParsedSample {
        name: name.to_string(),
        labels,
        value,
    })
}

/// Parses `name="value",...}` and returns the labels and the text after `}`.
fn parse_labels(input: &str, line_number: usize) -> Result<(Vec<(String, String)>, &str)> {
    let mut labels = Vec::new();
    let mut rest = input.trim_start();

    loop {
        if let Some(after) = rest.strip_prefix('}') {
            return Ok((labels, after));
        }

        let (name, after_name) = rest
            .split_once('=')
            .ok_or_else(|| parse_error(line_number, "label without value"))?;
        let after_quote = after_name
            .trim_start()
            .strip_prefix('"')
            .ok_or_else(|| parse_error(line_number, "label value must be quoted"))?;

        let mut value = String::new();
        let mut chars = after_quote.char_indices();
        let mut end = None;
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    end = Some(offset);
                    break;
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '"')) => value.push('"'),
                    _ => return Err(parse_error(line_number, "invalid escape in label value")),
                },
                other => value.push(other),
            }
        }
        let end = end.ok_or_else(|| parse_error(line_number, "unterminated label value"))?;
        labels.push((name.trim().to_string(), value));

        rest = after_quote[end + 1..].trim_start();
        if let Some(after_comma) = rest.strip_prefix(',') {
            rest = after_comma.trim_start();
        } else if !rest.starts_with('}') {
            return Err(parse_error(line_number, "expected ',' or '}' after label"));
        }
    }
}

fn unescape(value: &str, line_number: usize) -> Result<String> {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => unescaped.push('\n'),
            Some('\\') => unescaped.push('\\'),
            Some('"') => unescaped.push('"'),
            _ => return Err(parse_error(line_number, "invalid escape in help text")),
        }
    }
    Ok(unescaped)
}

fn parse_error(line_number: usize, reason: &str) -> StatheError {
    StatheError::InvalidArgument(format!("exposition line {line_number}: {reason}"))
}
