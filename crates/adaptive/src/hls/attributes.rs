use std::{borrow::Cow, collections::HashMap, sync::LazyLock};

use regex::{Captures, Regex, Replacer};

use crate::{
    error::{IoriError, IoriResult},
    model::Resolution,
    time::{secs_to_us, TimeUs},
};

// Example: `URI="{$host}/key?id={$id}"`
static VARIABLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\$([a-zA-Z0-9\-_]+)\}").unwrap());

/// Variables declared with `EXT-X-DEFINE`.
#[derive(Debug, Clone, Default)]
pub struct Variables(HashMap<String, String>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: String, value: String) {
        self.0.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.0.get(name)
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    /// Replaces every `{$name}` reference with its value. Unknown references are kept as-is.
    pub fn substitute<'a>(&self, input: &'a str) -> Cow<'a, str> {
        if self.0.is_empty() {
            return Cow::Borrowed(input);
        }
        VARIABLE_REGEX.replace_all(input, VariableReplacer(&self.0))
    }
}

struct VariableReplacer<'a>(&'a HashMap<String, String>);

impl Replacer for VariableReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        match self.0.get(&caps[1]) {
            Some(value) => dst.push_str(value),
            None => dst.push_str(&caps[0]),
        }
    }
}

/// A parsed `NAME=VALUE,...` attribute list.
///
/// Quoted values are stored without their quotes and with variables substituted.
#[derive(Debug, Default)]
pub struct Attributes {
    pairs: Vec<(String, String)>,
    line: usize,
}

impl Attributes {
    pub fn parse(input: &str, variables: &Variables, line: usize) -> Self {
        let mut pairs = Vec::new();
        let mut rest = input.trim();

        while !rest.is_empty() {
            let Some(eq) = rest.find('=') else {
                break;
            };
            let name = rest[..eq].trim().to_string();
            rest = &rest[eq + 1..];

            let value = if let Some(quoted) = rest.strip_prefix('"') {
                let end = quoted.find('"').unwrap_or(quoted.len());
                let value = variables.substitute(&quoted[..end]).into_owned();
                rest = quoted.get(end + 1..).unwrap_or("");
                value
            } else {
                let end = rest.find(',').unwrap_or(rest.len());
                let value = rest[..end].trim().to_string();
                rest = &rest[end..];
                value
            };
            rest = rest.trim_start().strip_prefix(',').unwrap_or(rest).trim_start();

            if !name.is_empty() {
                pairs.push((name, value));
            }
        }

        Self { pairs, line }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn required(&self, name: &str) -> IoriResult<&str> {
        self.get(name)
            .ok_or_else(|| IoriError::parse(self.line, format!("missing attribute {name}")))
    }

    pub fn string(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    pub fn decimal(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    pub fn required_decimal(&self, name: &str) -> IoriResult<u64> {
        let value = self.required(name)?;
        value
            .parse()
            .map_err(|_| IoriError::parse(self.line, format!("invalid {name}: {value}")))
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    pub fn seconds_us(&self, name: &str) -> Option<TimeUs> {
        self.float(name).map(secs_to_us)
    }

    pub fn required_seconds_us(&self, name: &str) -> IoriResult<TimeUs> {
        let value = self.required(name)?;
        value
            .parse::<f64>()
            .map(secs_to_us)
            .map_err(|_| IoriError::parse(self.line, format!("invalid {name}: {value}")))
    }

    /// `YES` is true, anything else (including absence) is false.
    pub fn flag(&self, name: &str) -> bool {
        self.get(name) == Some("YES")
    }

    pub fn resolution(&self, name: &str) -> Option<Resolution> {
        let (width, height) = self.get(name)?.split_once('x')?;
        Some(Resolution {
            width: width.parse().ok()?,
            height: height.parse().ok()?,
        })
    }
}
