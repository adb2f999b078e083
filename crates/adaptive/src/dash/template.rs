// References:
// 1. https://github.com/clitic/vsd/blob/30ca1985e4a467ea3304b11c08d3176deaafd22a/vsd/src/dash/template.rs
// 2. https://github.com/emarsden/dash-mpd-rs/blob/6ebdfb4759adbda8233b5b3520804e23ff86e7de/src/fetch.rs#L435-L466

use regex::{Captures, Regex, Replacer};
use std::sync::LazyLock;

// Only `%0[width]d` is permitted as a format tag (DASH-IF IOP 4.3).
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth|)(?:%0([\d]+)d)?\$").unwrap()
});

/// A `SegmentTemplate@media` or `@initialization` URL, already resolved against its base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate(String);

/// Values substituted into a [`UrlTemplate`].
#[derive(Debug, Clone, Copy)]
pub struct TemplateArgs<'a> {
    pub representation_id: &'a str,
    pub bandwidth: u64,
    pub number: Option<u64>,
    pub time: Option<u64>,
}

impl UrlTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resolve(&self, args: TemplateArgs<'_>) -> String {
        TEMPLATE_REGEX
            .replace_all(&self.0, TemplateReplacer(args))
            .into_owned()
    }
}

struct TemplateReplacer<'a>(TemplateArgs<'a>);

impl Replacer for TemplateReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let value = match &caps[1] {
            // `$$` is an escaped dollar sign
            "" => {
                dst.push('$');
                return;
            }
            "RepresentationID" => Some(self.0.representation_id.to_string()),
            "Bandwidth" => Some(self.0.bandwidth.to_string()),
            "Number" => self.0.number.map(|n| n.to_string()),
            "Time" => self.0.time.map(|t| t.to_string()),
            _ => None,
        };
        let Some(value) = value else {
            dst.push_str(&caps[0]);
            return;
        };

        match caps.get(2).and_then(|w| w.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(&value),
        }
    }
}
