// References:
// 1. https://dashif.org/docs/DASH-IF-IOP-v4.3.pdf, 3.2.9.3 (template identifiers)
// 2. ISO/IEC 23009-1, 5.3.9.4.4 (`$$` escape)

use regex::{Captures, Regex, Replacer};
use std::{collections::HashMap, sync::LazyLock};

// Only %0[width]d is allowed as a format tag, so no printf implementation is needed.
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"
static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$").unwrap()
});

/// Values substituted into `SegmentTemplate@media` and `SegmentTemplate@initialization`.
#[derive(Debug, Clone, Default)]
pub struct Template {
    args: HashMap<&'static str, String>,
}

impl Template {
    pub const REPRESENTATION_ID: &'static str = "RepresentationID";
    pub const NUMBER: &'static str = "Number";
    pub const TIME: &'static str = "Time";
    pub const BANDWIDTH: &'static str = "Bandwidth";

    pub fn new() -> Self {
        Self {
            args: HashMap::with_capacity(4),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &'static str, value: impl ToString) {
        self.args.insert(key, value.to_string());
    }

    /// Identifiers without a value are left untouched.
    pub fn resolve(&self, template: &str) -> String {
        TEMPLATE_REGEX
            .replace_all(template, TemplateReplacer(&self.args))
            .into_owned()
    }

    /// Whether `template` references `key` at all.
    pub fn mentions(template: &str, key: &str) -> bool {
        TEMPLATE_REGEX
            .captures_iter(template)
            .any(|caps| caps.get(1).is_some_and(|m| m.as_str() == key))
    }
}

struct TemplateReplacer<'a>(&'a HashMap<&'static str, String>);

impl Replacer for TemplateReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let Some(key) = caps.get(1) else {
            // `$$`
            dst.push('$');
            return;
        };
        let Some(value) = self.0.get(key.as_str()) else {
            dst.push_str(&caps[0]);
            return;
        };

        match caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(value),
        }
    }
}
