// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Redaction applied to every payload before it reaches the queue.
//!
//! Two mechanisms run, in order:
//!
//! 1. **Tag suppression**: map entries (custom properties, message tags and
//!    extras, identify traits, HTTP headers) whose key matches a configured
//!    redaction tag are removed. Matching is case-insensitive.
//! 2. **Text sanitization**: free-form text (log arguments, messages,
//!    exception text, URLs, bodies, redux payloads and string properties)
//!    goes through the configured [`TextSanitizer`].
//!
//! Redaction is a pure function of the payload and the rule set, and applying
//! it twice yields the same payload as applying it once. Rules whose
//! placeholder and patterns overlap are rejected, and sanitization repeats
//! until the text stops changing.
//!
//! Card numbers are only recognized in their printed, separator-grouped form
//! and must pass the Luhn check, so numeric fields of JSON payloads such as
//! timestamps and ids are never rewritten.

use crate::config::{CaptureConfig, MaskRule, SanitizerType};
use crate::event::{EventPayload, PropertyValue};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

const EMAIL_PATTERN: &str = r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}";
// 4-4-4-4 (optionally with a trailing 3-digit group) or Amex 4-6-5.
const CARD_NUMBER_PATTERN: &str =
    r"\b(?:\d{4}[ -]){3}\d{4}(?:[ -]\d{3})?\b|\b\d{4}[ -]\d{6}[ -]\d{5}\b";

/// Passes before a text that keeps changing is masked as a whole.
const MAX_SANITIZE_PASSES: usize = 4;

/// Pluggable text scrubber.
pub trait TextSanitizer: Debug + Send + Sync {
    fn sanitize(&self, text: &str) -> String;
}

/// Leaves text unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSanitizer;

impl TextSanitizer for NoopSanitizer {
    fn sanitize(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Compiled mask rule.
#[derive(Clone, Debug)]
pub struct Rule {
    pub name: String,
    pub regex: regex::Regex,
    pub placeholder: String,
    /// Extra check a match must pass before it is masked.
    pub validate: Option<fn(&str) -> bool>,
}

impl Rule {
    fn overlaps(&self, other: &Rule) -> bool {
        self.regex.is_match(&other.placeholder) || other.regex.is_match(&self.placeholder)
    }
}

/// Luhn checksum over the digits of `candidate`.
fn passes_luhn(candidate: &str) -> bool {
    let digits: Vec<u32> = candidate.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| match (i % 2, d * 2) {
            (0, _) => d,
            (_, doubled) if doubled > 9 => doubled - 9,
            (_, doubled) => doubled,
        })
        .sum();
    sum % 10 == 0
}

/// Replaces every match of its rules with the rule placeholder.
#[derive(Clone, Debug)]
pub struct PatternSanitizer {
    rules: Vec<Rule>,
}

impl Default for PatternSanitizer {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl PatternSanitizer {
    /// Builds a sanitizer with the built-in email and card-number rules
    /// followed by `extra_rules`.
    ///
    /// Rules with an invalid pattern are logged and skipped, and so are rules
    /// whose pattern matches a placeholder (their own, `[REDACTED]` or that of
    /// an earlier rule) or whose placeholder matches an earlier pattern.
    #[must_use]
    pub fn new(extra_rules: &[MaskRule]) -> Self {
        let builtin: [(MaskRule, Option<fn(&str) -> bool>); 2] = [
            (
                MaskRule {
                    name: "email".to_string(),
                    pattern: EMAIL_PATTERN.to_string(),
                    replace_placeholder: None,
                },
                None,
            ),
            (
                MaskRule {
                    name: "card_number".to_string(),
                    pattern: CARD_NUMBER_PATTERN.to_string(),
                    replace_placeholder: None,
                },
                Some(passes_luhn),
            ),
        ];

        let mut rules: Vec<Rule> = Vec::new();
        let candidates = builtin
            .iter()
            .map(|(rule, validate)| (rule, *validate))
            .chain(extra_rules.iter().map(|rule| (rule, None)));
        for (rule, validate) in candidates {
            let regex = match regex::Regex::new(&rule.pattern) {
                Ok(regex) => regex,
                Err(e) => {
                    debug!("REDACTION | Failed to compile rule '{}': {}", rule.name, e);
                    continue;
                }
            };
            let compiled = Rule {
                name: rule.name.clone(),
                regex,
                placeholder: rule
                    .replace_placeholder
                    .clone()
                    .unwrap_or_else(|| REDACTED_PLACEHOLDER.to_string()),
                validate,
            };

            if compiled.regex.is_match(REDACTED_PLACEHOLDER)
                || compiled.overlaps(&compiled)
                || rules.iter().any(|accepted| accepted.overlaps(&compiled))
            {
                debug!(
                    "REDACTION | Skipping rule '{}': its pattern and a mask placeholder overlap",
                    rule.name
                );
                continue;
            }
            rules.push(compiled);
        }

        Self { rules }
    }

    fn pass(&self, text: &str) -> String {
        let mut sanitized = text.to_string();
        for rule in &self.rules {
            if !rule.regex.is_match(&sanitized) {
                continue;
            }
            sanitized = match rule.validate {
                Some(validate) => rule
                    .regex
                    .replace_all(&sanitized, |caps: &regex::Captures<'_>| {
                        if validate(&caps[0]) {
                            rule.placeholder.clone()
                        } else {
                            caps[0].to_string()
                        }
                    })
                    .into_owned(),
                None => rule
                    .regex
                    .replace_all(&sanitized, rule.placeholder.as_str())
                    .into_owned(),
            };
        }
        sanitized
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

impl TextSanitizer for PatternSanitizer {
    fn sanitize(&self, text: &str) -> String {
        let mut current = text.to_string();
        for _ in 0..MAX_SANITIZE_PASSES {
            let next = self.pass(&current);
            if next == current {
                return current;
            }
            current = next;
        }
        debug!("REDACTION | Masks did not settle, redacting the whole text");
        REDACTED_PLACEHOLDER.to_string()
    }
}

#[derive(Clone, Debug)]
pub struct Redactor {
    tags: HashSet<String>,
    sanitizer: Arc<dyn TextSanitizer>,
}

impl Redactor {
    #[must_use]
    pub fn new(tags: &[String], sanitizer: Arc<dyn TextSanitizer>) -> Self {
        Self {
            tags: tags.iter().map(|tag| tag.to_lowercase()).collect(),
            sanitizer,
        }
    }

    #[must_use]
    pub fn from_config(config: &CaptureConfig) -> Self {
        let sanitizer: Arc<dyn TextSanitizer> = match config.text_sanitizer {
            SanitizerType::Excluded => Arc::new(PatternSanitizer::new(&config.mask_rules)),
            SanitizerType::None => Arc::new(NoopSanitizer),
        };
        Self::new(&config.redaction_tags, sanitizer)
    }

    fn is_tagged(&self, key: &str) -> bool {
        !self.tags.is_empty() && self.tags.contains(&key.to_lowercase())
    }

    fn text(&self, text: &mut String) {
        *text = self.sanitizer.sanitize(text);
    }

    fn map(&self, map: &mut BTreeMap<String, String>, sanitize_values: bool) {
        map.retain(|key, _| !self.is_tagged(key));
        if sanitize_values {
            map.values_mut().for_each(|value| self.text(value));
        }
    }

    #[must_use]
    pub fn redact(&self, payload: EventPayload) -> EventPayload {
        match payload {
            EventPayload::Log(mut e) => {
                e.args.iter_mut().for_each(|arg| self.text(arg));
                EventPayload::Log(e)
            }
            EventPayload::Custom(mut e) => {
                e.properties.retain(|key, _| !self.is_tagged(key));
                for value in e.properties.values_mut() {
                    if let PropertyValue::Strings(strings) = value {
                        strings.iter_mut().for_each(|s| self.text(s));
                    }
                }
                EventPayload::Custom(e)
            }
            EventPayload::Message(mut e) => {
                self.text(&mut e.message);
                self.map(&mut e.tags, true);
                self.map(&mut e.extra, true);
                EventPayload::Message(e)
            }
            EventPayload::Exception(mut e) => {
                self.text(&mut e.error_message);
                self.text(&mut e.stack_trace);
                EventPayload::Exception(e)
            }
            EventPayload::NetworkRequest(mut e) => {
                self.text(&mut e.url);
                self.map(&mut e.headers, false);
                if let Some(body) = e.body.as_mut() {
                    self.text(body);
                }
                EventPayload::NetworkRequest(e)
            }
            EventPayload::NetworkResponse(mut e) => {
                self.map(&mut e.headers, false);
                if let Some(body) = e.body.as_mut() {
                    self.text(body);
                }
                EventPayload::NetworkResponse(e)
            }
            EventPayload::ReduxInitialState(mut e) => {
                self.text(&mut e.state);
                EventPayload::ReduxInitialState(e)
            }
            EventPayload::ReduxAction(mut e) => {
                self.text(&mut e.action);
                self.text(&mut e.state_delta);
                EventPayload::ReduxAction(e)
            }
            // Identity is sent on purpose, only tagged traits are dropped.
            EventPayload::Identify(mut e) => {
                self.map(&mut e.traits, false);
                EventPayload::Identify(e)
            }
        }
    }
}
