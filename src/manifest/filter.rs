/*
 *  manifest/filter.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Select/disable pattern filters for drivers and layers
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use log::warn;

/// Most patterns honoured in one filter string
pub const MAX_FILTER_PATTERNS: usize = 16;

/// Keyword matching every name, in any filter
pub const ALL_TOKEN: &str = "~all~";

/// One comma-separated token of a filter string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterPattern {
    All,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Substring(String),
}

impl FilterPattern {
    /// Parse a single (already lowercased and trimmed) token
    pub fn parse(token: &str) -> Option<Self> {
        if token.is_empty() {
            return None;
        }
        if token == "*" || token == "**" || token == ALL_TOKEN {
            return Some(Self::All);
        }
        let leading = token.starts_with('*');
        let trailing = token.len() > 1 && token.ends_with('*');
        let inner = &token[usize::from(leading)..token.len() - usize::from(trailing)];
        Some(match (leading, trailing) {
            (true, true) => Self::Substring(inner.to_string()),
            (true, false) => Self::Suffix(inner.to_string()),
            (false, true) => Self::Prefix(inner.to_string()),
            (false, false) => Self::Exact(inner.to_string()),
        })
    }

    /// Case-insensitive match against a candidate name
    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        match self {
            Self::All => true,
            Self::Exact(p) => name == *p,
            Self::Prefix(p) => p.len() <= name.len() && name.starts_with(p.as_str()),
            Self::Suffix(p) => p.len() <= name.len() && name.ends_with(p.as_str()),
            Self::Substring(p) => p.len() <= name.len() && name.contains(p.as_str()),
        }
    }
}

/// A parsed filter string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    patterns: Vec<FilterPattern>,
}

impl Filter {
    pub fn parse(value: &str) -> Self {
        let mut patterns = Vec::new();
        for token in value.split(',').map(|t| t.trim().to_ascii_lowercase()) {
            if token.is_empty() {
                continue;
            }
            if patterns.len() == MAX_FILTER_PATTERNS {
                warn!("filter \"{}\" has more than {} patterns, ignoring the rest", value, MAX_FILTER_PATTERNS);
                break;
            }
            patterns.extend(FilterPattern::parse(&token));
        }
        Self { patterns }
    }

    pub fn parse_opt(value: Option<&str>) -> Option<Self> {
        value.map(Self::parse).filter(|f| !f.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[FilterPattern] {
        &self.patterns
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

/// Outcome of running a candidate through select/disable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Neither filter said anything
    Default,
    /// The select filter matched, even if disabled
    ForcedOn,
    Disabled,
    /// A select filter exists and did not match
    Excluded,
}

impl FilterVerdict {
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Default | Self::ForcedOn)
    }
}

/// Disable first, then select. A select match overrides disable; a select
/// filter that does not match excludes the candidate outright.
pub fn evaluate(name: &str, select: Option<&Filter>, disable: Option<&Filter>) -> FilterVerdict {
    let disabled = disable.is_some_and(|d| d.matches(name));
    match select {
        Some(select) if select.matches(name) => FilterVerdict::ForcedOn,
        Some(_) => FilterVerdict::Excluded,
        None if disabled => FilterVerdict::Disabled,
        None => FilterVerdict::Default,
    }
}

/// Layer disable filter, which also understands the `~all~`,
/// `~implicit~` and `~explicit~` keywords
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerDisableFilter {
    pub all: bool,
    pub implicit: bool,
    pub explicit: bool,
    pub names: Filter,
}

impl LayerDisableFilter {
    pub fn parse(value: &str) -> Self {
        let mut out = Self::default();
        let mut rest = Vec::new();
        for token in value.split(',').map(|t| t.trim().to_ascii_lowercase()) {
            match token.as_str() {
                ALL_TOKEN => out.all = true,
                "~implicit~" => out.implicit = true,
                "~explicit~" => out.explicit = true,
                "" => {}
                _ => rest.push(token),
            }
        }
        out.names = Filter::parse(&rest.join(","));
        out
    }

    pub fn matches(&self, name: &str, implicit: bool) -> bool {
        self.all
            || (implicit && self.implicit)
            || (!implicit && self.explicit)
            || self.names.matches(name)
    }
}
