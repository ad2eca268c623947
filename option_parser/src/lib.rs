// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Parsing of `key=value,key=value` command line parameters.

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, Option<String>>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* field */, String /* value */),
}
type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

impl OptionParser {
    pub fn new() -> Self {
        Self {
            options: HashMap::new(),
        }
    }

    pub fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in input.trim().split(',') {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| OptionParserError::InvalidSyntax(option.to_owned()))?;
            match self.options.get_mut(key.trim()) {
                None => return Err(OptionParserError::UnknownOption(key.to_owned())),
                Some(v) => *v = Some(value.trim().to_owned()),
            }
        }

        Ok(())
    }

    pub fn add(&mut self, option: &str) -> &mut Self {
        assert!(
            !option.contains(['=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(option.to_owned(), None);

        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .cloned()
            .flatten()
            .filter(|s| !s.is_empty())
    }

    pub fn is_set(&self, option: &str) -> bool {
        self.get(option).is_some()
    }

    pub fn convert<T: FromStr>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.get(option) {
            None => Ok(None),
            Some(v) => Ok(Some(v.parse().map_err(|_| {
                OptionParserError::Conversion(option.to_owned(), v.to_owned())
            })?)),
        }
    }
}

/// A byte count or an address: decimal, or hexadecimal with a `0x` prefix,
/// optionally followed by a `K`, `M` or `G` binary multiplier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteSized(pub u64);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ByteSizedParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl FromStr for ByteSized {
    type Err = ByteSizedParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let shift = if s.ends_with('K') {
            10
        } else if s.ends_with('M') {
            20
        } else if s.ends_with('G') {
            30
        } else {
            0
        };

        let digits = s.trim_end_matches(['K', 'M', 'G']);
        let value = match digits.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => digits.parse::<u64>(),
        }
        .map_err(|_| ByteSizedParseError::InvalidValue(s.to_owned()))?;

        value
            .checked_mul(1 << shift)
            .map(ByteSized)
            .ok_or_else(|| ByteSizedParseError::InvalidValue(s.to_owned()))
    }
}
