// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use option_parser::{ByteSized, ByteSizedParseError, OptionParser, OptionParserError};
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: u64 = 4096;
pub const DEFAULT_ROUNDS: u32 = 2;
pub const DEFAULT_VF_ID: u16 = 0;

/// Errors associated with `pds-dirty` parameters.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Error parsing --range")]
    ParseRange(#[source] OptionParserError),
    #[error("Error parsing --range: missing {0}")]
    ParseRangeMissing(&'static str),
    #[error("Error parsing --range: empty range")]
    ParseRangeEmpty,
    #[error("No --range given")]
    MissingRange,
    #[error("Error parsing --write")]
    ParseWrite(#[source] OptionParserError),
    #[error("Error parsing --write: missing {0}")]
    ParseWriteMissing(&'static str),
    #[error("Error parsing --page-size")]
    ParsePageSize(#[source] ByteSizedParseError),
    #[error("Error parsing --page-size: {0} is not a power of two")]
    InvalidPageSize(u64),
    #[error("Error parsing --window")]
    ParseWindow(#[source] ByteSizedParseError),
    #[error("Error parsing --window: {0} is not a non zero multiple of {1}")]
    InvalidWindow(u64, u64),
    #[error("Error parsing --rounds: {0}")]
    ParseRounds(String),
    #[error("Error parsing --max-segment")]
    ParseMaxSegment(#[source] ByteSizedParseError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A guest memory range to track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeConfig {
    pub start: u64,
    pub size: u64,
}

impl RangeConfig {
    pub const SYNTAX: &'static str =
        "Guest memory range to track \"start=<guest_address>,size=<range_size>\"";

    pub fn parse(range: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("start").add("size");
        parser.parse(range).map_err(ConfigError::ParseRange)?;

        let start = parser
            .convert::<ByteSized>("start")
            .map_err(ConfigError::ParseRange)?
            .ok_or(ConfigError::ParseRangeMissing("start"))?
            .0;
        let size = parser
            .convert::<ByteSized>("size")
            .map_err(ConfigError::ParseRange)?
            .ok_or(ConfigError::ParseRangeMissing("size"))?
            .0;
        if size == 0 || start.checked_add(size).is_none() {
            return Err(ConfigError::ParseRangeEmpty);
        }

        Ok(RangeConfig { start, size })
    }
}

/// A device write into guest memory, injected before the first sync round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteConfig {
    pub iova: u64,
    pub size: u64,
}

impl WriteConfig {
    pub const SYNTAX: &'static str =
        "Device DMA write to simulate \"iova=<guest_address>,size=<write_size>\"";

    pub fn parse(write: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("iova").add("size");
        parser.parse(write).map_err(ConfigError::ParseWrite)?;

        let iova = parser
            .convert::<ByteSized>("iova")
            .map_err(ConfigError::ParseWrite)?
            .ok_or(ConfigError::ParseWriteMissing("iova"))?
            .0;
        let size = parser
            .convert::<ByteSized>("size")
            .map_err(ConfigError::ParseWrite)?
            .ok_or(ConfigError::ParseWriteMissing("size"))?
            .0;

        Ok(WriteConfig { iova, size })
    }
}

pub struct DemoParams<'a> {
    pub ranges: Vec<&'a str>,
    pub page_size: Option<&'a str>,
    pub writes: Vec<&'a str>,
    pub window: Option<&'a str>,
    pub rounds: Option<&'a str>,
    pub max_segment: Option<&'a str>,
    pub json: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemoConfig {
    pub vf_id: u16,
    pub ranges: Vec<RangeConfig>,
    pub page_size: u64,
    pub writes: Vec<WriteConfig>,
    pub window: Option<u64>,
    pub rounds: u32,
    pub max_segment: Option<u64>,
    pub json: bool,
}

impl DemoConfig {
    pub fn parse(params: DemoParams) -> Result<Self> {
        let ranges = params
            .ranges
            .iter()
            .map(|r| RangeConfig::parse(r))
            .collect::<Result<Vec<_>>>()?;
        if ranges.is_empty() {
            return Err(ConfigError::MissingRange);
        }

        let page_size = match params.page_size {
            Some(p) => p.parse::<ByteSized>().map_err(ConfigError::ParsePageSize)?.0,
            None => DEFAULT_PAGE_SIZE,
        };
        if !page_size.is_power_of_two() {
            return Err(ConfigError::InvalidPageSize(page_size));
        }

        let writes = params
            .writes
            .iter()
            .map(|w| WriteConfig::parse(w))
            .collect::<Result<Vec<_>>>()?;

        // Windows must start on 64-bit words of the bitmaps.
        let window = params
            .window
            .map(|w| w.parse::<ByteSized>().map(|b| b.0))
            .transpose()
            .map_err(ConfigError::ParseWindow)?;
        if let Some(window) = window {
            let granule = page_size.saturating_mul(u64::from(u64::BITS));
            if window == 0 || window % granule != 0 {
                return Err(ConfigError::InvalidWindow(window, granule));
            }
        }

        let rounds = match params.rounds {
            Some(r) => r
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::ParseRounds(r.to_owned()))?,
            None => DEFAULT_ROUNDS,
        };

        let max_segment = params
            .max_segment
            .map(|m| m.parse::<ByteSized>().map(|b| b.0))
            .transpose()
            .map_err(ConfigError::ParseMaxSegment)?;

        Ok(DemoConfig {
            vf_id: DEFAULT_VF_ID,
            ranges,
            page_size,
            writes,
            window,
            rounds,
            max_segment,
            json: params.json,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(ranges: Vec<&'a str>) -> DemoParams<'a> {
        DemoParams {
            ranges,
            page_size: None,
            writes: Vec::new(),
            window: None,
            rounds: None,
            max_segment: None,
            json: false,
        }
    }

    #[test]
    fn test_range_parsing() {
        assert_eq!(
            RangeConfig::parse("start=0x100000,size=1M").unwrap(),
            RangeConfig {
                start: 0x10_0000,
                size: 0x10_0000
            }
        );
        assert!(matches!(
            RangeConfig::parse("start=0"),
            Err(ConfigError::ParseRangeMissing("size"))
        ));
        assert!(matches!(
            RangeConfig::parse("start=0,size=4K,foo=1"),
            Err(ConfigError::ParseRange(OptionParserError::UnknownOption(_)))
        ));
        assert!(matches!(
            RangeConfig::parse("start=0,size"),
            Err(ConfigError::ParseRange(OptionParserError::InvalidSyntax(_)))
        ));
        assert!(matches!(
            RangeConfig::parse("start=zero,size=4K"),
            Err(ConfigError::ParseRange(OptionParserError::Conversion(_, _)))
        ));
        assert!(matches!(
            RangeConfig::parse("start=0,size=0"),
            Err(ConfigError::ParseRangeEmpty)
        ));
    }

    #[test]
    fn test_write_parsing() {
        assert_eq!(
            WriteConfig::parse("iova=0x2000,size=8").unwrap(),
            WriteConfig {
                iova: 0x2000,
                size: 8
            }
        );
        assert!(matches!(
            WriteConfig::parse("size=8"),
            Err(ConfigError::ParseWriteMissing("iova"))
        ));
    }

    #[test]
    fn test_demo_config() {
        let config = DemoConfig::parse(params(vec!["start=0,size=1M"])).unwrap();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.rounds, DEFAULT_ROUNDS);
        assert_eq!(config.window, None);

        assert!(matches!(
            DemoConfig::parse(params(vec![])),
            Err(ConfigError::MissingRange)
        ));

        let mut p = params(vec!["start=0,size=1M"]);
        p.page_size = Some("3000");
        assert!(matches!(
            DemoConfig::parse(p),
            Err(ConfigError::InvalidPageSize(3000))
        ));

        let mut p = params(vec!["start=0,size=1M"]);
        p.window = Some("64K");
        assert!(matches!(
            DemoConfig::parse(p),
            Err(ConfigError::InvalidWindow(0x10000, 0x40000))
        ));

        let mut p = params(vec!["start=0,size=1M"]);
        p.window = Some("256K");
        p.rounds = Some("3");
        p.max_segment = Some("4K");
        let config = DemoConfig::parse(p).unwrap();
        assert_eq!(config.window, Some(256 << 10));
        assert_eq!(config.rounds, 3);
        assert_eq!(config.max_segment, Some(4096));
    }
}
