//! Known relay regions.

use std::fmt;

use serde::Serialize;

use crate::error::ValidationError;

/// Endpoints of one relay region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub code: &'static str,
    pub name: &'static str,
    pub block_engine_url: &'static str,
    pub relayer_url: &'static str,
    pub shred_receiver_addr: &'static str,
    pub ntp_host: &'static str,
    pub testnet: bool,
}

pub const REGIONS: &[Region] = &[
    Region {
        code: "AMS",
        name: "Amsterdam",
        block_engine_url: "https://amsterdam.mainnet.block-engine.jito.wtf:443",
        relayer_url: "http://amsterdam.mainnet.relayer.jito.wtf:8100",
        shred_receiver_addr: "74.118.140.240:1002",
        ntp_host: "ntp.amsterdam.jito.wtf",
        testnet: false,
    },
    Region {
        code: "FFM",
        name: "Frankfurt",
        block_engine_url: "https://frankfurt.mainnet.block-engine.jito.wtf:443",
        relayer_url: "http://frankfurt.mainnet.relayer.jito.wtf:8100",
        shred_receiver_addr: "145.40.93.84:1002",
        ntp_host: "ntp.frankfurt.jito.wtf",
        testnet: false,
    },
    Region {
        code: "NY",
        name: "New York",
        block_engine_url: "https://ny.mainnet.block-engine.jito.wtf:443",
        relayer_url: "http://ny.mainnet.relayer.jito.wtf:8100",
        shred_receiver_addr: "141.98.216.96:1002",
        ntp_host: "ntp.dallas.jito.wtf",
        testnet: false,
    },
    Region {
        code: "TKY",
        name: "Tokyo",
        block_engine_url: "https://tokyo.mainnet.block-engine.jito.wtf:443",
        relayer_url: "http://tokyo.mainnet.relayer.jito.wtf:8100",
        shred_receiver_addr: "202.8.9.160:1002",
        ntp_host: "ntp.tokyo.jito.wtf",
        testnet: false,
    },
    Region {
        code: "BigD-TESTNET",
        name: "Dallas (testnet)",
        block_engine_url: "https://dallas.testnet.block-engine.jito.wtf:443",
        relayer_url: "http://dallas.testnet.relayer.jito.wtf:8100",
        shred_receiver_addr: "147.28.154.132:1002",
        ntp_host: "ntp.dallas.jito.wtf",
        testnet: true,
    },
    Region {
        code: "NY-TESTNET",
        name: "New York (testnet)",
        block_engine_url: "https://ny.testnet.block-engine.jito.wtf:443",
        relayer_url: "http://nyc.testnet.relayer.jito.wtf:8100",
        shred_receiver_addr: "141.98.216.97:1002",
        ntp_host: "ntp.dallas.jito.wtf",
        testnet: true,
    },
];

impl Region {
    pub fn lookup(code: &str) -> Option<&'static Region> {
        REGIONS.iter().find(|r| r.code.eq_ignore_ascii_case(code))
    }

    /// Like [`Region::lookup`], but an unknown code is an error.
    pub fn resolve(code: &str) -> Result<&'static Region, ValidationError> {
        Self::lookup(code)
            .ok_or_else(|| ValidationError::InvalidEndpoint(format!("unknown region '{code}'")))
    }

    /// Host and port of the block engine, suitable for a raw TCP dial.
    pub fn block_engine_authority(&self) -> &'static str {
        self.block_engine_url
            .split_once("://")
            .map_or(self.block_engine_url, |(_, rest)| rest)
    }

    /// JSON-RPC bundle endpoint of this region's block engine.
    pub fn bundles_url(&self) -> String {
        format!("{}/api/v1/bundles", self.block_engine_url)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.name)
    }
}
