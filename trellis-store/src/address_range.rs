// Copyright 2024 The Trellis Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::net::Ipv4Addr;
use std::collections::BTreeSet;

use trellis_config::pools::AddressRangeSpec;
use trellis_error::{Code, Error, ResultExt, error_if};

/// The span of addresses a pool hands allocations out of. Both bounds
/// are inclusive and reserved addresses are never handed out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRange {
    subnet: String,
    start: u32,
    end: u32,
    reserved: BTreeSet<u32>,
}

fn parse_address(value: &str) -> Result<u32, Error> {
    value
        .parse::<Ipv4Addr>()
        .map(u32::from)
        .err_tip(|| format!("while parsing address {value}"))
}

fn parse_subnet(value: &str) -> Result<(u32, u32), Error> {
    let (base, mask_bits) = value.split_once('/').err_tip_with_code(|_| {
        (
            Code::InvalidArgument,
            format!("Subnet {value} is not in CIDR notation"),
        )
    })?;
    let base = parse_address(base)?;
    let mask_bits = mask_bits
        .parse::<u8>()
        .err_tip(|| format!("while parsing prefix length of {value}"))?;
    error_if!(
        mask_bits > 32,
        "Subnet {value} has an impossible prefix length"
    );
    let mask = if mask_bits == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(mask_bits))
    };
    Ok((base & mask, mask))
}

impl AddressRange {
    pub fn new(spec: &AddressRangeSpec) -> Result<Self, Error> {
        let (network, mask) = parse_subnet(&spec.subnet)?;
        let start = parse_address(&spec.range_start)?;
        let end = parse_address(&spec.range_end)?;
        error_if!(
            start > end,
            "Range start {} is above range end {}",
            spec.range_start,
            spec.range_end
        );
        error_if!(
            start & mask != network || end & mask != network,
            "Range {}-{} does not fit inside subnet {}",
            spec.range_start,
            spec.range_end,
            spec.subnet
        );
        let mut reserved = BTreeSet::new();
        for addr in &spec.reserved {
            reserved.insert(parse_address(addr)?);
        }
        Ok(Self {
            subnet: spec.subnet.clone(),
            start,
            end,
            reserved,
        })
    }

    /// The subnet this range lives in, as configured.
    pub fn subnet(&self) -> &str {
        &self.subnet
    }

    /// Number of addresses this range can hand out.
    pub fn capacity(&self) -> u64 {
        let span = u64::from(self.end) - u64::from(self.start) + 1;
        let reserved_inside = self
            .reserved
            .iter()
            .filter(|addr| (self.start..=self.end).contains(addr))
            .count() as u64;
        span - reserved_inside
    }

    /// True if `address` is one this range may hand out.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        let addr = u32::from(address);
        (self.start..=self.end).contains(&addr) && !self.reserved.contains(&addr)
    }

    /// All addresses this range may hand out, ascending.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (self.start..=self.end)
            .filter(|addr| !self.reserved.contains(addr))
            .map(Ipv4Addr::from)
    }
}

impl TryFrom<&AddressRangeSpec> for AddressRange {
    type Error = Error;

    fn try_from(spec: &AddressRangeSpec) -> Result<Self, Error> {
        Self::new(spec)
    }
}
