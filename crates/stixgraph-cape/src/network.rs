//! Network traffic mapping and host aggregation

use crate::mappers::Mapped;
use crate::report::{Connection, Host};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use stixgraph_core::identity::IdentityMode;
use stixgraph_core::model::{attributes, Entity, Relationship, TypeTag};

pub const ADDRESS_ID_FIELDS: &[&str] = &["value"];
pub const DOMAIN_ID_FIELDS: &[&str] = &["value"];
pub const LOCATION_ID_FIELDS: &[&str] = &["country", "name"];
pub const TRAFFIC_ID_FIELDS: &[&str] = &[
    "start",
    "end",
    "src_ref",
    "dst_ref",
    "src_port",
    "dst_port",
    "protocols",
    "extensions",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Aligned IPv4 network block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Block {
    network: u32,
    prefix: u8,
}

impl Ipv4Block {
    /// Host bits of `address` beyond `prefix` are cleared
    pub fn new(address: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        Some(Self {
            network: u32::from(address) & Self::mask(prefix),
            prefix,
        })
    }

    pub fn host(address: Ipv4Addr) -> Self {
        Self {
            network: u32::from(address),
            prefix: 32,
        }
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn first(&self) -> u32 {
        self.network
    }

    pub fn last(&self) -> u32 {
        self.network | !Self::mask(self.prefix)
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & Self::mask(self.prefix) == self.network
    }
}

impl fmt::Display for Ipv4Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix == 32 {
            write!(f, "{}", self.network())
        } else {
            write!(f, "{}/{}", self.network(), self.prefix)
        }
    }
}

impl FromStr for Ipv4Block {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('/') {
            Some((address, prefix)) => {
                let address: Ipv4Addr = address.parse()?;
                // Out-of-range prefixes fall back to a host block
                let prefix = prefix.parse::<u8>().ok().filter(|p| *p <= 32).unwrap_or(32);
                Ok(Self::new(address, prefix).unwrap_or_else(|| Self::host(address)))
            }
            None => Ok(Self::host(s.trim().parse()?)),
        }
    }
}

/// Collapse blocks into the minimal exactly-covering set, sorted by address
pub fn collapse<I>(blocks: I) -> Vec<Ipv4Block>
where
    I: IntoIterator<Item = Ipv4Block>,
{
    let mut ranges: Vec<(u64, u64)> = blocks
        .into_iter()
        .map(|block| (block.first() as u64, block.last() as u64))
        .collect();
    ranges.sort_unstable();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some((_, last_end)) if start <= *last_end + 1 => *last_end = (*last_end).max(end),
            _ => merged.push((start, end)),
        }
    }

    merged
        .into_iter()
        .flat_map(|(start, end)| range_to_blocks(start, end))
        .collect()
}

/// Largest aligned blocks covering `[start, end]`
fn range_to_blocks(mut start: u64, end: u64) -> Vec<Ipv4Block> {
    let mut blocks = Vec::new();
    while start <= end {
        let mut bits = if start == 0 {
            32
        } else {
            start.trailing_zeros().min(32)
        };
        while bits > 0 && start + (1u64 << bits) - 1 > end {
            bits -= 1;
        }
        blocks.push(Ipv4Block {
            network: start as u32,
            prefix: (32 - bits) as u8,
        });
        start += 1u64 << bits;
    }
    blocks
}

pub fn address_entity(value: &str) -> Option<Entity> {
    Entity::new(
        TypeTag::Ipv4Address,
        IdentityMode::ContentDerived(ADDRESS_ID_FIELDS),
        attributes([("value", json!(value))]),
    )
}

pub fn domain_entity(value: &str) -> Option<Entity> {
    if value.is_empty() {
        return None;
    }
    Entity::new(
        TypeTag::DomainName,
        IdentityMode::ContentDerived(DOMAIN_ID_FIELDS),
        attributes([("value", json!(value))]),
    )
}

pub fn location_entity(country: &str) -> Option<Entity> {
    if country.is_empty() {
        return None;
    }
    Entity::new(
        TypeTag::Location,
        IdentityMode::ContentDerived(LOCATION_ID_FIELDS),
        attributes([("name", json!(country)), ("country", json!(country))]),
    )
}

/// Address entity for a literal traffic endpoint; non-IPv4 values are skipped
fn endpoint_entity(value: Option<&str>) -> Option<Entity> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match value.parse::<Ipv4Addr>() {
        Ok(_) => address_entity(value),
        Err(_) => {
            tracing::debug!(value, "skipping non-IPv4 traffic endpoint");
            None
        }
    }
}

/// One traffic entity per record, with both endpoints as address entities
pub fn map_traffic(records: &[Connection], protocol: Protocol) -> Mapped {
    let mut mapped = Mapped::new();

    for record in records {
        let src = endpoint_entity(record.src.as_deref());
        let dst = endpoint_entity(record.dst.as_deref());
        if src.is_none() && dst.is_none() {
            tracing::debug!(protocol = protocol.as_str(), "skipping traffic record without addresses");
            continue;
        }

        let traffic = Entity::new(
            TypeTag::NetworkTraffic,
            IdentityMode::ContentDerived(TRAFFIC_ID_FIELDS),
            attributes([
                ("src_ref", src.as_ref().map(|e| json!(e.id().to_string())).unwrap_or_default()),
                ("dst_ref", dst.as_ref().map(|e| json!(e.id().to_string())).unwrap_or_default()),
                ("src_port", json!(record.sport)),
                ("dst_port", json!(record.dport)),
                ("protocols", json!([protocol.as_str()])),
            ]),
        );

        for entity in [src, dst, traffic].into_iter().flatten() {
            mapped.link(entity);
        }
    }

    mapped
}

/// Group hosts by `(country, hostname)`, collapse each group's addresses
/// and link addresses, domains and locations.
pub fn map_hosts(hosts: &[Host]) -> Mapped {
    let mut groups: Vec<((&str, &str), Vec<Ipv4Block>)> = Vec::new();
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();

    for host in hosts {
        let block = match host.ip.parse::<Ipv4Block>() {
            Ok(block) => block,
            Err(_) => {
                tracing::warn!(ip = %host.ip, "skipping host with non-IPv4 address");
                continue;
            }
        };
        let key = (host.country_name.as_str(), host.hostname.as_str());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push((key, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(block);
    }

    let mut mapped = Mapped::new();
    let mut locations: HashMap<&str, Entity> = HashMap::new();

    for ((country, hostname), blocks) in groups {
        let location = location_entity(country)
            .map(|location| locations.entry(country).or_insert(location).clone());
        let domain = domain_entity(hostname);

        for block in collapse(blocks) {
            let Some(address) = address_entity(&block.to_string()) else {
                continue;
            };

            if let Some(location) = &location {
                mapped.include(Relationship::link(&address, location, "located-at"));
            }
            if let Some(domain) = &domain {
                if let Some(location) = &location {
                    mapped.include(Relationship::link(domain, location, "located-at"));
                }
                mapped.include(Relationship::link(&address, domain, "resolves-to"));
            }
            mapped.link(address);
        }

        if let Some(location) = location {
            mapped.link(location);
        }
        if let Some(domain) = domain {
            mapped.link(domain);
        }
    }

    mapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use stixgraph_core::model::StixObject;

    fn block(s: &str) -> Ipv4Block {
        s.parse().unwrap()
    }

    fn host(ip: &str, country: &str, hostname: &str) -> Host {
        Host {
            ip: ip.into(),
            country_name: country.into(),
            hostname: hostname.into(),
        }
    }

    fn edges(mapped: &Mapped, kind: &str) -> usize {
        mapped
            .objects
            .iter()
            .filter_map(StixObject::as_relationship)
            .filter(|r| r.relationship_type == kind)
            .count()
    }

    #[test]
    fn test_block_display() {
        assert_eq!(block("10.0.0.1").to_string(), "10.0.0.1");
        assert_eq!(block("10.0.0.7/30").to_string(), "10.0.0.4/30");
        assert!("example.org".parse::<Ipv4Block>().is_err());
    }

    #[test]
    fn test_collapse_adjacent_pair() {
        let collapsed = collapse([block("10.0.0.0"), block("10.0.0.1")]);
        assert_eq!(collapsed, vec![block("10.0.0.0/31")]);
    }

    #[test]
    fn test_collapse_unaligned_pair_stays_apart() {
        let collapsed = collapse([block("10.0.0.1"), block("10.0.0.2")]);
        assert_eq!(collapsed, vec![block("10.0.0.1"), block("10.0.0.2")]);
    }

    #[test]
    fn test_collapse_nested_and_duplicates() {
        let collapsed = collapse([
            block("192.168.1.0/24"),
            block("192.168.1.77"),
            block("192.168.0.0/24"),
            block("192.168.0.5"),
        ]);
        assert_eq!(collapsed, vec![block("192.168.0.0/23")]);
    }

    #[test]
    fn test_collapse_full_space() {
        let collapsed = collapse([block("0.0.0.0/1"), block("128.0.0.0/1")]);
        assert_eq!(collapsed, vec![block("0.0.0.0/0")]);
    }

    #[test]
    fn test_traffic_shares_address_entities() {
        let records = vec![
            Connection {
                src: Some("192.168.56.101".into()),
                dst: Some("8.8.8.8".into()),
                sport: Some(49152),
                dport: Some(53),
            },
            Connection {
                src: Some("192.168.56.101".into()),
                dst: Some("1.1.1.1".into()),
                sport: Some(49153),
                dport: Some(443),
            },
            Connection::default(),
        ];
        let mapped = map_traffic(&records, Protocol::Udp);

        let addresses = mapped
            .peripheral
            .iter()
            .filter(|e| e.type_tag() == TypeTag::Ipv4Address)
            .count();
        let flows: Vec<_> = mapped
            .peripheral
            .iter()
            .filter(|e| e.type_tag() == TypeTag::NetworkTraffic)
            .collect();
        assert_eq!(addresses, 3);
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].attribute("protocols"), Some(&json!(["udp"])));
        assert_eq!(flows[0].attribute("dst_port"), Some(&json!(53)));
    }

    #[test]
    fn test_traffic_is_deterministic() {
        let record = Connection {
            src: Some("10.0.0.1".into()),
            dst: Some("10.0.0.2".into()),
            sport: Some(1),
            dport: Some(2),
        };
        let a = map_traffic(std::slice::from_ref(&record), Protocol::Tcp);
        let b = map_traffic(std::slice::from_ref(&record), Protocol::Tcp);
        let ids = |m: &Mapped| m.peripheral.iter().map(|e| e.id().clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_hosts_grouped_and_linked() {
        let hosts = vec![
            host("10.0.0.0", "Germany", "cdn.example.org"),
            host("10.0.0.1", "Germany", "cdn.example.org"),
            host("203.0.113.9", "Germany", ""),
        ];
        let mapped = map_hosts(&hosts);

        let locations: Vec<_> = mapped
            .peripheral
            .iter()
            .filter(|e| e.type_tag() == TypeTag::Location)
            .collect();
        assert_eq!(locations.len(), 1);

        let values: BTreeSet<_> = mapped
            .peripheral
            .iter()
            .filter(|e| e.type_tag() == TypeTag::Ipv4Address)
            .map(|e| e.attribute("value").unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            values,
            BTreeSet::from(["10.0.0.0/31".to_string(), "203.0.113.9".to_string()])
        );

        assert_eq!(edges(&mapped, "located-at"), 3);
        assert_eq!(edges(&mapped, "resolves-to"), 1);
    }

    #[test]
    fn test_empty_country_keeps_resolution() {
        let mapped = map_hosts(&[host("198.51.100.4", "", "c2.example.net")]);
        assert!(mapped
            .peripheral
            .iter()
            .all(|e| e.type_tag() != TypeTag::Location));
        assert_eq!(edges(&mapped, "located-at"), 0);
        assert_eq!(edges(&mapped, "resolves-to"), 1);
    }

    #[test]
    fn test_ipv6_hosts_are_skipped() {
        let mapped = map_hosts(&[host("2001:db8::1", "France", "v6.example")]);
        assert!(mapped.peripheral.is_empty());
        assert!(mapped.objects.is_empty());
    }

    proptest! {
        #[test]
        fn prop_collapse_covers_exactly(addresses in prop::collection::vec(any::<u32>().prop_map(|a| a & 0x0000_03ff), 1..40)) {
            let input: BTreeSet<u32> = addresses.iter().copied().collect();
            let collapsed = collapse(input.iter().map(|a| Ipv4Block::host(Ipv4Addr::from(*a))));

            let covered: BTreeSet<u32> = collapsed
                .iter()
                .flat_map(|b| b.first()..=b.last())
                .collect();
            prop_assert_eq!(&covered, &input);

            for pair in collapsed.windows(2) {
                prop_assert!(pair[0].last() < pair[1].first());
            }
        }
    }
}
