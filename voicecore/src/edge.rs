//! Edge and legacy region resolution into signaling endpoint URIs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Edge used when neither an edge nor a region is configured.
pub const DEFAULT_EDGE: &str = "roaming";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub name: &'static str,
    pub region: &'static str,
    pub host: &'static str,
}

const EDGES: &[Edge] = &[
    Edge { name: "sydney", region: "au1", host: "chunderw-vpc-gll-au1.twilio.com" },
    Edge { name: "sao-paulo", region: "br1", host: "chunderw-vpc-gll-br1.twilio.com" },
    Edge { name: "dublin", region: "ie1", host: "chunderw-vpc-gll-ie1.twilio.com" },
    Edge { name: "frankfurt", region: "de1", host: "chunderw-vpc-gll-de1.twilio.com" },
    Edge { name: "tokyo", region: "jp1", host: "chunderw-vpc-gll-jp1.twilio.com" },
    Edge { name: "singapore", region: "sg1", host: "chunderw-vpc-gll-sg1.twilio.com" },
    Edge { name: "ashburn", region: "us1", host: "chunderw-vpc-gll-us1.twilio.com" },
    Edge { name: "umatilla", region: "us2", host: "chunderw-vpc-gll-us2.twilio.com" },
    Edge { name: "roaming", region: "gll", host: "chunderw-vpc-gll.twilio.com" },
    Edge { name: "ashburn-ix", region: "us1-ix", host: "chunderw-vpc-gll-us1-ix.twilio.com" },
    Edge { name: "san-jose-ix", region: "us2-ix", host: "chunderw-vpc-gll-us2-ix.twilio.com" },
    Edge { name: "london-ix", region: "gb1-ix", host: "chunderw-vpc-gll-gb1-ix.twilio.com" },
    Edge { name: "frankfurt-ix", region: "de1-ix", host: "chunderw-vpc-gll-de1-ix.twilio.com" },
    Edge { name: "singapore-ix", region: "sg1-ix", host: "chunderw-vpc-gll-sg1-ix.twilio.com" },
    Edge { name: "sydney-ix", region: "au1-ix", host: "chunderw-vpc-gll-au1-ix.twilio.com" },
    Edge { name: "tokyo-ix", region: "jp1-ix", host: "chunderw-vpc-gll-jp1-ix.twilio.com" },
];

/// Deprecated region spellings still accepted from older configurations.
const DEPRECATED_REGIONS: &[(&str, &str)] = &[
    ("au", "au1"),
    ("br", "br1"),
    ("ie", "ie1"),
    ("jp", "jp1"),
    ("sg", "sg1"),
    ("us-va", "us1"),
    ("us-or", "us1"),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EdgeError {
    #[error("edge and region are mutually exclusive")]
    EdgeAndRegion,
    #[error("edge name must not be empty")]
    EmptyEdge,
    #[error("region must not be empty")]
    EmptyRegion,
}

/// Edge configuration: a single edge or an ordered fallback list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EdgeConfig {
    Single(String),
    Ordered(Vec<String>),
}

impl EdgeConfig {
    fn names(&self) -> Vec<&str> {
        match self {
            EdgeConfig::Single(name) => vec![name.as_str()],
            EdgeConfig::Ordered(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for EdgeConfig {
    fn from(name: &str) -> Self {
        EdgeConfig::Single(name.to_string())
    }
}

impl From<Vec<String>> for EdgeConfig {
    fn from(names: Vec<String>) -> Self {
        EdgeConfig::Ordered(names)
    }
}

pub fn find_edge(name: &str) -> Option<&'static Edge> {
    EDGES.iter().find(|e| e.name == name)
}

fn canonical_region(region: &str) -> &str {
    DEPRECATED_REGIONS
        .iter()
        .find(|(alias, _)| *alias == region)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(region)
}

/// Translates a legacy region code into its edge name, if known.
pub fn region_to_edge(region: &str) -> Option<&'static str> {
    let region = canonical_region(region);
    EDGES.iter().find(|e| e.region == region).map(|e| e.name)
}

pub fn edge_to_region(edge: &str) -> Option<&'static str> {
    find_edge(edge).map(|e| e.region)
}

/// Signaling host for an edge name. Unknown edges are passed through.
pub fn edge_host(edge: &str) -> String {
    match find_edge(edge) {
        Some(e) => e.host.to_string(),
        None => format!("voice-js.{edge}.twilio.com"),
    }
}

/// Signaling host for a legacy region code.
pub fn region_host(region: &str) -> String {
    match region_to_edge(region) {
        Some(edge) => edge_host(edge),
        None => format!("chunderw-vpc-gll-{}.twilio.com", canonical_region(region)),
    }
}

pub fn signaling_uri(host: &str) -> String {
    format!("wss://{host}/signal")
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Resolves the configured edge(s) or region into an ordered, de-duplicated
/// list of signaling URIs. The first entry is the preferred endpoint.
pub fn resolve_uris(
    edge: Option<&EdgeConfig>,
    region: Option<&str>,
) -> Result<Vec<String>, EdgeError> {
    let hosts = match (edge, region) {
        (Some(_), Some(_)) => return Err(EdgeError::EdgeAndRegion),
        (Some(edges), None) => {
            let mut hosts = Vec::new();
            for name in edges.names() {
                let name = normalize(name);
                if name.is_empty() {
                    return Err(EdgeError::EmptyEdge);
                }
                hosts.push(edge_host(&name));
            }
            if hosts.is_empty() {
                hosts.push(edge_host(DEFAULT_EDGE));
            }
            hosts
        }
        (None, Some(region)) => {
            let region = normalize(region);
            if region.is_empty() {
                return Err(EdgeError::EmptyRegion);
            }
            vec![region_host(&region)]
        }
        (None, None) => vec![edge_host(DEFAULT_EDGE)],
    };

    let mut uris: Vec<String> = Vec::with_capacity(hosts.len());
    for host in hosts {
        let uri = signaling_uri(&host);
        if !uris.contains(&uri) {
            uris.push(uri);
        }
    }
    Ok(uris)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_roaming() {
        let uris = resolve_uris(None, None).unwrap();
        assert_eq!(uris, vec!["wss://chunderw-vpc-gll.twilio.com/signal"]);
    }

    #[test]
    fn known_and_unknown_edges_keep_order() {
        let edges = EdgeConfig::Ordered(vec![
            "foo".to_string(),
            "bar".to_string(),
            "ashburn".to_string(),
        ]);
        let uris = resolve_uris(Some(&edges), None).unwrap();
        assert_eq!(
            uris,
            vec![
                "wss://voice-js.foo.twilio.com/signal",
                "wss://voice-js.bar.twilio.com/signal",
                "wss://chunderw-vpc-gll-us1.twilio.com/signal",
            ]
        );
    }

    #[test]
    fn duplicate_edges_are_removed() {
        let edges = EdgeConfig::Ordered(vec![
            "ashburn".to_string(),
            "Ashburn ".to_string(),
            "dublin".to_string(),
        ]);
        let uris = resolve_uris(Some(&edges), None).unwrap();
        assert_eq!(uris.len(), 2);
        assert_eq!(uris[1], "wss://chunderw-vpc-gll-ie1.twilio.com/signal");
    }

    #[test]
    fn regions_translate_through_edges() {
        assert_eq!(
            resolve_uris(None, Some("ie1")).unwrap(),
            vec!["wss://chunderw-vpc-gll-ie1.twilio.com/signal"]
        );
        assert_eq!(
            resolve_uris(None, Some("gll")).unwrap(),
            vec!["wss://chunderw-vpc-gll.twilio.com/signal"]
        );
        assert_eq!(
            resolve_uris(None, Some("us-va")).unwrap(),
            vec!["wss://chunderw-vpc-gll-us1.twilio.com/signal"]
        );
        assert_eq!(
            resolve_uris(None, Some("au")).unwrap(),
            vec!["wss://chunderw-vpc-gll-au1.twilio.com/signal"]
        );
    }

    #[test]
    fn unknown_region_builds_host() {
        assert_eq!(
            resolve_uris(None, Some("xx9")).unwrap(),
            vec!["wss://chunderw-vpc-gll-xx9.twilio.com/signal"]
        );
    }

    #[test]
    fn edge_and_region_are_exclusive() {
        let edge = EdgeConfig::from("ashburn");
        assert_eq!(
            resolve_uris(Some(&edge), Some("us1")),
            Err(EdgeError::EdgeAndRegion)
        );
    }

    #[test]
    fn empty_names_are_rejected() {
        let edge = EdgeConfig::from("  ");
        assert_eq!(resolve_uris(Some(&edge), None), Err(EdgeError::EmptyEdge));
        assert_eq!(resolve_uris(None, Some("")), Err(EdgeError::EmptyRegion));
    }

    #[test]
    fn reverse_lookups() {
        assert_eq!(edge_to_region("tokyo-ix"), Some("jp1-ix"));
        assert_eq!(region_to_edge("sg"), Some("singapore"));
        assert_eq!(region_to_edge("nowhere"), None);
    }

    #[test]
    fn edge_config_deserializes_both_shapes() {
        let single: EdgeConfig = serde_json::from_str("\"sydney\"").unwrap();
        assert_eq!(single, EdgeConfig::Single("sydney".to_string()));
        let ordered: EdgeConfig = serde_json::from_str("[\"sydney\",\"tokyo\"]").unwrap();
        assert_eq!(
            ordered,
            EdgeConfig::Ordered(vec!["sydney".to_string(), "tokyo".to_string()])
        );
    }
}
