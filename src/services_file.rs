//! The services-of-interest seed list.
//!
//! The daemon starts tracking a configured set of peers at boot, each bound
//! to a datapipe topic. The list ships built in and can be replaced with a
//! small XML document:
//!
//! ```xml
//! <services>
//!   <service name="com.devmode.powerd" topic="powerd"/>
//!   <service name="com.devmode.sensord"/>
//! </services>
//! ```
//!
//! A service without an explicit topic publishes under the last element of
//! its bus name.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(rename = "service", default)]
    services: Vec<ServiceElement>,
}

#[derive(Debug, Deserialize)]
struct ServiceElement {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@topic")]
    topic: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedService {
    pub name: String,
    pub topic: String,
}

/// The built-in seed list.
pub fn defaults() -> Vec<SeedService> {
    [
        ("com.devmode.powerd", "powerd"),
        ("com.devmode.sensord", "sensord"),
        ("com.devmode.usbmoded", "usbmoded"),
    ]
    .into_iter()
    .map(|(name, topic)| SeedService {
        name: name.to_string(),
        topic: topic.to_string(),
    })
    .collect()
}

/// Load the seed list from `path`, or the defaults when none is given.
pub fn load(path: Option<&Path>) -> Result<Vec<SeedService>> {
    match path {
        None => Ok(defaults()),
        Some(path) => {
            let xml = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse(&xml).with_context(|| format!("failed to parse {}", path.display()))
        }
    }
}

fn parse(xml: &str) -> Result<Vec<SeedService>> {
    let doc: Document = quick_xml::de::from_str(xml)?;
    Ok(doc
        .services
        .into_iter()
        .map(|s| {
            let topic = s.topic.unwrap_or_else(|| topic_from_name(&s.name));
            SeedService {
                name: s.name,
                topic,
            }
        })
        .collect())
}

fn topic_from_name(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_services_with_and_without_topics() {
        let xml = r#"
            <services>
              <service name="com.devmode.powerd" topic="power"/>
              <service name="org.example.compositor"/>
            </services>
        "#;
        let seeds = parse(xml).unwrap();
        assert_eq!(
            seeds,
            vec![
                SeedService {
                    name: "com.devmode.powerd".into(),
                    topic: "power".into()
                },
                SeedService {
                    name: "org.example.compositor".into(),
                    topic: "compositor".into()
                },
            ]
        );
    }

    #[test]
    fn empty_document_is_empty() {
        assert!(parse("<services/>").unwrap().is_empty());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse("<services><service/></services>").is_err());
        assert!(parse("not xml").is_err());
    }

    #[test]
    fn no_file_means_defaults() {
        let seeds = load(None).unwrap();
        assert_eq!(seeds, defaults());
        assert!(!seeds.is_empty());
    }
}
