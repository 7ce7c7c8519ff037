//! Attribute probe - glob over a grain or pillar value

use super::Params;
use crate::executor::{Probe, Verdict};
use crate::glob::GlobPattern;
use serde_yaml::Mapping;
use trubble_core::attributes::{scalar_strings, AttributeSource};
use trubble_core::{AttributeSnapshot, Error, Result};

pub struct GrainProbe;

impl Probe for GrainProbe {
    fn kind(&self) -> &str {
        "grain"
    }

    fn evaluate(&self, params: &Mapping, snapshot: &AttributeSnapshot) -> Result<Verdict> {
        let params = Params::new(self.kind(), params);
        let key = params.str("grain")?;
        let pattern = GlobPattern::new(params.str("pattern")?)?;
        let source = match params.opt_str("source")? {
            None | Some("grains") => AttributeSource::Grains,
            Some("pillar") => AttributeSource::Pillar,
            Some(other) => {
                return Err(Error::probe(
                    self.kind(),
                    format!("unknown attribute source '{}'", other),
                ))
            }
        };

        let values = match snapshot.get(source, key) {
            Some(value) => scalar_strings(value),
            None => {
                return Ok(Verdict::fail("missing", pattern.as_str())
                    .with_details(format!("attribute '{}' is not set", key)))
            }
        };

        if values.iter().any(|v| pattern.is_match(v)) {
            Ok(Verdict::pass(values.join(",")))
        } else {
            Ok(Verdict::fail(values.join(","), pattern.as_str()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluate(yaml: &str) -> Result<Verdict> {
        let snapshot = AttributeSnapshot::new()
            .with_grain("os_family", "Debian")
            .with_grain("ipv4", json!(["127.0.0.1", "10.0.0.5"]))
            .with_pillar("tier", "gold");
        GrainProbe.evaluate(&serde_yaml::from_str(yaml).unwrap(), &snapshot)
    }

    #[test]
    fn test_grain_probe() {
        assert!(evaluate("grain: os_family\npattern: Deb*").unwrap().passed);
        assert!(evaluate("grain: ipv4\npattern: '10.*'").unwrap().passed);
        assert!(!evaluate("grain: os_family\npattern: RedHat").unwrap().passed);
        assert!(evaluate("grain: tier\npattern: gold\nsource: pillar").unwrap().passed);

        let missing = evaluate("grain: kernel\npattern: '*'").unwrap();
        assert!(!missing.passed);
        assert_eq!(missing.actual, "missing");
    }

    #[test]
    fn test_grain_probe_bad_params() {
        assert!(evaluate("pattern: '*'").is_err());
        assert!(evaluate("grain: os\npattern: '*'\nsource: env").is_err());
    }
}
