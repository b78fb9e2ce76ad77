//! Rule parsing.
//!
//! # Responsibilities
//! - Parse `TYPE,payload,target[,params]` rule lines
//! - Keep the rule's references (target, rule-set, sub-rule) for validation
//!
//! # Design Decisions
//! - Matching is the dispatch engine's job; a `Rule` is data only
//! - `MATCH` has no payload: `MATCH,target`

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleType {
    Domain,
    DomainSuffix,
    DomainKeyword,
    GeoSite,
    GeoIp,
    IpCidr,
    SrcIpCidr,
    DstPort,
    SrcPort,
    ProcessName,
    Network,
    RuleSet,
    SubRule,
    Match,
}

impl RuleType {
    pub(crate) fn parse(s: &str) -> Option<Self> {
        let t = match s.to_ascii_uppercase().as_str() {
            "DOMAIN" => RuleType::Domain,
            "DOMAIN-SUFFIX" => RuleType::DomainSuffix,
            "DOMAIN-KEYWORD" => RuleType::DomainKeyword,
            "GEOSITE" => RuleType::GeoSite,
            "GEOIP" => RuleType::GeoIp,
            "IP-CIDR" | "IP-CIDR6" => RuleType::IpCidr,
            "SRC-IP-CIDR" => RuleType::SrcIpCidr,
            "DST-PORT" => RuleType::DstPort,
            "SRC-PORT" => RuleType::SrcPort,
            "PROCESS-NAME" => RuleType::ProcessName,
            "NETWORK" => RuleType::Network,
            "RULE-SET" => RuleType::RuleSet,
            "SUB-RULE" => RuleType::SubRule,
            "MATCH" => RuleType::Match,
            _ => return None,
        };
        Some(t)
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleType::Domain => "DOMAIN",
            RuleType::DomainSuffix => "DOMAIN-SUFFIX",
            RuleType::DomainKeyword => "DOMAIN-KEYWORD",
            RuleType::GeoSite => "GEOSITE",
            RuleType::GeoIp => "GEOIP",
            RuleType::IpCidr => "IP-CIDR",
            RuleType::SrcIpCidr => "SRC-IP-CIDR",
            RuleType::DstPort => "DST-PORT",
            RuleType::SrcPort => "SRC-PORT",
            RuleType::ProcessName => "PROCESS-NAME",
            RuleType::Network => "NETWORK",
            RuleType::RuleSet => "RULE-SET",
            RuleType::SubRule => "SUB-RULE",
            RuleType::Match => "MATCH",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("rule {0:?} is malformed")]
    Malformed(String),
    #[error("unsupported rule type {0}")]
    UnknownType(String),
    #[error("rule {rule:?} has invalid payload: {reason}")]
    InvalidPayload { rule: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub rule_type: RuleType,
    pub payload: String,
    /// Proxy name for ordinary rules, sub-rule set name for `SUB-RULE`.
    pub target: String,
    pub params: Vec<String>,
}

impl Rule {
    pub fn parse(line: &str) -> Result<Self, RuleParseError> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let rule_type = parts
            .first()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RuleParseError::Malformed(line.to_string()))?;
        let rule_type =
            RuleType::parse(rule_type).ok_or_else(|| RuleParseError::UnknownType(rule_type.to_string()))?;

        if rule_type == RuleType::Match {
            let target = parts
                .get(1)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| RuleParseError::Malformed(line.to_string()))?;
            return Ok(Self {
                rule_type,
                payload: String::new(),
                target: target.to_string(),
                params: Vec::new(),
            });
        }

        if parts.len() < 3 || parts[1].is_empty() || parts[2].is_empty() {
            return Err(RuleParseError::Malformed(line.to_string()));
        }

        let payload = parts[1].to_string();
        if matches!(rule_type, RuleType::IpCidr | RuleType::SrcIpCidr)
            && payload.parse::<ipnet::IpNet>().is_err()
        {
            return Err(RuleParseError::InvalidPayload {
                rule: line.to_string(),
                reason: "not a CIDR".into(),
            });
        }

        Ok(Self {
            rule_type,
            payload,
            target: parts[2].to_string(),
            params: parts[3..].iter().map(|s| s.to_string()).collect(),
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rule_type == RuleType::Match {
            return write!(f, "MATCH,{}", self.target);
        }
        write!(f, "{},{},{}", self.rule_type, self.payload, self.target)?;
        for p in &self.params {
            write!(f, ",{}", p)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_rules() {
        let r = Rule::parse("DOMAIN-SUFFIX,google.com,Proxy").unwrap();
        assert_eq!(r.rule_type, RuleType::DomainSuffix);
        assert_eq!(r.payload, "google.com");
        assert_eq!(r.target, "Proxy");

        let r = Rule::parse("IP-CIDR,10.0.0.0/8,DIRECT,no-resolve").unwrap();
        assert_eq!(r.params, vec!["no-resolve".to_string()]);
        assert_eq!(r.to_string(), "IP-CIDR,10.0.0.0/8,DIRECT,no-resolve");

        let r = Rule::parse("MATCH,Auto").unwrap();
        assert_eq!(r.target, "Auto");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Rule::parse("FOO,bar,DIRECT"), Err(RuleParseError::UnknownType(_))));
        assert!(matches!(Rule::parse("DOMAIN,example.com"), Err(RuleParseError::Malformed(_))));
        assert!(matches!(Rule::parse("MATCH"), Err(RuleParseError::Malformed(_))));
        assert!(matches!(
            Rule::parse("IP-CIDR,300.0.0.0/8,DIRECT"),
            Err(RuleParseError::InvalidPayload { .. })
        ));
    }
}
