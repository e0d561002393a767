//! Compiled rule sources
//!
//! A [`RuleSource`] is the validated, decoded form of one compiled filter
//! list. Sources are immutable once loaded and shared by every index built
//! over them; their checksum identifies the exact bytes they came from.

mod format;

pub use format::*;

use crate::hash::buffer_checksum;
use crate::layout::{read_u32_le, read_u8, write_container, Container, FormatError};
use crate::types::{ActivationType, AnchorType, Decision, Modifier, Party, ResourceType, Rule};

/// Errors reported for a rule source that cannot be used.
pub type StoreError = FormatError;

/// Descriptive header of a filter list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetadata {
    pub title: String,
    pub homepage: String,
    pub license: String,
    /// Suggested update interval
    pub expires_hours: Option<u32>,
    pub version: String,
}

/// Decoded, checksummed rule source.
#[derive(Debug, Clone)]
pub struct RuleSource {
    metadata: SourceMetadata,
    rules: Vec<Rule>,
    checksum: String,
}

impl RuleSource {
    /// Encode and wrap rules without a round-trip through bytes.
    pub fn from_rules(metadata: SourceMetadata, rules: Vec<Rule>) -> Self {
        let bytes = Self::encode(&metadata, &rules);
        Self {
            metadata,
            rules,
            checksum: buffer_checksum(&bytes),
        }
    }

    /// Serialize rules and metadata into the versioned binary form.
    pub fn encode(metadata: &SourceMetadata, rules: &[Rule]) -> Vec<u8> {
        let mut strings = StringPool::new();
        let mut lists = ListPool::new();

        let mut meta = Vec::new();
        let expires = metadata.expires_hours.map(|h| h.to_string()).unwrap_or_default();
        let pairs = [
            (metadata_key::TITLE, metadata.title.as_str()),
            (metadata_key::HOMEPAGE, metadata.homepage.as_str()),
            (metadata_key::LICENSE, metadata.license.as_str()),
            (metadata_key::EXPIRES, expires.as_str()),
            (metadata_key::VERSION, metadata.version.as_str()),
        ];
        let present: Vec<_> = pairs.iter().filter(|(_, v)| !v.is_empty()).collect();
        meta.extend_from_slice(&(present.len() as u32).to_le_bytes());
        for (key, value) in present {
            push_str_ref(&mut meta, strings.intern(key));
            push_str_ref(&mut meta, strings.intern(value));
        }

        let mut records = Vec::with_capacity(rules.len() * RULE_RECORD_SIZE);
        for rule in rules {
            let mut flags = 0u8;
            if rule.is_case_sensitive {
                flags |= rule_flags::CASE_SENSITIVE;
            }
            if rule.host.is_some() {
                flags |= rule_flags::HAS_HOST;
            }

            records.push(rule.decision as u8);
            records.push(rule.modifier as u8);
            records.push(rule.anchor_type.bits());
            records.push(rule.party as u8);
            records.push(rule.activation_types.bits());
            records.push(flags);
            records.extend_from_slice(&[0, 0]);
            records.extend_from_slice(&rule.resource_types.bits().to_le_bytes());
            push_str_ref(&mut records, strings.intern(&rule.pattern));
            push_str_ref(&mut records, strings.intern(rule.host.as_deref().unwrap_or("")));
            push_str_ref(&mut records, strings.intern(&rule.original_rule_text));
            for list in [
                &rule.modifier_values,
                &rule.included_domains,
                &rule.excluded_domains,
                &rule.ad_domains_and_query_triggers,
            ] {
                records.extend_from_slice(&lists.push(list, &mut strings).to_le_bytes());
            }
        }

        write_container(
            MAGIC,
            RULES_FORMAT_VERSION,
            rules.len() as u32,
            &[
                (SectionId::StrPool as u16, strings.build()),
                (SectionId::Lists as u16, lists.build()),
                (SectionId::Metadata as u16, meta),
                (SectionId::Rules as u16, records),
            ],
        )
    }

    /// Validate and decode a compiled source.
    pub fn load(data: &[u8]) -> Result<Self, StoreError> {
        let container = Container::load(data, MAGIC, RULES_FORMAT_VERSION)?;
        let pool = container.require(SectionId::StrPool as u16, "string pool")?;
        let lists = container.require(SectionId::Lists as u16, "lists")?;
        let meta = container.require(SectionId::Metadata as u16, "metadata")?;
        let records = container.require(SectionId::Rules as u16, "rules")?;

        let metadata = decode_metadata(meta, pool)?;

        let rule_count = container.item_count as usize;
        if records.len() != rule_count * RULE_RECORD_SIZE {
            return Err(FormatError::InvalidSection(format!(
                "expected {rule_count} rule records, found {} bytes",
                records.len()
            )));
        }

        let rules = (0..rule_count)
            .map(|index| decode_rule(index, &records[index * RULE_RECORD_SIZE..], lists, pool))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!("loaded rule source '{}' with {} rules", metadata.title, rules.len());

        Ok(Self {
            metadata,
            rules,
            checksum: buffer_checksum(data),
        })
    }

    pub fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Checksum of the bytes this source was decoded from.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn decode_metadata(meta: &[u8], pool: &[u8]) -> Result<SourceMetadata, FormatError> {
    let mut metadata = SourceMetadata::default();
    let count = read_u32_le(meta, 0)? as usize;
    for i in 0..count {
        let at = 4 + i * 2 * STR_REF_SIZE;
        let key = read_str_ref(meta, at, pool)?;
        let value = read_str_ref(meta, at + STR_REF_SIZE, pool)?;
        match key.as_str() {
            metadata_key::TITLE => metadata.title = value,
            metadata_key::HOMEPAGE => metadata.homepage = value,
            metadata_key::LICENSE => metadata.license = value,
            metadata_key::EXPIRES => metadata.expires_hours = value.parse().ok(),
            metadata_key::VERSION => metadata.version = value,
            // Unknown keys come from newer compilers of the same version.
            _ => {}
        }
    }
    Ok(metadata)
}

fn decode_rule(index: usize, record: &[u8], lists: &[u8], pool: &[u8]) -> Result<Rule, FormatError> {
    let invalid = |what: &str| FormatError::InvalidRecord {
        index,
        reason: format!("bad {what}"),
    };

    let decision = Decision::try_from(read_u8(record, rule_record::DECISION)?).map_err(|_| invalid("decision"))?;
    let modifier = Modifier::try_from(read_u8(record, rule_record::MODIFIER)?).map_err(|_| invalid("modifier"))?;
    let party = Party::try_from(read_u8(record, rule_record::PARTY)?).map_err(|_| invalid("party"))?;
    let anchor_type = AnchorType::from_bits(read_u8(record, rule_record::ANCHOR)?).ok_or_else(|| invalid("anchor"))?;
    let activation_types =
        ActivationType::from_bits(read_u8(record, rule_record::ACTIVATION)?).ok_or_else(|| invalid("activation"))?;
    let resource_types = ResourceType::from_bits(read_u32_le(record, rule_record::RESOURCE_TYPES)?)
        .ok_or_else(|| invalid("resource types"))?;
    let flags = read_u8(record, rule_record::FLAGS)?;

    let host = if flags & rule_flags::HAS_HOST != 0 {
        Some(read_str_ref(record, rule_record::HOST, pool)?)
    } else {
        None
    };

    Ok(Rule {
        decision,
        modifier,
        modifier_values: read_list(lists, read_u32_le(record, rule_record::MODIFIER_VALUES)?, pool)?,
        pattern: read_str_ref(record, rule_record::PATTERN, pool)?,
        anchor_type,
        is_case_sensitive: flags & rule_flags::CASE_SENSITIVE != 0,
        host,
        party,
        resource_types,
        activation_types,
        included_domains: read_list(lists, read_u32_le(record, rule_record::INCLUDED_DOMAINS)?, pool)?,
        excluded_domains: read_list(lists, read_u32_le(record, rule_record::EXCLUDED_DOMAINS)?, pool)?,
        ad_domains_and_query_triggers: read_list(lists, read_u32_le(record, rule_record::AD_ATTRIBUTION)?, pool)?,
        original_rule_text: read_str_ref(record, rule_record::TEXT, pool)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{header, write_u16_le};

    fn sample_rules() -> Vec<Rule> {
        vec![
            Rule {
                pattern: "example.com^".to_string(),
                host: Some("example.com".to_string()),
                anchor_type: AnchorType::HOST,
                resource_types: ResourceType::ALL,
                party: Party::Third,
                excluded_domains: vec!["news.example".to_string()],
                original_rule_text: "||example.com^$third-party,domain=~news.example".to_string(),
                ..Rule::default()
            },
            Rule {
                decision: Decision::Pass,
                modifier: Modifier::AdQueryTrigger,
                modifier_values: vec!["gclid".to_string(), "msclkid".to_string()],
                pattern: "/click".to_string(),
                resource_types: ResourceType::DOCUMENT,
                is_case_sensitive: true,
                original_rule_text: "@@/click$document,match-case,ad-query-trigger=gclid|msclkid".to_string(),
                ..Rule::default()
            },
        ]
    }

    fn metadata() -> SourceMetadata {
        SourceMetadata {
            title: "Test list".to_string(),
            homepage: "https://lists.example/".to_string(),
            expires_hours: Some(96),
            ..SourceMetadata::default()
        }
    }

    #[test]
    fn encoded_source_loads_back() {
        let bytes = RuleSource::encode(&metadata(), &sample_rules());
        let source = RuleSource::load(&bytes).expect("source should load");

        assert_eq!(source.rules(), sample_rules().as_slice());
        assert_eq!(source.metadata(), &metadata());
        assert_eq!(source.checksum(), buffer_checksum(&bytes));
    }

    #[test]
    fn from_rules_checksum_matches_encoded_bytes() {
        let bytes = RuleSource::encode(&metadata(), &sample_rules());
        let source = RuleSource::from_rules(metadata(), sample_rules());
        assert_eq!(source.checksum(), RuleSource::load(&bytes).unwrap().checksum());
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn single_byte_change_is_rejected() {
        let mut bytes = RuleSource::encode(&metadata(), &sample_rules());
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(RuleSource::load(&bytes), Err(FormatError::Crc32Mismatch { .. })));
    }

    #[test]
    fn newer_format_version_is_refused() {
        let mut bytes = RuleSource::encode(&metadata(), &sample_rules());
        write_u16_le(&mut bytes, header::VERSION, RULES_FORMAT_VERSION + 1);
        assert_eq!(
            RuleSource::load(&bytes).unwrap_err(),
            FormatError::UnsupportedVersion {
                found: RULES_FORMAT_VERSION + 1,
                supported: RULES_FORMAT_VERSION,
            }
        );
    }

    #[test]
    fn empty_source_is_valid() {
        let source = RuleSource::from_rules(SourceMetadata::default(), Vec::new());
        assert!(source.is_empty());
        let bytes = RuleSource::encode(&SourceMetadata::default(), &[]);
        assert!(RuleSource::load(&bytes).unwrap().is_empty());
    }
}
