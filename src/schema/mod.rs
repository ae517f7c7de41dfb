//! Key and attribute naming for the wide-row table
//!
//! Every partition key, sort key, index key, and composite attribute name in
//! the table is produced by the constructors in this module, so that writers,
//! queries, and the stream aggregator always agree on the layout. All
//! functions are pure; no I/O happens here.
//!
//! Layout summary:
//!
//! | Record            | PK                                        | SK                          |
//! |-------------------|-------------------------------------------|-----------------------------|
//! | Entity metadata   | `{ns}/ENTITY#{id}`                        | `#META`                     |
//! | Bucket shard      | `{ns}/BUCKET#{entity}#{resource}#{shard}` | `#STATE`                    |
//! | System config     | `{ns}/SYSTEM`                             | `#CONFIG`                   |
//! | Resource config   | `{ns}/RESOURCE#{resource}`                | `#CONFIG`                   |
//! | Entity config     | `{ns}/ENTITY#{id}`                        | `#CONFIG#{resource}`        |
//! | Config registry   | `{ns}/SYSTEM`                             | `#CONFIG_RESOURCES`         |
//! | Usage snapshot    | `{ns}/ENTITY#{id}`                        | `#USAGE#{resource}#{start}` |
//! | Audit event       | `{ns}/AUDIT#{entity}`                     | `#AUDIT#{uuidv7}`           |
//! | Namespace forward | `_/SYSTEM`                                | `#NAMESPACE#{name}`         |
//! | Namespace reverse | `_/SYSTEM`                                | `#NSID#{id}`                |
//! | Version record    | `_/SYSTEM`                                | `#VERSION`                  |
//! | Provisioner state | `{ns}/SYSTEM`                             | `#PROVISIONER`              |

// ============================================================================
// Constants
// ============================================================================

/// The reserved namespace holding shared records (registry, version record).
pub const RESERVED_NAMESPACE: &str = "_";

/// Length of minted namespace id tokens.
pub const NAMESPACE_ID_LEN: usize = 8;

/// Virtual limit tracking write-capacity pressure on a bucket shard.
///
/// The aggregator watches this limit's consumption to decide when to double
/// `shard_count`. It never appears in user-facing limit configuration.
pub const WCU_LIMIT_NAME: &str = "__wcu__";

/// Schema version written to the version record and checked at client init.
pub const SCHEMA_VERSION: u32 = 3;

/// Sort key for entity metadata.
pub const SK_META: &str = "#META";

/// Sort key for bucket shard state.
pub const SK_STATE: &str = "#STATE";

/// Sort key prefix for configuration records.
pub const SK_CONFIG: &str = "#CONFIG";

/// Sort key of the per-namespace config registry item.
pub const SK_CONFIG_RESOURCES: &str = "#CONFIG_RESOURCES";

/// Sort key prefix for usage snapshots.
pub const SK_USAGE: &str = "#USAGE";

/// Sort key prefix for audit events.
pub const SK_AUDIT: &str = "#AUDIT";

/// Sort key of the version record.
pub const SK_VERSION: &str = "#VERSION";

/// Sort key of the provisioner managed-set record.
pub const SK_PROVISIONER: &str = "#PROVISIONER";

/// Bucket counter fields: current tokens (millitokens).
pub const FIELD_TK: &str = "tk";
/// Bucket counter fields: capacity (millitokens).
pub const FIELD_CP: &str = "cp";
/// Bucket counter fields: burst ceiling (millitokens).
pub const FIELD_BX: &str = "bx";
/// Bucket counter fields: refill amount per period (millitokens).
pub const FIELD_RA: &str = "ra";
/// Bucket counter fields: refill period (milliseconds).
pub const FIELD_RP: &str = "rp";
/// Bucket counter fields: total consumed (millitokens, monotonic).
pub const FIELD_TC: &str = "tc";

/// All bucket field suffixes, in storage order.
pub const BUCKET_FIELDS: [&str; 6] = [FIELD_TK, FIELD_CP, FIELD_BX, FIELD_RA, FIELD_RP, FIELD_TC];

/// Config field suffixes stored on config records (no live counters).
pub const CONFIG_FIELDS: [&str; 4] = [FIELD_CP, FIELD_BX, FIELD_RA, FIELD_RP];

const BUCKET_ATTR_PREFIX: &str = "b_";
const LIMIT_ATTR_PREFIX: &str = "l_";
const REGISTRY_ATTR_PREFIX: &str = "rc_";

// ============================================================================
// Partition keys
// ============================================================================

/// PK of an entity partition (metadata, entity configs, snapshots).
pub fn pk_entity(ns: &str, entity_id: &str) -> String {
    format!("{ns}/ENTITY#{entity_id}")
}

/// PK of a bucket shard.
pub fn pk_bucket(ns: &str, entity_id: &str, resource: &str, shard: u32) -> String {
    format!("{ns}/BUCKET#{entity_id}#{resource}#{shard}")
}

/// PK of the per-namespace system partition.
pub fn pk_system(ns: &str) -> String {
    format!("{ns}/SYSTEM")
}

/// PK of a resource-level config partition.
pub fn pk_resource(ns: &str, resource: &str) -> String {
    format!("{ns}/RESOURCE#{resource}")
}

/// PK of an entity's audit partition.
pub fn pk_audit(ns: &str, entity_id: &str) -> String {
    format!("{ns}/AUDIT#{entity_id}")
}

/// PK prefix owning every row of an entity (used for cascade deletes).
pub fn pk_entity_prefix(ns: &str, entity_id: &str) -> String {
    pk_entity(ns, entity_id)
}

/// PK prefix of all bucket shards of one (entity, resource).
pub fn pk_bucket_prefix(ns: &str, entity_id: &str, resource: &str) -> String {
    format!("{ns}/BUCKET#{entity_id}#{resource}#")
}

// ============================================================================
// Sort keys
// ============================================================================

/// SK of a config record; entity-level configs carry the resource suffix.
pub fn sk_config(resource: Option<&str>) -> String {
    match resource {
        Some(r) => format!("{SK_CONFIG}#{r}"),
        None => SK_CONFIG.to_string(),
    }
}

/// SK of a usage snapshot for one resource and window start.
pub fn sk_usage(resource: &str, window_start: &str) -> String {
    format!("{SK_USAGE}#{resource}#{window_start}")
}

/// SK of an audit event. `event_id` must sort in creation order (UUIDv7).
pub fn sk_audit(event_id: &str) -> String {
    format!("{SK_AUDIT}#{event_id}")
}

/// SK of a namespace forward record (name -> id).
pub fn sk_namespace(name: &str) -> String {
    format!("#NAMESPACE#{name}")
}

/// SK of a namespace reverse record (id -> name, status).
pub fn sk_nsid(id: &str) -> String {
    format!("#NSID#{id}")
}

// ============================================================================
// Secondary index keys
// ============================================================================

/// GSI2 partition key: groups rows by resource for cross-entity aggregation.
pub fn gsi2_pk_resource(ns: &str, resource: &str) -> String {
    format!("{ns}/RESOURCE#{resource}")
}

/// GSI2 sort key for bucket shards under a resource.
pub fn gsi2_sk_bucket(entity_id: &str, shard: u32) -> String {
    format!("ENTITY#{entity_id}#{shard}")
}

/// GSI2 sort key for usage snapshots under a resource.
pub fn gsi2_sk_usage(window_start: &str, entity_id: &str) -> String {
    format!("USAGE#{window_start}#{entity_id}")
}

/// GSI3 partition key: groups bucket shards by owning entity.
pub fn gsi3_pk_entity(ns: &str, entity_id: &str) -> String {
    format!("{ns}/ENTITY#{entity_id}")
}

/// GSI3 sort key: one bucket shard of the entity.
pub fn gsi3_sk_bucket(resource: &str, shard: u32) -> String {
    format!("BUCKET#{resource}#{shard}")
}

// ============================================================================
// Composite attributes
// ============================================================================

/// Attribute name of one bucket counter: `b_{limit}_{field}`.
pub fn bucket_attr(limit_name: &str, field: &str) -> String {
    format!("{BUCKET_ATTR_PREFIX}{limit_name}_{field}")
}

/// Attribute name of one config field: `l_{limit}_{field}`.
pub fn limit_attr(limit_name: &str, field: &str) -> String {
    format!("{LIMIT_ATTR_PREFIX}{limit_name}_{field}")
}

/// Attribute name of one config-registry counter: `rc_{resource}`.
pub fn registry_attr(resource: &str) -> String {
    format!("{REGISTRY_ATTR_PREFIX}{resource}")
}

/// Parse a bucket attribute name back into `(limit_name, field)`.
///
/// Returns `None` for attributes that are not bucket counters. Limit names
/// may themselves contain underscores, so the field suffix is matched
/// against the known set rather than split positionally.
pub fn parse_bucket_attr(attr: &str) -> Option<(&str, &str)> {
    let rest = attr.strip_prefix(BUCKET_ATTR_PREFIX)?;
    for field in BUCKET_FIELDS {
        if let Some(name) = rest.strip_suffix(field) {
            let name = name.strip_suffix('_')?;
            if !name.is_empty() {
                return Some((name, field));
            }
        }
    }
    None
}

/// Parse a config attribute name back into `(limit_name, field)`.
pub fn parse_limit_attr(attr: &str) -> Option<(&str, &str)> {
    let rest = attr.strip_prefix(LIMIT_ATTR_PREFIX)?;
    for field in CONFIG_FIELDS {
        if let Some(name) = rest.strip_suffix(field) {
            let name = name.strip_suffix('_')?;
            if !name.is_empty() {
                return Some((name, field));
            }
        }
    }
    None
}

/// Parse a registry attribute back into the resource name.
pub fn parse_registry_attr(attr: &str) -> Option<&str> {
    attr.strip_prefix(REGISTRY_ATTR_PREFIX)
        .filter(|r| !r.is_empty())
}

/// Enumerate the limit names present in a set of attribute names.
///
/// Scans for `b_{name}_tc` counters, which every stored limit carries.
pub fn limit_names_in<'a, I>(attrs: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names: Vec<String> = attrs
        .into_iter()
        .filter_map(|a| match parse_bucket_attr(a) {
            Some((name, FIELD_TC)) => Some(name.to_string()),
            _ => None,
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

// ============================================================================
// Name validation
// ============================================================================

/// Check an entity id, resource name, or namespace name for key safety.
///
/// `#` and `/` are structural in keys and must not appear in user names.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 256
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Check a limit name. Limit names become attribute name segments, so the
/// alphabet is tighter than for entity names: `[A-Za-z0-9_]+`.
pub fn is_valid_limit_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pk_constructors() {
        assert_eq!(pk_entity("_", "user-1"), "_/ENTITY#user-1");
        assert_eq!(pk_bucket("a7x3kq2m", "user-1", "gpt-4", 0), "a7x3kq2m/BUCKET#user-1#gpt-4#0");
        assert_eq!(pk_system("a7x3kq2m"), "a7x3kq2m/SYSTEM");
        assert_eq!(pk_resource("_", "gpt-4"), "_/RESOURCE#gpt-4");
        assert_eq!(pk_audit("_", "user-1"), "_/AUDIT#user-1");
    }

    #[test]
    fn test_sk_config_levels() {
        assert_eq!(sk_config(None), "#CONFIG");
        assert_eq!(sk_config(Some("gpt-4")), "#CONFIG#gpt-4");
    }

    #[test]
    fn test_sk_usage_and_audit() {
        assert_eq!(sk_usage("gpt-4", "2024-01-15T14:00:00Z"), "#USAGE#gpt-4#2024-01-15T14:00:00Z");
        assert!(sk_audit("0190b5c8").starts_with("#AUDIT#"));
    }

    #[test]
    fn test_gsi_keys() {
        assert_eq!(gsi2_pk_resource("ns1", "gpt-4"), "ns1/RESOURCE#gpt-4");
        assert_eq!(gsi3_pk_entity("ns1", "e1"), "ns1/ENTITY#e1");
        assert_eq!(gsi3_sk_bucket("gpt-4", 3), "BUCKET#gpt-4#3");
    }

    #[test]
    fn test_bucket_attr_round_trip() {
        let attr = bucket_attr("tpm", FIELD_TK);
        assert_eq!(attr, "b_tpm_tk");
        assert_eq!(parse_bucket_attr(&attr), Some(("tpm", "tk")));
    }

    #[test]
    fn test_bucket_attr_with_underscored_limit() {
        let attr = bucket_attr("gpt_4_tpm", FIELD_TC);
        assert_eq!(attr, "b_gpt_4_tpm_tc");
        assert_eq!(parse_bucket_attr(&attr), Some(("gpt_4_tpm", "tc")));
    }

    #[test]
    fn test_parse_bucket_attr_rejects_non_bucket() {
        assert_eq!(parse_bucket_attr("rf"), None);
        assert_eq!(parse_bucket_attr("entity_id"), None);
        assert_eq!(parse_bucket_attr("b_tk"), None);
        assert_eq!(parse_bucket_attr("l_tpm_cp"), None);
    }

    #[test]
    fn test_limit_attr_round_trip() {
        let attr = limit_attr("rpm", FIELD_CP);
        assert_eq!(attr, "l_rpm_cp");
        assert_eq!(parse_limit_attr(&attr), Some(("rpm", "cp")));
        assert_eq!(parse_limit_attr("b_rpm_tk"), None);
    }

    #[test]
    fn test_registry_attr() {
        assert_eq!(registry_attr("gpt-4"), "rc_gpt-4");
        assert_eq!(parse_registry_attr("rc_gpt-4"), Some("gpt-4"));
        assert_eq!(parse_registry_attr("rx_gpt-4"), None);
    }

    #[test]
    fn test_limit_names_in_enumerates_tc_counters() {
        let attrs = ["b_rpm_tk", "b_rpm_tc", "b_tpm_tc", "rf", "shard_count", "b_tpm_cp"];
        assert_eq!(limit_names_in(attrs), vec!["rpm".to_string(), "tpm".to_string()]);
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("user-1"));
        assert!(is_valid_name("gpt-4.turbo"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a#b"));
        assert!(!is_valid_name("a/b"));

        assert!(is_valid_limit_name("tpm"));
        assert!(is_valid_limit_name(WCU_LIMIT_NAME));
        assert!(!is_valid_limit_name("t-pm"));
        assert!(!is_valid_limit_name(""));
    }
}
