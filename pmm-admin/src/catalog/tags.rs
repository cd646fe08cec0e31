//! Flat catalog tags <-> [`ServiceMeta`].
//!
//! The catalog stores metadata as `prefix_value` strings. Nothing outside
//! the catalog client sees that encoding.

use shared::protocol::{TAG_ALIAS, TAG_CLUSTER, TAG_NODE_TYPE, TAG_REPLSET, TAG_SCHEME};
use shared::types::ServiceMeta;

pub fn alias_tag(alias: &str) -> String {
    format!("{}{}", TAG_ALIAS, alias)
}

pub fn to_tags(meta: &ServiceMeta) -> Vec<String> {
    let mut tags: Vec<String> = meta.aliases.iter().map(|a| alias_tag(a)).collect();

    let optional = [
        (TAG_NODE_TYPE, &meta.node_type),
        (TAG_REPLSET, &meta.replset),
        (TAG_CLUSTER, &meta.cluster),
        (TAG_SCHEME, &meta.scheme),
    ];
    for (prefix, value) in optional {
        if let Some(v) = value {
            tags.push(format!("{}{}", prefix, v));
        }
    }

    tags.extend(meta.extra_tags.iter().cloned());
    tags
}

pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> ServiceMeta {
    let mut meta = ServiceMeta::default();

    for tag in tags {
        let tag = tag.as_ref();
        if let Some(alias) = tag.strip_prefix(TAG_ALIAS) {
            meta.aliases.insert(alias.to_string());
        } else if let Some(v) = tag.strip_prefix(TAG_NODE_TYPE) {
            meta.node_type = Some(v.to_string());
        } else if let Some(v) = tag.strip_prefix(TAG_REPLSET) {
            meta.replset = Some(v.to_string());
        } else if let Some(v) = tag.strip_prefix(TAG_CLUSTER) {
            meta.cluster = Some(v.to_string());
        } else if let Some(v) = tag.strip_prefix(TAG_SCHEME) {
            meta.scheme = Some(v.to_string());
        } else {
            meta.extra_tags.push(tag.to_string());
        }
    }

    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mongodb_tags() {
        let meta = from_tags(&[
            "alias_rs1-a",
            "nodetype_mongod",
            "replset_rs1",
            "cluster_prod",
            "scheme_https",
            "team=dba",
        ]);

        assert_eq!(meta.alias(), Some("rs1-a"));
        assert_eq!(meta.node_type.as_deref(), Some("mongod"));
        assert_eq!(meta.replset.as_deref(), Some("rs1"));
        assert_eq!(meta.cluster.as_deref(), Some("prod"));
        assert_eq!(meta.scheme.as_deref(), Some("https"));
        assert_eq!(meta.extra_tags, vec!["team=dba".to_string()]);
    }

    #[test]
    fn test_queries_service_keeps_every_alias() {
        let mut meta = ServiceMeta::with_alias("db2");
        meta.aliases.insert("db1".to_string());

        let tags = to_tags(&meta);
        assert_eq!(tags, vec!["alias_db1".to_string(), "alias_db2".to_string()]);
        assert_eq!(from_tags(&tags), meta);
    }
}
